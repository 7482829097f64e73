//! `re` module: regular expressions over the `regex` crate's syntax.
//!
//! Patterns compile per call; a malformed pattern raises a catchable
//! error of type `regex`.

use regex::Regex;

use crate::vm::object::{list_mut, str_ref, Obj};
use crate::vm::value::Value;
use crate::vm::vm::{Unwind, Vm};

use super::{begin_module, module_native};

pub(crate) fn register(vm: &mut Vm) {
    let module = begin_module(vm, "re");
    module_native(vm, module, "matches", re_matches, 2);
    module_native(vm, module, "find", re_find, 2);
    module_native(vm, module, "find_all", re_find_all, 2);
    module_native(vm, module, "replace", re_replace, 3);
    module_native(vm, module, "split", re_split, 2);
}

fn two_strings(args: &[Value]) -> Option<(String, String)> {
    if args[0].is_string() && args[1].is_string() {
        Some((
            str_ref(args[0].as_obj()).chars.to_string(),
            str_ref(args[1].as_obj()).chars.to_string(),
        ))
    } else {
        None
    }
}

fn compile(vm: &mut Vm, pattern: &str) -> Result<Regex, Unwind> {
    Regex::new(pattern)
        .map_err(|error| vm.raise("regex", format!("Invalid regex '{}': {}", pattern, error)))
}

fn re_matches(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some((pattern, text)) = two_strings(args) else {
        return Ok(Value::NIL);
    };
    let regex = compile(vm, &pattern)?;
    Ok(Value::boolean(regex.is_match(&text)))
}

fn re_find(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some((pattern, text)) = two_strings(args) else {
        return Ok(Value::NIL);
    };
    let regex = compile(vm, &pattern)?;
    match regex.find(&text) {
        Some(found) => {
            let s = vm.intern(found.as_str());
            Ok(Value::object(s))
        }
        None => Ok(Value::NIL),
    }
}

fn re_find_all(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some((pattern, text)) = two_strings(args) else {
        return Ok(Value::NIL);
    };
    let regex = compile(vm, &pattern)?;
    let matches: Vec<String> = regex
        .find_iter(&text)
        .map(|found| found.as_str().to_string())
        .collect();
    let list: *mut Obj = vm.alloc_list(Vec::new());
    vm.push(Value::object(list));
    for text in &matches {
        let s = vm.intern(text);
        list_mut(list).items.push(Value::object(s));
    }
    vm.pop();
    Ok(Value::object(list))
}

fn re_replace(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_string() || !args[1].is_string() || !args[2].is_string() {
        return Ok(Value::NIL);
    }
    let pattern = str_ref(args[0].as_obj()).chars.to_string();
    let text = str_ref(args[1].as_obj()).chars.to_string();
    let replacement = str_ref(args[2].as_obj()).chars.to_string();
    let regex = compile(vm, &pattern)?;
    let result = regex.replace_all(&text, replacement.as_str()).into_owned();
    let s = vm.intern(&result);
    Ok(Value::object(s))
}

fn re_split(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some((pattern, text)) = two_strings(args) else {
        return Ok(Value::NIL);
    };
    let regex = compile(vm, &pattern)?;
    let parts: Vec<String> = regex.split(&text).map(|part| part.to_string()).collect();
    let list: *mut Obj = vm.alloc_list(Vec::new());
    vm.push(Value::object(list));
    for part in &parts {
        let s = vm.intern(part);
        list_mut(list).items.push(Value::object(s));
    }
    vm.pop();
    Ok(Value::object(list))
}
