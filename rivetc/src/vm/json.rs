//! JSON conversion between `serde_json::Value` and VM values.
//!
//! Mapping: null <-> nil, numbers <-> f64, objects <-> maps (string keys),
//! arrays <-> lists. Serialization prints integral numbers without a
//! fractional part so `to_json(parse_json(s))` round-trips canonical
//! input.

use super::object::{list_mut, list_ref, map_ref, str_ref};
use super::value::Value;
use super::vm::{Unwind, Vm};

const MAX_JSON_DEPTH: usize = 128;

pub(crate) fn native_parse_json(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_string() {
        return Ok(Value::NIL);
    }
    let text = str_ref(args[0].as_obj()).chars.to_string();
    parse_json_text(vm, &text)
}

pub(crate) fn parse_json_text(vm: &mut Vm, text: &str) -> Result<Value, Unwind> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(json) => Ok(json_to_value(vm, &json)),
        Err(error) => {
            eprintln!("JSON parse error: {}", error);
            Ok(Value::NIL)
        }
    }
}

pub(crate) fn native_to_json(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let json = match value_to_json(args[0], 0) {
        Some(json) => json,
        None => {
            return Err(vm.raise(
                "type",
                "Cannot serialize value to JSON.".to_string(),
            ));
        }
    };
    let text = serde_json::to_string(&json).unwrap_or_else(|_| "null".to_string());
    let result = vm.intern(&text);
    Ok(Value::object(result))
}

fn json_to_value(vm: &mut Vm, json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::NIL,
        serde_json::Value::Bool(b) => Value::boolean(*b),
        serde_json::Value::Number(n) => Value::number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::object(vm.intern(s)),
        serde_json::Value::Array(items) => {
            let list = vm.alloc_list(Vec::with_capacity(items.len()));
            vm.push(Value::object(list));
            for item in items {
                let value = json_to_value(vm, item);
                list_mut(list).items.push(value);
            }
            vm.pop();
            Value::object(list)
        }
        serde_json::Value::Object(fields) => {
            let map = vm.alloc_map();
            vm.push(Value::object(map));
            for (key, value) in fields {
                let value = json_to_value(vm, value);
                vm.map_set_str(map, key, value);
            }
            vm.pop();
            Value::object(map)
        }
    }
}

/// Convert a VM value to JSON. Returns `None` past the depth limit (a
/// cyclic list or map cannot serialize) or for function values.
fn value_to_json(value: Value, depth: usize) -> Option<serde_json::Value> {
    if depth > MAX_JSON_DEPTH {
        return None;
    }
    if value.is_nil() {
        return Some(serde_json::Value::Null);
    }
    if value.is_bool() {
        return Some(serde_json::Value::Bool(value.as_bool()));
    }
    if value.is_number() {
        let n = value.as_number();
        if n == n.trunc() && n.is_finite() && n.abs() < 1e15 {
            return Some(serde_json::Value::Number((n as i64).into()));
        }
        return serde_json::Number::from_f64(n).map(serde_json::Value::Number);
    }
    if value.is_string() {
        return Some(serde_json::Value::String(
            str_ref(value.as_obj()).chars.to_string(),
        ));
    }
    if value.is_list() {
        let mut items = Vec::new();
        for item in &list_ref(value.as_obj()).items {
            items.push(value_to_json(*item, depth + 1)?);
        }
        return Some(serde_json::Value::Array(items));
    }
    if value.is_map() {
        let mut fields = serde_json::Map::new();
        for (key, item) in map_ref(value.as_obj()).table.iter() {
            let key = str_ref(key).chars.to_string();
            fields.insert(key, value_to_json(item, depth + 1)?);
        }
        return Some(serde_json::Value::Object(fields));
    }
    None
}
