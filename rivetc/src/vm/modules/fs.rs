//! `fs` module: file-system queries and mutations, permission-gated.

use rivet_syntax::ast::PermKind;

use crate::vm::object::{str_ref, Obj};
use crate::vm::value::Value;
use crate::vm::vm::{Unwind, Vm};

use super::{begin_module, module_native};

pub(crate) fn register(vm: &mut Vm) {
    let module = begin_module(vm, "fs");
    module_native(vm, module, "exists", fs_exists, 1);
    module_native(vm, module, "is_file", fs_is_file, 1);
    module_native(vm, module, "is_dir", fs_is_dir, 1);
    module_native(vm, module, "mkdir", fs_mkdir, 1);
    module_native(vm, module, "remove", fs_remove, 1);
    module_native(vm, module, "copy", fs_copy, 2);
    module_native(vm, module, "list_dir", fs_list_dir, 1);
    module_native(vm, module, "cwd", fs_cwd, 0);
}

fn path_arg(value: Value) -> Option<String> {
    if value.is_string() {
        Some(str_ref(value.as_obj()).chars.to_string())
    } else {
        None
    }
}

fn check_perm(vm: &mut Vm, kind: PermKind, path: &str) -> Result<(), Unwind> {
    if vm.permissions.check(kind, path) {
        Ok(())
    } else {
        let verb = crate::permission::perm_kind_name(kind);
        Err(vm.raise(
            "permission",
            format!("Permission denied: {} \"{}\"", verb, path),
        ))
    }
}

fn fs_exists(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(path) = path_arg(args[0]) else {
        return Ok(Value::NIL);
    };
    check_perm(vm, PermKind::Read, &path)?;
    Ok(Value::boolean(std::path::Path::new(&path).exists()))
}

fn fs_is_file(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(path) = path_arg(args[0]) else {
        return Ok(Value::NIL);
    };
    check_perm(vm, PermKind::Read, &path)?;
    Ok(Value::boolean(std::path::Path::new(&path).is_file()))
}

fn fs_is_dir(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(path) = path_arg(args[0]) else {
        return Ok(Value::NIL);
    };
    check_perm(vm, PermKind::Read, &path)?;
    Ok(Value::boolean(std::path::Path::new(&path).is_dir()))
}

fn fs_mkdir(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(path) = path_arg(args[0]) else {
        return Ok(Value::FALSE);
    };
    check_perm(vm, PermKind::Write, &path)?;
    Ok(Value::boolean(std::fs::create_dir_all(&path).is_ok()))
}

fn fs_remove(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(path) = path_arg(args[0]) else {
        return Ok(Value::FALSE);
    };
    check_perm(vm, PermKind::Write, &path)?;
    let target = std::path::Path::new(&path);
    let removed = if target.is_dir() {
        std::fs::remove_dir(target).is_ok()
    } else {
        std::fs::remove_file(target).is_ok()
    };
    Ok(Value::boolean(removed))
}

fn fs_copy(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let (Some(from), Some(to)) = (path_arg(args[0]), path_arg(args[1])) else {
        return Ok(Value::FALSE);
    };
    check_perm(vm, PermKind::Read, &from)?;
    check_perm(vm, PermKind::Write, &to)?;
    Ok(Value::boolean(std::fs::copy(&from, &to).is_ok()))
}

fn fs_list_dir(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(path) = path_arg(args[0]) else {
        return Ok(Value::NIL);
    };
    check_perm(vm, PermKind::Read, &path)?;
    let Ok(entries) = std::fs::read_dir(&path) else {
        return Ok(Value::NIL);
    };
    let list: *mut Obj = vm.alloc_list(Vec::new());
    vm.push(Value::object(list));
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let name_obj = vm.intern(&name);
        crate::vm::object::list_mut(list).items.push(Value::object(name_obj));
    }
    vm.pop();
    Ok(Value::object(list))
}

fn fs_cwd(vm: &mut Vm, _args: &[Value]) -> Result<Value, Unwind> {
    match std::env::current_dir() {
        Ok(dir) => {
            let text = dir.to_string_lossy().into_owned();
            Ok(Value::object(vm.intern(&text)))
        }
        Err(_) => Ok(Value::NIL),
    }
}
