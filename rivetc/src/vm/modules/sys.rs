//! `sys` module: script arguments and host introspection.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::vm::object::Obj;
use crate::vm::value::Value;
use crate::vm::vm::{Unwind, Vm};

use super::{begin_module, module_native};

pub(crate) fn register(vm: &mut Vm) {
    let module = begin_module(vm, "sys");
    module_native(vm, module, "args", sys_args, 0);
    module_native(vm, module, "pid", sys_pid, 0);
    module_native(vm, module, "platform", sys_platform, 0);
    module_native(vm, module, "hostname", sys_hostname, 0);
    module_native(vm, module, "time", sys_time, 0);
}

fn sys_args(vm: &mut Vm, _args: &[Value]) -> Result<Value, Unwind> {
    let arguments = vm.script_args.clone();
    let list: *mut Obj = vm.alloc_list(Vec::new());
    vm.push(Value::object(list));
    for argument in &arguments {
        let s = vm.intern(argument);
        crate::vm::object::list_mut(list).items.push(Value::object(s));
    }
    vm.pop();
    Ok(Value::object(list))
}

fn sys_pid(_vm: &mut Vm, _args: &[Value]) -> Result<Value, Unwind> {
    Ok(Value::number(std::process::id() as f64))
}

fn sys_platform(vm: &mut Vm, _args: &[Value]) -> Result<Value, Unwind> {
    Ok(Value::object(vm.intern(std::env::consts::OS)))
}

fn sys_hostname(vm: &mut Vm, _args: &[Value]) -> Result<Value, Unwind> {
    // No portable hostname in std; the conventional env vars cover the
    // common platforms.
    let name = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default();
    if name.is_empty() {
        return Ok(Value::NIL);
    }
    Ok(Value::object(vm.intern(&name)))
}

fn sys_time(_vm: &mut Vm, _args: &[Value]) -> Result<Value, Unwind> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::number(now))
}
