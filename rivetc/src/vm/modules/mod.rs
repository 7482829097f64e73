//! Standard-library modules, each registered as a global map of natives:
//! `fs`, `proc`, `sys`, `math`, `re`.

mod fs;
mod math;
mod proc;
mod re;
mod sys;

use super::object::{map_mut, NativeFn, Obj, ObjBody, ObjNative};
use super::value::Value;
use super::vm::Vm;

pub(crate) fn register_modules(vm: &mut Vm) {
    fs::register(vm);
    proc::register(vm);
    sys::register(vm);
    math::register(vm);
    re::register(vm);
}

/// Create an empty module map and bind it as a global. Returns the map
/// pointer; it stays reachable through the globals table.
fn begin_module(vm: &mut Vm, name: &str) -> *mut Obj {
    let module = vm.alloc_map();
    vm.push(Value::object(module));
    let name_obj = vm.intern(name);
    vm.globals.set(name_obj, Value::object(module));
    vm.pop();
    module
}

fn module_native(vm: &mut Vm, module: *mut Obj, name: &'static str, function: NativeFn, arity: i32) {
    let native = vm.alloc_object(ObjBody::Native(ObjNative {
        function,
        name,
        arity,
    }));
    vm.push(Value::object(native));
    let name_obj = vm.intern(name);
    map_mut(module).table.set(name_obj, Value::object(native));
    vm.pop();
}
