//! `math` module.

use rand::Rng;

use crate::vm::value::Value;
use crate::vm::vm::{Unwind, Vm};

use super::{begin_module, module_native};

pub(crate) fn register(vm: &mut Vm) {
    let module = begin_module(vm, "math");
    module_native(vm, module, "floor", math_floor, 1);
    module_native(vm, module, "ceil", math_ceil, 1);
    module_native(vm, module, "round", math_round, 1);
    module_native(vm, module, "abs", math_abs, 1);
    module_native(vm, module, "sqrt", math_sqrt, 1);
    module_native(vm, module, "pow", math_pow, 2);
    module_native(vm, module, "min", math_min, 2);
    module_native(vm, module, "max", math_max, 2);
    module_native(vm, module, "random", math_random, 0);
}

fn unary(args: &[Value], op: fn(f64) -> f64) -> Result<Value, Unwind> {
    if !args[0].is_number() {
        return Ok(Value::NIL);
    }
    Ok(Value::number(op(args[0].as_number())))
}

fn binary(args: &[Value], op: fn(f64, f64) -> f64) -> Result<Value, Unwind> {
    if !args[0].is_number() || !args[1].is_number() {
        return Ok(Value::NIL);
    }
    Ok(Value::number(op(args[0].as_number(), args[1].as_number())))
}

fn math_floor(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    unary(args, f64::floor)
}

fn math_ceil(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    unary(args, f64::ceil)
}

fn math_round(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    unary(args, f64::round)
}

fn math_abs(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    unary(args, f64::abs)
}

fn math_sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    unary(args, f64::sqrt)
}

fn math_pow(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    binary(args, f64::powf)
}

fn math_min(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    binary(args, f64::min)
}

fn math_max(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    binary(args, f64::max)
}

fn math_random(_vm: &mut Vm, _args: &[Value]) -> Result<Value, Unwind> {
    Ok(Value::number(rand::thread_rng().gen::<f64>()))
}
