//! `proc` module: process spawning with an argv vector (no shell).

use std::process::Command;

use rivet_syntax::ast::PermKind;

use crate::vm::natives::{shell_result_map, ShellResult};
use crate::vm::object::{list_ref, str_ref};
use crate::vm::value::Value;
use crate::vm::vm::{Unwind, Vm};

use super::{begin_module, module_native};

pub(crate) fn register(vm: &mut Vm) {
    let module = begin_module(vm, "proc");
    module_native(vm, module, "run", proc_run, -1);
    module_native(vm, module, "pid", proc_pid, 0);
}

/// `proc.run(cmd)` or `proc.run(cmd, [args...])`: run a program directly
/// with an argument vector, returning the usual result map. Non-zero exit
/// is reported in the map, not raised — argv-style callers inspect codes.
fn proc_run(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(program) = args.first().filter(|v| v.is_string()) else {
        return Ok(Value::NIL);
    };
    let program = str_ref(program.as_obj()).chars.to_string();

    if !vm.permissions.check(PermKind::Exec, &program) {
        return Err(vm.raise(
            "permission",
            format!("Permission denied: exec \"{}\"", program),
        ));
    }

    let mut argv: Vec<String> = Vec::new();
    if let Some(list) = args.get(1) {
        if !list.is_list() {
            return Ok(Value::NIL);
        }
        for item in &list_ref(list.as_obj()).items {
            if !item.is_string() {
                return Ok(Value::NIL);
            }
            argv.push(str_ref(item.as_obj()).chars.to_string());
        }
    }

    let result = match Command::new(&program).args(&argv).output() {
        Ok(output) => ShellResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        },
        Err(error) => ShellResult {
            stdout: String::new(),
            stderr: error.to_string(),
            exit_code: 127,
        },
    };
    Ok(shell_result_map(vm, &result))
}

fn proc_pid(_vm: &mut Vm, _args: &[Value]) -> Result<Value, Unwind> {
    Ok(Value::number(std::process::id() as f64))
}
