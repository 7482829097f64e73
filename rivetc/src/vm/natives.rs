//! Built-in native functions registered as globals.
//!
//! Calling convention: the VM has already arity-checked fixed-arity
//! natives; variadic ones (arity -1) validate their own argument shapes
//! and return `nil` when called nonsensically. Natives that call back
//! into Rivet code (`map_fn`, `filter`, `reduce`, `retry`) re-enter the
//! interpreter through `Vm::call_function`.

use std::io::BufRead;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use rivet_syntax::ast::PermKind;

use super::json::{native_parse_json, native_to_json};
use super::object::{list_mut, list_ref, map_ref, str_ref, NativeFn, ObjBody, ObjNative};
use super::value::Value;
use super::vm::{Unwind, Vm};

pub(crate) fn register_natives(vm: &mut Vm) {
    define(vm, "print", native_print, -1);
    define(vm, "println", native_print, -1);
    define(vm, "input", native_input, -1);
    define(vm, "exit", native_exit, -1);
    define(vm, "clock", native_clock, 0);
    define(vm, "len", native_len, 1);
    define(vm, "type", native_type, 1);
    define(vm, "str", native_str, 1);
    define(vm, "append", native_append, 2);
    define(vm, "pop", native_pop, 1);
    define(vm, "keys", native_keys, 1);
    define(vm, "values", native_values, 1);
    define(vm, "contains", native_contains, 2);
    define(vm, "range", native_range, -1);
    define(vm, "join", native_join, -1);
    define(vm, "exec", native_exec, -1);

    define(vm, "parse_json", native_parse_json, 1);
    define(vm, "to_json", native_to_json, 1);

    define(vm, "read", native_read_file, 1);
    define(vm, "write", native_write_file, 2);

    define(vm, "env", native_env, 1);
    define(vm, "sleep", native_sleep, 1);
    define(vm, "assert", native_assert, -1);

    define(vm, "split", native_split, 2);
    define(vm, "trim", native_trim, 1);
    define(vm, "replace", native_replace, 3);
    define(vm, "upper", native_upper, 1);
    define(vm, "lower", native_lower, 1);
    define(vm, "starts_with", native_starts_with, 2);
    define(vm, "ends_with", native_ends_with, 2);

    define(vm, "sort", native_sort, 1);
    define(vm, "map_fn", native_map_fn, 2);
    define(vm, "filter", native_filter, 2);
    define(vm, "reduce", native_reduce, -1);
    define(vm, "retry", native_retry, 2);

    define(vm, "num", native_num, 1);
    define(vm, "bool", native_bool, 1);

    define(vm, "format", native_format, -1);
    define(vm, "debug", native_debug, -1);
    define(vm, "parallel_exec", native_parallel_exec, 1);
}

pub(crate) fn define(vm: &mut Vm, name: &'static str, function: NativeFn, arity: i32) {
    let native = vm.alloc_object(ObjBody::Native(ObjNative {
        function,
        name,
        arity,
    }));
    vm.push(Value::object(native));
    let name_obj = vm.intern(name);
    let value = vm.peek(0);
    vm.globals.set(name_obj, value);
    vm.pop();
}

fn string_value(vm: &mut Vm, s: &str) -> Value {
    Value::object(vm.intern(s))
}

fn string_arg(value: Value) -> Option<String> {
    if value.is_string() {
        Some(str_ref(value.as_obj()).chars.to_string())
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Output & process control
// ---------------------------------------------------------------------------

fn native_print(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let mut line = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&format!("{}", arg));
    }
    line.push('\n');
    vm.write_output(&line);
    Ok(Value::NIL)
}

fn native_debug(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let mut line = String::from("[DEBUG]");
    for arg in args {
        line.push(' ');
        line.push_str(&format!("{}", arg));
    }
    eprintln!("{}", line);
    Ok(Value::NIL)
}

fn native_input(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if let Some(prompt) = args.first().and_then(|v| string_arg(*v)) {
        vm.write_output(&prompt);
    }
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => Ok(Value::NIL),
        Ok(_) => {
            if line.ends_with('\n') {
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
            }
            Ok(string_value(vm, &line))
        }
    }
}

fn native_exit(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    match args.first() {
        Some(code) if code.is_number() => std::process::exit(code.as_number() as i32),
        Some(message) if message.is_string() => {
            eprintln!("{}", str_ref(message.as_obj()).chars);
            std::process::exit(1);
        }
        _ => std::process::exit(0),
    }
}

fn native_assert(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(&condition) = args.first() else {
        return Ok(Value::NIL);
    };
    if condition.is_falsey() {
        match args.get(1).and_then(|v| string_arg(*v)) {
            Some(message) => eprintln!("Assertion failed: {}", message),
            None => eprintln!("Assertion failed"),
        }
        std::process::exit(1);
    }
    Ok(Value::TRUE)
}

fn native_clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, Unwind> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::number(now))
}

fn native_sleep(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if let Some(seconds) = args.first().filter(|v| v.is_number()) {
        let seconds = seconds.as_number();
        if seconds > 0.0 {
            std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
        }
    }
    Ok(Value::NIL)
}

// ---------------------------------------------------------------------------
// Inspection & conversion
// ---------------------------------------------------------------------------

fn native_len(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let value = args[0];
    if value.is_string() {
        return Ok(Value::number(str_ref(value.as_obj()).chars.len() as f64));
    }
    if value.is_list() {
        return Ok(Value::number(list_ref(value.as_obj()).items.len() as f64));
    }
    Ok(Value::NIL)
}

fn native_type(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    Ok(string_value(vm, args[0].type_name()))
}

fn native_str(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let value = args[0];
    if value.is_string() {
        return Ok(value);
    }
    let text = format!("{}", value);
    Ok(string_value(vm, &text))
}

fn native_num(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let value = args[0];
    if value.is_number() {
        return Ok(value);
    }
    if value.is_string() {
        let text = str_ref(value.as_obj()).chars.trim().to_string();
        return Ok(text
            .parse::<f64>()
            .map(Value::number)
            .unwrap_or(Value::NIL));
    }
    if value.is_bool() {
        return Ok(Value::number(if value.as_bool() { 1.0 } else { 0.0 }));
    }
    Ok(Value::NIL)
}

fn native_bool(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    Ok(Value::boolean(!args[0].is_falsey()))
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

fn native_append(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_list() {
        return Ok(Value::NIL);
    }
    list_mut(args[0].as_obj()).items.push(args[1]);
    Ok(args[0])
}

fn native_pop(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_list() {
        return Ok(Value::NIL);
    }
    Ok(list_mut(args[0].as_obj()).items.pop().unwrap_or(Value::NIL))
}

fn native_keys(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_map() {
        return Ok(Value::NIL);
    }
    let keys: Vec<Value> = map_ref(args[0].as_obj())
        .table
        .iter()
        .map(|(key, _)| Value::object(key))
        .collect();
    Ok(Value::object(vm.alloc_list(keys)))
}

fn native_values(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_map() {
        return Ok(Value::NIL);
    }
    let values: Vec<Value> = map_ref(args[0].as_obj())
        .table
        .iter()
        .map(|(_, value)| value)
        .collect();
    Ok(Value::object(vm.alloc_list(values)))
}

fn native_contains(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let (haystack, needle) = (args[0], args[1]);
    if haystack.is_list() {
        let found = list_ref(haystack.as_obj())
            .items
            .iter()
            .any(|item| item.equals(needle));
        return Ok(Value::boolean(found));
    }
    if haystack.is_string() && needle.is_string() {
        let found = str_ref(haystack.as_obj())
            .chars
            .contains(&*str_ref(needle.as_obj()).chars);
        return Ok(Value::boolean(found));
    }
    if haystack.is_map() && needle.is_string() {
        // Map keys are interned, so the needle IS the key if present.
        let found = map_ref(haystack.as_obj()).table.get(needle.as_obj()).is_some();
        return Ok(Value::boolean(found));
    }
    Ok(Value::FALSE)
}

fn native_range(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if args.len() < 2 || !args[0].is_number() || !args[1].is_number() {
        return Ok(Value::NIL);
    }
    let start = args[0].as_number();
    let end = args[1].as_number();
    let step = match args.get(2) {
        Some(step) if step.is_number() => step.as_number(),
        Some(_) => 1.0,
        None => 1.0,
    };
    if step == 0.0 {
        return Ok(Value::NIL);
    }
    let mut items = Vec::new();
    if step > 0.0 {
        let mut i = start;
        while i < end {
            items.push(Value::number(i));
            i += step;
        }
    } else {
        let mut i = start;
        while i > end {
            items.push(Value::number(i));
            i += step;
        }
    }
    Ok(Value::object(vm.alloc_list(items)))
}

fn native_join(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if args.is_empty() || !args[0].is_list() {
        return Ok(string_value(vm, ""));
    }
    let separator = args.get(1).and_then(|v| string_arg(*v)).unwrap_or_default();
    let parts: Vec<String> = list_ref(args[0].as_obj())
        .items
        .iter()
        .map(|item| format!("{}", item))
        .collect();
    Ok(string_value(vm, &parts.join(&separator)))
}

fn native_sort(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_list() {
        return Ok(Value::NIL);
    }
    let items = &mut list_mut(args[0].as_obj()).items;
    // Swap only adjacent number pairs; everything else keeps its spot.
    let count = items.len();
    for i in 0..count.saturating_sub(1) {
        for j in 0..count - i - 1 {
            if items[j].is_number()
                && items[j + 1].is_number()
                && items[j].as_number() > items[j + 1].as_number()
            {
                items.swap(j, j + 1);
            }
        }
    }
    Ok(args[0])
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

fn native_split(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let (Some(text), Some(delimiter)) = (string_arg(args[0]), string_arg(args[1])) else {
        return Ok(Value::NIL);
    };
    let list = vm.alloc_list(Vec::new());
    vm.push(Value::object(list));
    if delimiter.is_empty() {
        for i in 0..text.as_bytes().len() {
            let piece = String::from_utf8_lossy(&text.as_bytes()[i..i + 1]).into_owned();
            let piece = vm.intern(&piece);
            list_mut(list).items.push(Value::object(piece));
        }
    } else {
        for part in text.split(&delimiter) {
            let piece = vm.intern(part);
            list_mut(list).items.push(Value::object(piece));
        }
    }
    vm.pop();
    Ok(Value::object(list))
}

fn native_trim(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    match string_arg(args[0]) {
        Some(text) => Ok(string_value(vm, text.trim())),
        None => Ok(Value::NIL),
    }
}

fn native_replace(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let (Some(text), Some(from), Some(to)) = (
        string_arg(args[0]),
        string_arg(args[1]),
        string_arg(args[2]),
    ) else {
        return Ok(Value::NIL);
    };
    if from.is_empty() {
        return Ok(args[0]);
    }
    Ok(string_value(vm, &text.replace(&from, &to)))
}

fn native_upper(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    match string_arg(args[0]) {
        Some(text) => Ok(string_value(vm, &text.to_uppercase())),
        None => Ok(Value::NIL),
    }
}

fn native_lower(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    match string_arg(args[0]) {
        Some(text) => Ok(string_value(vm, &text.to_lowercase())),
        None => Ok(Value::NIL),
    }
}

fn native_starts_with(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    match (string_arg(args[0]), string_arg(args[1])) {
        (Some(text), Some(prefix)) => Ok(Value::boolean(text.starts_with(&prefix))),
        _ => Ok(Value::FALSE),
    }
}

fn native_ends_with(_vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    match (string_arg(args[0]), string_arg(args[1])) {
        (Some(text), Some(suffix)) => Ok(Value::boolean(text.ends_with(&suffix))),
        _ => Ok(Value::FALSE),
    }
}

fn native_format(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(template) = args.first().and_then(|v| string_arg(*v)) else {
        return Ok(Value::NIL);
    };
    let mut out = String::with_capacity(template.len());
    let mut arg_index = 1;
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'}' {
            if let Some(arg) = args.get(arg_index) {
                out.push_str(&format!("{}", arg));
                arg_index += 1;
            }
            i += 2;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    Ok(string_value(vm, &out))
}

// ---------------------------------------------------------------------------
// Higher-order natives (re-enter the interpreter)
// ---------------------------------------------------------------------------

fn native_map_fn(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_list() {
        return Ok(Value::NIL);
    }
    let func = args[1];
    let result = vm.alloc_list(Vec::new());
    vm.push(Value::object(result));
    let mut i = 0;
    while i < list_ref(args[0].as_obj()).items.len() {
        let item = list_ref(args[0].as_obj()).items[i];
        let mapped = vm.call_function(func, &[item])?;
        list_mut(result).items.push(mapped);
        i += 1;
    }
    vm.pop();
    Ok(Value::object(result))
}

fn native_filter(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_list() {
        return Ok(Value::NIL);
    }
    let func = args[1];
    let result = vm.alloc_list(Vec::new());
    vm.push(Value::object(result));
    let mut i = 0;
    while i < list_ref(args[0].as_obj()).items.len() {
        let item = list_ref(args[0].as_obj()).items[i];
        let keep = vm.call_function(func, &[item])?;
        if !keep.is_falsey() {
            list_mut(result).items.push(item);
        }
        i += 1;
    }
    vm.pop();
    Ok(Value::object(result))
}

fn native_reduce(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if args.len() < 2 || !args[0].is_list() {
        return Ok(Value::NIL);
    }
    let func = args[1];
    let count = list_ref(args[0].as_obj()).items.len();
    if count == 0 {
        return Ok(args.get(2).copied().unwrap_or(Value::NIL));
    }

    let (initial, start) = match args.get(2) {
        Some(&seed) => (seed, 0),
        None => (list_ref(args[0].as_obj()).items[0], 1),
    };

    // The accumulator lives on the VM stack so collections triggered by
    // the callback cannot reclaim it.
    vm.push(initial);
    let mut i = start;
    while i < list_ref(args[0].as_obj()).items.len() {
        let item = list_ref(args[0].as_obj()).items[i];
        let acc = vm.peek(0);
        let next = vm.call_function(func, &[acc, item])?;
        let top = vm.stack.len() - 1;
        vm.stack[top] = next;
        i += 1;
    }
    Ok(vm.pop())
}

fn native_retry(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_number() {
        return Ok(Value::NIL);
    }
    let attempts = (args[0].as_number() as i64).max(1);
    let func = args[1];
    for attempt in 0..attempts {
        match vm.call_function(func, &[]) {
            Ok(value) => return Ok(value),
            Err(Unwind::Fatal(fatal)) => return Err(Unwind::Fatal(fatal)),
            Err(error) => {
                if attempt + 1 == attempts {
                    return Err(error);
                }
            }
        }
    }
    Ok(Value::NIL)
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

pub(crate) struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

pub(crate) fn run_shell(command: &str) -> ShellResult {
    let output = if cfg!(windows) {
        Command::new("cmd").args(["/C", command]).output()
    } else {
        Command::new("sh").args(["-c", command]).output()
    };
    match output {
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
    }
}

/// Build the `{stdout, stderr, output, exitCode}` result map. The map is
/// rooted on the VM stack while its strings are interned.
pub(crate) fn shell_result_map(vm: &mut Vm, result: &ShellResult) -> Value {
    let map = vm.alloc_map();
    vm.push(Value::object(map));

    let stdout_val = string_value(vm, &result.stdout);
    vm.map_set_str(map, "stdout", stdout_val);
    let stderr_val = string_value(vm, &result.stderr);
    vm.map_set_str(map, "stderr", stderr_val);
    vm.map_set_str(map, "exitCode", Value::number(result.exit_code as f64));
    let trimmed = result
        .stdout
        .strip_suffix('\n')
        .unwrap_or(result.stdout.as_str());
    let output_val = string_value(vm, trimmed);
    vm.map_set_str(map, "output", output_val);

    vm.pop();
    Value::object(map)
}

fn exec_error(vm: &mut Vm, message: String, exit_code: i32) -> Unwind {
    let unwind = vm.raise("exec", message);
    if let Unwind::Error(error) = &unwind {
        vm.push(*error);
        vm.map_set_str(error.as_obj(), "exitCode", Value::number(exit_code as f64));
        vm.pop();
    }
    unwind
}

fn native_exec(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(command) = args.first().and_then(|v| string_arg(*v)) else {
        return Ok(Value::NIL);
    };

    if !vm.permissions.check(PermKind::Exec, &command) {
        return Err(vm.raise(
            "permission",
            format!("Permission denied: exec \"{}\"", command),
        ));
    }

    let result = run_shell(&command);
    if result.exit_code != 0 {
        return Err(exec_error(
            vm,
            format!(
                "Command failed with exit code {}: {}",
                result.exit_code, command
            ),
            result.exit_code,
        ));
    }
    Ok(shell_result_map(vm, &result))
}

/// Run a list of commands concurrently on OS threads and return their
/// result maps in order. The VM thread blocks until every command has
/// finished, so the interpreter itself stays single-threaded.
fn native_parallel_exec(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    if !args[0].is_list() {
        return Ok(Value::NIL);
    }
    let mut commands = Vec::new();
    for item in &list_ref(args[0].as_obj()).items {
        let Some(command) = string_arg(*item) else {
            return Ok(Value::NIL);
        };
        if !vm.permissions.check(PermKind::Exec, &command) {
            return Err(vm.raise(
                "permission",
                format!("Permission denied: exec \"{}\"", command),
            ));
        }
        commands.push(command);
    }

    let handles: Vec<_> = commands
        .into_iter()
        .map(|command| std::thread::spawn(move || run_shell(&command)))
        .collect();
    let results: Vec<ShellResult> = handles
        .into_iter()
        .map(|handle| match handle.join() {
            Ok(result) => result,
            Err(_) => ShellResult {
                stdout: String::new(),
                stderr: "worker thread panicked".to_string(),
                exit_code: -1,
            },
        })
        .collect();

    let list = vm.alloc_list(Vec::new());
    vm.push(Value::object(list));
    for result in &results {
        let map = shell_result_map(vm, result);
        list_mut(list).items.push(map);
    }
    vm.pop();
    Ok(Value::object(list))
}

// ---------------------------------------------------------------------------
// Files & environment
// ---------------------------------------------------------------------------

fn native_read_file(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(path) = string_arg(args[0]) else {
        return Ok(Value::NIL);
    };
    if !vm.permissions.check(PermKind::Read, &path) {
        return Err(vm.raise(
            "permission",
            format!("Permission denied: read \"{}\"", path),
        ));
    }
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return Ok(Value::NIL);
    };
    if path.ends_with(".json") {
        return super::json::parse_json_text(vm, &contents);
    }
    Ok(string_value(vm, &contents))
}

fn native_write_file(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let (Some(path), Some(contents)) = (string_arg(args[0]), string_arg(args[1])) else {
        return Ok(Value::FALSE);
    };
    if !vm.permissions.check(PermKind::Write, &path) {
        return Err(vm.raise(
            "permission",
            format!("Permission denied: write \"{}\"", path),
        ));
    }
    Ok(Value::boolean(std::fs::write(&path, contents).is_ok()))
}

fn native_env(vm: &mut Vm, args: &[Value]) -> Result<Value, Unwind> {
    let Some(name) = string_arg(args[0]) else {
        return Ok(Value::NIL);
    };
    if !vm.permissions.check(PermKind::Env, &name) {
        return Err(vm.raise("permission", format!("Permission denied: env \"{}\"", name)));
    }
    match std::env::var(&name) {
        Ok(value) => Ok(string_value(vm, &value)),
        Err(_) => Ok(Value::NIL),
    }
}
