//! End-to-end tests: source text in, captured output and exit status out.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use rivetc::{InterpretResult, Vm};

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture_vm() -> (Vm, SharedBuf) {
    let mut vm = Vm::new();
    let buf = SharedBuf::default();
    vm.set_output(Box::new(buf.clone()));
    (vm, buf)
}

fn run(source: &str) -> (InterpretResult, String) {
    let (mut vm, buf) = capture_vm();
    let result = vm.interpret(source);
    (result, buf.contents())
}

fn run_ok(source: &str) -> String {
    let (result, output) = run(source);
    assert_eq!(result, InterpretResult::Ok, "output so far: {}", output);
    output
}

// ---------------------------------------------------------------------------
// Core scenarios
// ---------------------------------------------------------------------------

#[test]
fn recursive_fib() {
    let source = "\
fn fib(n) {
  if n < 2 {
    return n
  }
  return fib(n - 1) + fib(n - 2)
}
print(fib(10))
";
    assert_eq!(run_ok(source), "55\n");
}

#[test]
fn closure_counter() {
    let source = "\
fn mk() {
  n = 0
  return fn() {
    n = n + 1
    return n
  }
}
c = mk()
print(c())
print(c())
print(c())
";
    assert_eq!(run_ok(source), "1\n2\n3\n");
}

#[test]
fn two_closures_share_one_variable() {
    let source = "\
fn make_pair() {
  n = 0
  inc = fn() {
    n = n + 1
    return n
  }
  get = fn() {
    return n
  }
  return [inc, get]
}
pair = make_pair()
inc = pair[0]
get = pair[1]
inc()
inc()
print(get())
inc()
print(get())
";
    assert_eq!(run_ok(source), "2\n3\n");
}

#[test]
fn handler_catches_division_by_zero() {
    let source = "\
on failure {
  print(\"caught: \" + error.message)
}
x = 1 / 0
print(\"never\")
";
    let output = run_ok(source);
    assert_eq!(output, "caught: Division by zero.\n");
    assert!(!output.contains("never"));
}

#[test]
fn match_with_wildcard() {
    let source = "\
r = match 2 {
  1 -> \"a\",
  2 -> \"b\",
  _ -> \"c\"
}
print(r)
";
    assert_eq!(run_ok(source), "b\n");

    let source = "\
r = match 9 {
  1 -> \"a\",
  2 -> \"b\",
  _ -> \"c\"
}
print(r)
";
    assert_eq!(run_ok(source), "c\n");
}

#[test]
fn match_without_matching_arm_is_nil() {
    let source = "\
r = match 9 {
  1 -> \"a\"
}
print(r)
";
    assert_eq!(run_ok(source), "nil\n");
}

#[test]
fn pipe_equivalence() {
    let source = "\
fn inc(n) {
  return n + 1
}
print(5 |> inc)
print(inc(5))
";
    assert_eq!(run_ok(source), "6\n6\n");
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

#[test]
fn while_loop_with_break_and_continue() {
    let source = "\
i = 0
total = 0
while true {
  i = i + 1
  if i > 10 {
    break
  }
  if i % 2 == 0 {
    continue
  }
  total = total + i
}
print(total)
";
    // 1 + 3 + 5 + 7 + 9
    assert_eq!(run_ok(source), "25\n");
}

#[test]
fn for_over_list_and_string() {
    let source = "\
total = 0
for x in [1, 2, 3, 4] {
  total = total + x
}
print(total)
s = \"\"
for c in \"abc\" {
  s = s + c
}
print(s)
";
    assert_eq!(run_ok(source), "10\nabc\n");
}

#[test]
fn for_over_range() {
    let source = "\
total = 0
for i in 0..5 {
  total = total + i
}
print(total)
";
    assert_eq!(run_ok(source), "10\n");
}

#[test]
fn if_else_chains() {
    let source = "\
fn grade(n) {
  if n >= 90 {
    return \"a\"
  } else if n >= 80 {
    return \"b\"
  } else {
    return \"c\"
  }
}
print(grade(95))
print(grade(85))
print(grade(70))
";
    assert_eq!(run_ok(source), "a\nb\nc\n");
}

#[test]
fn logic_laws() {
    let source = "\
x = 5
print((x or x) == x)
print((x and x) == x)
print(not not x == bool(x))
print(nil or \"fallback\")
print(false and \"skipped\")
";
    assert_eq!(run_ok(source), "true\ntrue\ntrue\nfallback\nfalse\n");
}

#[test]
fn zero_is_falsey() {
    let source = "\
if 0 {
  print(\"truthy\")
} else {
  print(\"falsey\")
}
";
    assert_eq!(run_ok(source), "falsey\n");
}

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

#[test]
fn list_indexing_and_negative_indices() {
    let source = "\
xs = [10, 20, 30]
print(xs[0])
print(xs[-1])
xs[1] = 99
print(xs[1])
print(xs.length)
";
    assert_eq!(run_ok(source), "10\n30\n99\n3\n");
}

#[test]
fn list_append_length_law() {
    let source = "\
xs = [1, 2, 3]
before = len(xs)
append(xs, 9)
print(len(xs) == before + 1)
";
    assert_eq!(run_ok(source), "true\n");
}

#[test]
fn map_access_and_missing_keys() {
    let source = "\
config = {\"env\": \"prod\", \"retries\": 3}
print(config[\"env\"])
print(config.retries)
print(config[\"missing\"])
config.region = \"eu\"
print(config[\"region\"])
";
    assert_eq!(run_ok(source), "prod\n3\nnil\neu\n");
}

#[test]
fn string_interning_makes_equal_strings_identical() {
    let source = "\
a = \"he\" + \"llo\"
b = \"hello\"
print(a == b)
print(a[0])
print(a.length)
";
    assert_eq!(run_ok(source), "true\nh\n5\n");
}

#[test]
fn keys_values_contains() {
    let source = "\
m = {\"a\": 1, \"b\": 2}
ks = keys(m)
print(len(ks))
print(contains(ks, \"a\"))
print(contains(m, \"b\"))
print(contains([1, 2], 3))
print(contains(\"hello\", \"ell\"))
";
    assert_eq!(run_ok(source), "2\ntrue\ntrue\nfalse\ntrue\n");
}

#[test]
fn higher_order_natives() {
    let source = "\
xs = [1, 2, 3, 4]
doubled = map_fn(xs, fn(x) { return x * 2 })
print(doubled)
evens = filter(xs, fn(x) { return x % 2 == 0 })
print(evens)
total = reduce(xs, fn(acc, x) { return acc + x }, 0)
print(total)
";
    assert_eq!(run_ok(source), "[2, 4, 6, 8]\n[2, 4]\n10\n");
}

#[test]
fn sort_orders_numbers() {
    assert_eq!(run_ok("print(sort([3, 1, 2]))"), "[1, 2, 3]\n");
}

#[test]
fn string_natives() {
    let source = "\
print(split(\"a,b,c\", \",\"))
print(trim(\"  hi  \"))
print(replace(\"a-b-c\", \"-\", \"+\"))
print(upper(\"abc\") + lower(\"DEF\"))
print(starts_with(\"rivet\", \"riv\"))
print(ends_with(\"rivet\", \"vet\"))
print(join([1, 2, 3], \"-\"))
";
    assert_eq!(
        run_ok(source),
        "[a, b, c]\nhi\na+b+c\nABCdef\ntrue\ntrue\n1-2-3\n"
    );
}

#[test]
fn fstring_interpolation() {
    let source = "\
name = \"world\"
n = 41
print(f\"hello {name}, n = {n + 1}!\")
";
    assert_eq!(run_ok(source), "hello world, n = 42!\n");
}

#[test]
fn compound_assignment() {
    let source = "\
x = 10
x += 5
x -= 3
x *= 2
x /= 4
print(x)
";
    assert_eq!(run_ok(source), "6\n");
}

#[test]
fn type_and_conversions() {
    let source = "\
print(type(1))
print(type(\"s\"))
print(type([1]))
print(type({\"a\": 1}))
print(type(nil))
print(type(print))
print(num(\"3.5\") + 0.5)
print(str(42) + \"!\")
";
    assert_eq!(
        run_ok(source),
        "number\nstring\nlist\nmap\nnil\nfunction\n4\n42!\n"
    );
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

#[test]
fn json_round_trip() {
    let source = "\
s = \"{\\\"a\\\":[1,2,3],\\\"b\\\":\\\"x\\\"}\"
print(to_json(parse_json(s)))
";
    assert_eq!(run_ok(source), "{\"a\":[1,2,3],\"b\":\"x\"}\n");
}

#[test]
fn json_values_map_to_language_values() {
    let source = "\
v = parse_json(\"{\\\"n\\\": 1.5, \\\"t\\\": true, \\\"nothing\\\": null}\")
print(v.n)
print(v.t)
print(v.nothing)
";
    assert_eq!(run_ok(source), "1.5\ntrue\nnil\n");
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

#[test]
fn uncaught_error_is_a_runtime_error() {
    let (result, _) = run("x = 1 / 0");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn undefined_variable_raises() {
    let source = "\
on failure {
  print(\"caught: \" + error.message)
}
print(missing)
";
    assert_eq!(run_ok(source), "caught: Undefined variable 'missing'.\n");
}

#[test]
fn error_map_carries_a_type() {
    let source = "\
on failure {
  print(error.type)
}
x = \"a\" + 1
";
    assert_eq!(run_ok(source), "type\n");
}

#[test]
fn handlers_nest_innermost_wins() {
    let source = "\
on failure {
  print(\"outer: \" + error.message)
}
fn risky() {
  on failure {
    print(\"inner\")
    return \"recovered\"
  }
  x = 1 / 0
  return \"unreached\"
}
print(risky())
print(\"after\")
";
    assert_eq!(run_ok(source), "inner\nrecovered\nafter\n");
}

#[test]
fn reraise_from_handler_reaches_outer_handler() {
    let source = "\
on failure {
  print(\"outer: \" + error.type)
}
fn risky() {
  on failure {
    y = nil + 1
  }
  x = 1 / 0
}
risky()
print(\"done\")
";
    // The inner handler itself fails; the outer one must catch that.
    let output = run_ok(source);
    assert_eq!(output, "outer: type\n");
}

#[test]
fn handler_restores_machine_state() {
    let source = "\
fn work() {
  on failure {
    return \"fell back\"
  }
  xs = [1, 2, 3]
  x = xs[99]
  return \"unreached\"
}
print(work())
print(work())
";
    assert_eq!(run_ok(source), "fell back\nfell back\n");
}

#[test]
fn error_propagates_through_native_reentry() {
    let source = "\
on failure {
  print(\"caught: \" + error.message)
}
xs = map_fn([1, 0, 2], fn(x) { return 1 / x })
print(\"never\")
";
    assert_eq!(run_ok(source), "caught: Division by zero.\n");
}

#[test]
fn retry_retries_until_success() {
    let source = "\
state = {\"attempts\": 0}
fn flaky() {
  state.attempts = state.attempts + 1
  if state.attempts < 3 {
    x = 1 / 0
  }
  return state.attempts
}
print(retry(5, flaky))
";
    assert_eq!(run_ok(source), "3\n");
}

#[test]
fn protected_region_is_statements_after_the_handler() {
    let source = "\
print(\"before\")
on failure {
  print(\"handler\")
}
print(\"protected\")
x = 1 / 0
print(\"never\")
";
    assert_eq!(run_ok(source), "before\nprotected\nhandler\n");
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[test]
fn exec_without_permission_is_denied() {
    let source = "\
on failure {
  print(error.type)
}
r = exec \"echo hi\"
print(\"never\")
";
    assert_eq!(run_ok(source), "permission\n");
}

#[cfg(unix)]
#[test]
fn exec_with_allow_runs_the_command() {
    let source = "\
allow exec \"echo*\"
r = exec \"echo hi\"
print(r.output)
print(r.exitCode)
";
    assert_eq!(run_ok(source), "hi\n0\n");
}

#[cfg(unix)]
#[test]
fn failing_command_raises_exec_error() {
    let source = "\
allow exec \"*\"
on failure {
  print(error.type)
  print(error.exitCode)
}
r = exec \"exit 3\"
print(\"never\")
";
    assert_eq!(run_ok(source), "exec\n3\n");
}

#[cfg(unix)]
#[test]
fn parallel_exec_returns_results_in_order() {
    let source = "\
allow exec \"echo*\"
rs = parallel_exec([\"echo one\", \"echo two\"])
print(rs[0].output)
print(rs[1].output)
";
    assert_eq!(run_ok(source), "one\ntwo\n");
}

#[test]
fn env_permission_gates_lookup() {
    let source = "\
on failure {
  print(error.type)
}
v = env(\"PATH\")
print(\"never\")
";
    assert_eq!(run_ok(source), "permission\n");
}

// ---------------------------------------------------------------------------
// Top-level scoping rule
// ---------------------------------------------------------------------------

#[test]
fn top_level_block_bindings_escape() {
    let source = "\
if true {
  config = \"loaded\"
}
print(config)
for i in [1, 2, 3] {
  last = i
}
print(last)
";
    assert_eq!(run_ok(source), "loaded\n3\n");
}

#[test]
fn function_locals_do_not_escape() {
    let source = "\
fn f() {
  hidden = 1
  return hidden
}
f()
on failure {
  print(\"caught\")
}
print(hidden)
";
    assert_eq!(run_ok(source), "caught\n");
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("rivet-e2e-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[test]
fn import_exposes_module_globals_as_map() {
    let dir = temp_dir("import-basic");
    std::fs::write(
        dir.join("m.rvt"),
        "fn greet(x) {\n  return \"hi \" + x\n}\nsecret = 42\n",
    )
    .expect("write module");

    let (mut vm, buf) = capture_vm();
    vm.script_path = Some(dir.join("host.rvt"));
    let result = vm.interpret("import \"m\"\nprint(m.greet(\"a\"))\nprint(m.secret)\n");
    assert_eq!(result, InterpretResult::Ok, "output: {}", buf.contents());
    assert_eq!(buf.contents(), "hi a\n42\n");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn module_names_do_not_leak_into_globals() {
    let dir = temp_dir("import-isolation");
    std::fs::write(dir.join("m.rvt"), "secret = 42\n").expect("write module");

    let (mut vm, buf) = capture_vm();
    vm.script_path = Some(dir.join("host.rvt"));
    let result = vm.interpret("import \"m\"\nprint(secret)\n");
    assert_eq!(result, InterpretResult::RuntimeError);
    assert_eq!(buf.contents(), "");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn import_is_cached_after_first_execution() {
    let dir = temp_dir("import-cache");
    std::fs::write(dir.join("m.rvt"), "print(\"module ran\")\nvalue = 1\n")
        .expect("write module");

    let (mut vm, buf) = capture_vm();
    vm.script_path = Some(dir.join("host.rvt"));
    let result = vm.interpret("import \"m\"\nimport \"m\" as again\nprint(again.value)\n");
    assert_eq!(result, InterpretResult::Ok, "output: {}", buf.contents());
    assert_eq!(buf.contents(), "module ran\n1\n");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn import_with_alias_binds_under_alias() {
    let dir = temp_dir("import-alias");
    std::fs::write(dir.join("util.rvt"), "fn double(x) {\n  return x * 2\n}\n")
        .expect("write module");

    let (mut vm, buf) = capture_vm();
    vm.script_path = Some(dir.join("host.rvt"));
    let result = vm.interpret("import \"util\" as u\nprint(u.double(21))\n");
    assert_eq!(result, InterpretResult::Ok, "output: {}", buf.contents());
    assert_eq!(buf.contents(), "42\n");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_module_raises_io_error() {
    let source = "\
on failure {
  print(error.type)
}
import \"does-not-exist\"
print(\"never\")
";
    assert_eq!(run_ok(source), "io\n");
}

// ---------------------------------------------------------------------------
// Machine properties
// ---------------------------------------------------------------------------

#[test]
fn global_cache_disabled_gives_identical_output() {
    let source = "\
counter = 0
i = 0
while i < 100 {
  counter = counter + 1
  i = i + 1
}
print(counter)
";
    let (mut cached_vm, cached_buf) = capture_vm();
    assert_eq!(cached_vm.interpret(source), InterpretResult::Ok);

    let (mut plain_vm, plain_buf) = capture_vm();
    plain_vm.set_global_cache(false);
    assert_eq!(plain_vm.interpret(source), InterpretResult::Ok);

    assert_eq!(cached_buf.contents(), plain_buf.contents());
    assert_eq!(cached_buf.contents(), "100\n");
}

#[test]
fn gc_stress_preserves_program_behavior() {
    let source = "\
fn build(n) {
  out = []
  for i in range(0, n) {
    append(out, \"item-\" + str(i))
  }
  return out
}
xs = build(40)
print(len(xs))
print(xs[0])
print(xs[39])
";
    let (mut vm, buf) = capture_vm();
    vm.set_gc_stress(true);
    assert_eq!(vm.interpret(source), InterpretResult::Ok);
    assert_eq!(buf.contents(), "40\nitem-0\nitem-39\n");
}

#[test]
fn deep_recursion_overflows_cleanly() {
    let source = "\
fn down(n) {
  return down(n + 1)
}
down(0)
";
    let (result, _) = run(source);
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn stack_overflow_is_not_catchable() {
    let source = "\
on failure {
  print(\"caught\")
}
fn down(n) {
  return down(n + 1)
}
down(0)
";
    let (result, output) = run(source);
    assert_eq!(result, InterpretResult::RuntimeError);
    assert_eq!(output, "");
}

#[test]
fn repl_style_reuse_keeps_globals() {
    let (mut vm, buf) = capture_vm();
    assert_eq!(vm.interpret("x = 1"), InterpretResult::Ok);
    assert_eq!(vm.interpret("x = x + 1"), InterpretResult::Ok);
    assert_eq!(vm.interpret("print(x)"), InterpretResult::Ok);
    assert_eq!(buf.contents(), "2\n");
}

#[test]
fn vm_recovers_after_runtime_error() {
    let (mut vm, buf) = capture_vm();
    assert_eq!(vm.interpret("x = 1 / 0"), InterpretResult::RuntimeError);
    assert_eq!(vm.interpret("print(\"still alive\")"), InterpretResult::Ok);
    assert_eq!(buf.contents(), "still alive\n");
}
