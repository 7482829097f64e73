//! Interactive REPL.
//!
//! Lines accumulate until braces balance, then the buffer is evaluated in
//! one persistent VM. The REPL grants every permission: it is an
//! interactive operator session, not an untrusted script.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn run() {
    let mut vm = Vm::new();
    vm.permissions.allow_all = true;

    println!("Rivet {} REPL (type 'exit' to quit)", VERSION);

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("Could not start line editor: {}", error);
            return;
        }
    };

    let mut buffer = String::new();
    let mut brace_depth: i32 = 0;

    loop {
        let prompt = if brace_depth > 0 { "... " } else { ">>> " };
        match editor.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if brace_depth == 0 && (trimmed == "exit" || trimmed == "quit") {
                    break;
                }

                brace_depth += brace_delta(&line);
                buffer.push_str(&line);
                buffer.push('\n');

                if brace_depth <= 0 {
                    brace_depth = 0;
                    let _ = editor.add_history_entry(buffer.trim_end());
                    vm.interpret(&buffer);
                    buffer.clear();
                }
            }
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
                brace_depth = 0;
            }
            Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("Input error: {}", error);
                break;
            }
        }
    }
}

/// Net brace change of a line, ignoring braces inside string literals.
fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match in_string {
            Some(quote) => match c {
                '\\' => escaped = true,
                _ if c == quote => in_string = None,
                _ => {}
            },
            None => match c {
                '"' | '\'' | '`' => in_string = Some(c),
                '{' => delta += 1,
                '}' => delta -= 1,
                '#' => break,
                _ => {}
            },
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brace_counting() {
        assert_eq!(brace_delta("fn f() {"), 1);
        assert_eq!(brace_delta("}"), -1);
        assert_eq!(brace_delta("x = \"{\""), 0);
        assert_eq!(brace_delta("x = 1 # {"), 0);
    }
}
