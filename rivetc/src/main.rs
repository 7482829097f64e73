use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use rivetc::vm::compiler;
use rivetc::vm::debug::disassemble_chunk;
use rivetc::vm::object::function_ref;
use rivetc::{InterpretResult, Vm};

const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;

#[derive(Parser)]
#[command(name = "rivet")]
#[command(about = "The Rivet process-orchestration language")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a .rvt script
    Run {
        /// The script to run
        file: PathBuf,

        /// Grant every permission instead of requiring allow statements
        #[arg(long)]
        allow_all: bool,

        /// Arguments passed through to the script (sys.args)
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Start the interactive REPL
    Repl,

    /// Syntax-check a script without running it
    Check {
        /// The script to check
        file: PathBuf,

        /// Output diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the compiled bytecode of a script
    Disasm {
        /// The script to disassemble
        file: PathBuf,
    },
}

#[derive(Serialize)]
struct CheckResult {
    status: &'static str,
    diagnostics: Vec<Diagnostic>,
}

#[derive(Serialize)]
struct Diagnostic {
    severity: &'static str,
    line: u32,
    col: u32,
    message: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Repl) => {
            rivetc::repl::run();
            ExitCode::SUCCESS
        }
        Some(Commands::Run {
            file,
            allow_all,
            args,
        }) => run_script(&file, allow_all, args),
        Some(Commands::Check { file, json }) => check_script(&file, json),
        Some(Commands::Disasm { file }) => disasm_script(&file),
    }
}

fn read_source(file: &PathBuf) -> Option<String> {
    match std::fs::read_to_string(file) {
        Ok(source) => Some(source),
        Err(error) => {
            eprintln!("Error: Could not read '{}': {}", file.display(), error);
            None
        }
    }
}

fn run_script(file: &PathBuf, allow_all: bool, args: Vec<String>) -> ExitCode {
    let Some(source) = read_source(file) else {
        return ExitCode::FAILURE;
    };

    let mut vm = Vm::new();
    vm.script_path = Some(file.clone());
    vm.script_args = args;
    if allow_all {
        vm.permissions.allow_all = true;
    }

    match vm.interpret(&source) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(EXIT_COMPILE_ERROR),
        InterpretResult::RuntimeError => ExitCode::from(EXIT_RUNTIME_ERROR),
    }
}

fn check_script(file: &PathBuf, json: bool) -> ExitCode {
    let Some(source) = read_source(file) else {
        return ExitCode::FAILURE;
    };

    let result = match rivet_syntax::parse(&source) {
        Ok(program) => {
            let count = match &program.kind {
                rivet_syntax::ast::NodeKind::Program(stmts) => stmts.len(),
                _ => 0,
            };
            if !json {
                println!("OK: {} top-level statements parsed.", count);
            }
            CheckResult {
                status: "ok",
                diagnostics: Vec::new(),
            }
        }
        Err(errors) => CheckResult {
            status: "failure",
            diagnostics: errors
                .into_iter()
                .map(|error| Diagnostic {
                    severity: "error",
                    line: error.line,
                    col: error.col,
                    message: error.message,
                })
                .collect(),
        },
    };

    if json {
        match serde_json::to_string_pretty(&result) {
            Ok(text) => println!("{}", text),
            Err(error) => eprintln!("Error: could not serialize diagnostics: {}", error),
        }
    } else {
        for diagnostic in &result.diagnostics {
            eprintln!(
                "{}:{}:{}: {}",
                file.display(),
                diagnostic.line,
                diagnostic.col,
                diagnostic.message
            );
        }
    }

    if result.status == "ok" {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_COMPILE_ERROR)
    }
}

fn disasm_script(file: &PathBuf) -> ExitCode {
    let Some(source) = read_source(file) else {
        return ExitCode::FAILURE;
    };

    let program = match rivet_syntax::parse(&source) {
        Ok(program) => program,
        Err(errors) => {
            for error in errors {
                eprintln!("{}", error);
            }
            return ExitCode::from(EXIT_COMPILE_ERROR);
        }
    };

    let mut vm = Vm::new();
    let Some(function) = compiler::compile(&mut vm, &program) else {
        return ExitCode::from(EXIT_COMPILE_ERROR);
    };

    let mut stdout = std::io::stdout();
    if let Err(error) = disassemble_chunk(&function_ref(function).chunk, "<script>", &mut stdout) {
        eprintln!("Error: {}", error);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
