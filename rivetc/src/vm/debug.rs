//! Bytecode disassembler, used by `rivet disasm` and when debugging the
//! compiler.

use std::io::Write;

use super::chunk::{Chunk, Op};
use super::object::function_ref;

/// Print one chunk, then recurse into any function constants so a whole
/// compiled script disassembles in one call.
pub fn disassemble_chunk(chunk: &Chunk, name: &str, out: &mut dyn Write) -> std::io::Result<()> {
    writeln!(out, "== {} ==", name)?;
    for offset in 0..chunk.code.len() {
        disassemble_instruction(chunk, offset, out)?;
    }
    for constant in &chunk.constants {
        if constant.is_function() {
            let func = function_ref(constant.as_obj());
            let fn_name = func.name_str().unwrap_or("<lambda>").to_string();
            writeln!(out)?;
            disassemble_chunk(&func.chunk, &fn_name, out)?;
        }
    }
    Ok(())
}

pub fn disassemble_instruction(
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> std::io::Result<()> {
    write!(out, "{:04} ", offset)?;
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        write!(out, "   | ")?;
    } else {
        write!(out, "{:4} ", chunk.line_at(offset))?;
    }

    let op = chunk.code[offset];
    match op {
        Op::Constant(index) => write_const(out, "CONSTANT", index, chunk),
        Op::GetGlobal(index) => write_const(out, "GET_GLOBAL", index, chunk),
        Op::SetGlobal(index) => write_const(out, "SET_GLOBAL", index, chunk),
        Op::DefineGlobal(index) => write_const(out, "DEFINE_GLOBAL", index, chunk),
        Op::GetProperty(index) => write_const(out, "GET_PROPERTY", index, chunk),
        Op::SetProperty(index) => write_const(out, "SET_PROPERTY", index, chunk),
        Op::Closure(index) => write_const(out, "CLOSURE", index, chunk),
        Op::Jump(distance) => {
            writeln!(out, "{:<16} -> {}", "JUMP", offset + 1 + distance as usize)
        }
        Op::JumpIfFalse(distance) => writeln!(
            out,
            "{:<16} -> {}",
            "JUMP_IF_FALSE",
            offset + 1 + distance as usize
        ),
        Op::PushHandler(distance) => writeln!(
            out,
            "{:<16} -> {}",
            "PUSH_HANDLER",
            offset + 1 + distance as usize
        ),
        Op::Loop(distance) => {
            writeln!(out, "{:<16} -> {}", "LOOP", offset + 1 - distance as usize)
        }
        Op::Import(path, name) => {
            writeln!(
                out,
                "{:<16} {} as {}",
                "IMPORT",
                const_preview(chunk, path),
                const_preview(chunk, name)
            )
        }
        Op::Allow(kind, target) => {
            writeln!(
                out,
                "{:<16} {} {}",
                "ALLOW",
                kind,
                const_preview(chunk, target)
            )
        }
        other => writeln!(out, "{:?}", other),
    }
}

fn write_const(out: &mut dyn Write, name: &str, index: u16, chunk: &Chunk) -> std::io::Result<()> {
    writeln!(out, "{:<16} {} ({})", name, index, const_preview(chunk, index))
}

fn const_preview(chunk: &Chunk, index: u16) -> String {
    match chunk.constants.get(index as usize) {
        Some(value) if value.is_string() => format!("\"{}\"", value),
        Some(value) => format!("{}", value),
        None => "<bad const>".to_string(),
    }
}

#[allow(dead_code)]
pub fn disassemble_to_string(chunk: &Chunk, name: &str) -> String {
    let mut buf = Vec::new();
    disassemble_chunk(chunk, name, &mut buf).expect("write to Vec cannot fail");
    String::from_utf8_lossy(&buf).into_owned()
}
