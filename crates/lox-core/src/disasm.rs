//! disasm.rs — désassembleur texte pour une [`Chunk`] (§6 "disassemble each
//! compiled Chunk").
//!
//! Une ligne par instruction : `PC (line N)  MNEMONIC  operandes`. Les
//! index de constantes sont résolus via [`crate::heap::render`] (d'où la
//! dépendance au tas : une constante peut être une chaîne internée ou une
//! `Function`).

use std::fmt::Write as _;

use crate::chunk::Chunk;
use crate::heap::{render, Heap};
use crate::ops::{Op, UpvalueCapture};

/// Désassemble une chunk entière, une ligne par instruction, préfixée d'un
/// en-tête `== name ==`.
pub fn disassemble_chunk(chunk: &Chunk, heap: &Heap, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    for index in 0..chunk.len() {
        let _ = writeln!(out, "{}", disassemble_instruction(chunk, heap, index));
    }
    out
}

/// Désassemble l'instruction à `index`, sous la forme d'une seule ligne.
///
/// Panique si `index` est hors bornes : réservé à l'appel depuis
/// `disassemble_chunk` ou un pas-à-pas piloté par la VM, jamais sur un
/// index non vérifié.
pub fn disassemble_instruction(chunk: &Chunk, heap: &Heap, index: usize) -> String {
    let op = chunk.op(index).expect("disassemble_instruction: index out of range");
    let line = chunk.line(index);
    let line_col = if index > 0 && chunk.line(index - 1) == line {
        "   |".to_string()
    } else {
        format!("{line:4}")
    };
    format!("{index:04} {line_col}  {}", fmt_operands(chunk, heap, index, op))
}

fn fmt_operands(chunk: &Chunk, heap: &Heap, index: usize, op: &Op) -> String {
    let mnemonic = op.mnemonic();
    match op {
        Op::Constant(slot) | Op::GetGlobal(slot) | Op::DefineGlobal(slot) | Op::SetGlobal(slot) => {
            format!("{mnemonic:<16} {slot:4} '{}'", constant_preview(chunk, heap, *slot))
        }
        Op::GetProperty(slot) | Op::SetProperty(slot) | Op::GetSuper(slot) | Op::Class(slot) | Op::Method(slot) => {
            format!("{mnemonic:<16} {slot:4} '{}'", constant_preview(chunk, heap, *slot))
        }
        Op::GetLocal(slot) | Op::SetLocal(slot) | Op::GetUpvalue(slot) | Op::SetUpvalue(slot) | Op::Call(slot) => {
            format!("{mnemonic:<16} {slot:4}")
        }
        Op::Jump(target) | Op::JumpIfFalse(target) => {
            format!("{mnemonic:<16} {index:4} -> {target}")
        }
        Op::Loop(target) => {
            format!("{mnemonic:<16} {index:4} -> {target}")
        }
        Op::Invoke(slot, argc) | Op::SuperInvoke(slot, argc) => {
            format!(
                "{mnemonic:<16} {slot:4} '{}' ({argc} args)",
                constant_preview(chunk, heap, *slot)
            )
        }
        Op::Closure(slot, captures) => {
            let mut s = format!(
                "{mnemonic:<16} {slot:4} '{}'",
                constant_preview(chunk, heap, *slot)
            );
            for UpvalueCapture { is_local, index: capture_index } in captures {
                let kind = if *is_local { "local" } else { "upvalue" };
                let _ = write!(s, "\n                       | {kind} {capture_index}");
            }
            s
        }
        Op::Nil
        | Op::True
        | Op::False
        | Op::Pop
        | Op::Equal
        | Op::Greater
        | Op::Less
        | Op::Add
        | Op::Subtract
        | Op::Multiply
        | Op::Divide
        | Op::Negate
        | Op::Not
        | Op::Print
        | Op::CloseUpvalue
        | Op::Return
        | Op::Inherit => mnemonic.to_string(),
    }
}

fn constant_preview(chunk: &Chunk, heap: &Heap, slot: u8) -> String {
    match chunk.constant(slot) {
        Ok(value) => render(value, heap),
        Err(_) => "<invalid constant>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn disassembles_a_constant_load() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Number(1.0)).unwrap();
        chunk.write(Op::Constant(0), 1);
        let line = disassemble_instruction(&chunk, &heap, 0);
        assert!(line.contains("CONSTANT"));
        assert!(line.contains('1'));
    }

    #[test]
    fn repeated_lines_are_collapsed_to_a_pipe() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write(Op::Nil, 1);
        chunk.write(Op::Pop, 1);
        let second = disassemble_instruction(&chunk, &heap, 1);
        assert!(second.contains("   |"));
    }

    #[test]
    fn jump_targets_are_shown_as_arrows() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write(Op::JumpIfFalse(5), 1);
        let line = disassemble_instruction(&chunk, &heap, 0);
        assert!(line.contains("-> 5"));
    }

    #[test]
    fn disassemble_chunk_includes_a_header() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write(Op::Return, 1);
        let out = disassemble_chunk(&chunk, &heap, "script");
        assert!(out.starts_with("== script ==\n"));
        assert!(out.contains("RETURN"));
    }
}
