// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Bytecode decoder and disassembler.

use std::fmt::Write;

use crate::compiler::assemble::{decode_exception_table, decode_linetable};
use crate::compiler::code::CodeObject;
use crate::compiler::opcode::{JumpDirection, Opcode};
use crate::error::{CompileError, Result};

/// One decoded instruction, `EXTENDED_ARG` prefixes folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstr {
    /// Code unit of the first prefix (or of the instruction itself)
    pub start: u32,
    /// Code unit of the instruction proper
    pub offset: u32,
    /// The opcode
    pub op: Opcode,
    /// Full operand
    pub arg: u32,
}

/// Decodes instruction bytes.
pub fn decode(code: &[u8]) -> Result<Vec<DecodedInstr>> {
    if code.len() % 2 != 0 {
        return Err(CompileError::internal("code has an odd number of bytes"));
    }
    let mut out = Vec::new();
    let mut extended = 0u32;
    let mut start = None;
    for (unit, pair) in code.chunks_exact(2).enumerate() {
        let op = Opcode::from_byte(pair[0]).ok_or_else(|| {
            CompileError::internal(format!("unknown opcode {} at unit {unit}", pair[0]))
        })?;
        let arg = (extended << 8) | u32::from(pair[1]);
        let unit = unit as u32;
        if op == Opcode::ExtendedArg {
            start.get_or_insert(unit);
            extended = arg;
            continue;
        }
        out.push(DecodedInstr {
            start: start.take().unwrap_or(unit),
            offset: unit,
            op,
            arg,
        });
        extended = 0;
    }
    Ok(out)
}

/// Absolute target of a relative jump at `offset`, if `op` is one.
pub fn jump_target(offset: u32, op: Opcode, arg: u32) -> Option<u32> {
    match op.jump_direction()? {
        JumpDirection::Forward => Some(offset + 1 + arg),
        JumpDirection::Backward => (offset + 1).checked_sub(arg),
    }
}

fn argument_preview(code: &CodeObject, instr: &DecodedInstr) -> Option<String> {
    let op = instr.op;
    let arg = instr.arg as usize;
    if op.has_const() {
        return code.consts.get(arg).map(|c| c.to_string());
    }
    if let Some(target) = jump_target(instr.offset, op, instr.arg) {
        return Some(format!("to {target}"));
    }
    match op {
        Opcode::LoadGlobal => code
            .names
            .get(arg >> 1)
            .map(|n| if arg & 1 != 0 { format!("NULL + {n}") } else { n.clone() }),
        Opcode::LoadAttr => code
            .names
            .get(arg >> 1)
            .map(|n| if arg & 1 != 0 { format!("{n} + NULL|self") } else { n.clone() }),
        _ if op.has_name() => code.names.get(arg).cloned(),
        _ if op.has_local() => code.localsplusnames.get(arg).cloned(),
        Opcode::CompareOp => ["<", "<=", "==", "!=", ">", ">="]
            .get(arg)
            .map(|s| (*s).to_string()),
        Opcode::IsOp => Some(if arg == 0 { "is" } else { "is not" }.to_string()),
        Opcode::ContainsOp => Some(if arg == 0 { "in" } else { "not in" }.to_string()),
        _ => None,
    }
}

/// Renders a code object as a human-readable listing.
///
/// Lines are `line  offset OPNAME arg (preview)`; the line column is only
/// filled when it changes. The exception table follows the instructions.
pub fn disassemble(code: &CodeObject) -> Result<String> {
    let instrs = decode(&code.code)?;
    let locations = decode_linetable(&code.linetable, code.firstlineno)?;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Disassembly of {} (stack {}, flags {:#x}):",
        code.qualname,
        code.stacksize,
        code.flags.bits()
    );
    let mut last_line = None;
    for instr in &instrs {
        let line = locations
            .get(instr.offset as usize)
            .map(|loc| loc.line)
            .filter(|line| *line >= 0);
        let line_column = match line {
            Some(line) if last_line != Some(line) => {
                last_line = Some(line);
                format!("{line:>4}")
            }
            _ => "    ".to_string(),
        };
        let mut text = format!("{line_column} {:>6} {:<28}", instr.offset * 2, instr.op.name());
        if instr.op.has_arg() {
            let _ = write!(text, " {}", instr.arg);
            if let Some(preview) = argument_preview(code, instr) {
                let _ = write!(text, " ({preview})");
            }
        }
        out.push_str(text.trim_end());
        out.push('\n');
    }

    let entries = decode_exception_table(&code.exceptiontable)?;
    if !entries.is_empty() {
        out.push_str("ExceptionTable:\n");
        for entry in entries {
            let _ = writeln!(
                out,
                "  {} to {} -> {} [{}]{}",
                entry.start * 2,
                entry.end * 2,
                entry.target * 2,
                entry.depth,
                if entry.lasti { " lasti" } else { "" }
            );
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_folds_extended_args() {
        let code = [144, 1, 100, 44, 83, 0];
        let decoded = decode(&code).unwrap();
        assert_eq!(
            decoded,
            vec![
                DecodedInstr {
                    start: 0,
                    offset: 1,
                    op: Opcode::LoadConst,
                    arg: 300,
                },
                DecodedInstr {
                    start: 2,
                    offset: 2,
                    op: Opcode::ReturnValue,
                    arg: 0,
                },
            ]
        );
    }

    #[test]
    fn test_jump_targets() {
        assert_eq!(jump_target(3, Opcode::JumpForward, 2), Some(6));
        assert_eq!(jump_target(3, Opcode::JumpBackward, 3), Some(1));
        assert_eq!(jump_target(3, Opcode::LoadConst, 3), None);
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        assert!(decode(&[0, 0]).is_err());
        assert!(decode(&[1]).is_err());
    }
}
