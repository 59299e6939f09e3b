// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Line-number resolution for synthetic instructions.

use crate::ast::Location;
use crate::compiler::cfg::{BlockId, Cfg};
use crate::compiler::opcode::Opcode;

/// Gives every shared exit block without a line number one copy per jump,
/// so each copy can carry the line of the jump that reaches it.
fn duplicate_exits_without_lineno(cfg: &mut Cfg) {
    let mut cursor = Some(cfg.entry);
    while let Some(id) = cursor {
        cursor = cfg.block(id).next;
        let Some(last) = cfg.block(id).last() else {
            continue;
        };
        if !last.op.is_jump() {
            continue;
        }
        let (jump_loc, Some(target)) = (last.loc, last.target) else {
            continue;
        };
        let shared = cfg.block(target);
        if !shared.is_exit_without_lineno() || shared.predecessors <= 1 {
            continue;
        }
        let copy = cfg.copy_block(target);
        cfg.block_mut(copy).instrs[0].loc = jump_loc;
        if let Some(last) = cfg.block_mut(id).last_mut() {
            last.target = Some(copy);
        }
        let after = cfg.block(target).next;
        cfg.block_mut(target).predecessors -= 1;
        cfg.block_mut(target).next = Some(copy);
        let copied = cfg.block_mut(copy);
        copied.predecessors = 1;
        copied.next = after;
        cursor = cfg.block(id).next;
    }

    // Exits still without a line can only be reached by falling through.
    for id in cfg.order() {
        let block = cfg.block(id);
        let (Some(next), Some(last)) = (block.next, block.last()) else {
            continue;
        };
        if block.has_fallthrough() && cfg.block(next).is_exit_without_lineno() {
            let loc = last.loc;
            cfg.block_mut(next).instrs[0].loc = loc;
        }
    }
}

fn inherit_first_location(cfg: &mut Cfg, id: BlockId, loc: Location) {
    let block = cfg.block_mut(id);
    if block.predecessors == 1 {
        if let Some(first) = block.instrs.first_mut() {
            if first.loc.line < 0 {
                first.loc = loc;
            }
        }
    }
}

fn propagate_line_numbers(cfg: &mut Cfg) {
    for id in cfg.order() {
        if cfg.block(id).instrs.is_empty() {
            continue;
        }
        let mut prev = Location::NONE;
        for instr in &mut cfg.block_mut(id).instrs {
            if instr.loc.line < 0 {
                instr.loc = prev;
            } else {
                prev = instr.loc;
            }
        }
        let block = cfg.block(id);
        let fallthrough = block.next.filter(|_| block.has_fallthrough());
        let jump_target = block
            .last()
            .filter(|last| last.op.is_jump())
            .and_then(|last| last.target);
        if let Some(next) = fallthrough {
            inherit_first_location(cfg, next, prev);
        }
        if let Some(target) = jump_target {
            inherit_first_location(cfg, target, prev);
        }
    }
}

/// Returns left without a line get the line of the closest preceding block
/// that has one (or the first line of the scope).
fn guarantee_lineno_for_exits(cfg: &mut Cfg, firstlineno: i32) {
    let mut lineno = firstlineno;
    for id in cfg.order() {
        let block = cfg.block_mut(id);
        let Some(last) = block.last() else {
            continue;
        };
        if last.loc.line >= 0 {
            lineno = last.loc.line;
            continue;
        }
        if last.is(Opcode::ReturnValue) || last.is(Opcode::ReturnConst) {
            for instr in &mut block.instrs {
                if instr.loc.line < 0 {
                    instr.loc = Location::line_only(lineno);
                }
            }
        }
    }
}

/// Fills in locations for instructions the code generator left without one.
pub(crate) fn resolve_line_numbers(cfg: &mut Cfg, firstlineno: i32) {
    cfg.mark_reachable();
    duplicate_exits_without_lineno(cfg);
    propagate_line_numbers(cfg);
    guarantee_lineno_for_exits(cfg, firstlineno);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::opcode::PseudoOp;

    #[test]
    fn test_shared_exit_is_duplicated_per_jump() {
        // if a: b
        // (implicit return, shared by both arms)
        let mut cfg = Cfg::new();
        let exit = cfg.new_label();
        cfg.addop(Opcode::LoadName, 0, Location::line_only(1)).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfFalse, exit, Location::line_only(1)).unwrap();
        cfg.addop(Opcode::LoadName, 1, Location::line_only(2)).unwrap();
        cfg.addop(Opcode::PopTop, 0, Location::line_only(2)).unwrap();
        cfg.use_label(exit).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, Location::NONE).unwrap();
        cfg.translate_labels().unwrap();

        resolve_line_numbers(&mut cfg, 1);
        let order = cfg.order();
        assert_eq!(order.len(), 4);
        let lines: Vec<i32> = order
            .iter()
            .map(|id| cfg.block(*id).instrs[0].loc.line)
            .collect();
        // Fall-through copy gets line 2, the jump's copy gets line 1.
        assert_eq!(lines, vec![1, 2, 2, 1]);
        let jump = cfg.block(order[0]).last().unwrap();
        assert_eq!(jump.target, Some(order[3]));
    }

    #[test]
    fn test_locations_propagate_within_block() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadName, 0, Location::line_only(5)).unwrap();
        cfg.addop(Opcode::PopTop, 0, Location::NONE).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, Location::NONE).unwrap();
        resolve_line_numbers(&mut cfg, 1);
        assert!(cfg.block(cfg.entry).instrs.iter().all(|i| i.loc.line == 5));
    }

    #[test]
    fn test_unlocated_return_gets_first_line() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::ReturnConst, 0, Location::NONE).unwrap();
        resolve_line_numbers(&mut cfg, 7);
        assert_eq!(cfg.block(cfg.entry).instrs[0].loc, Location::line_only(7));
    }
}
