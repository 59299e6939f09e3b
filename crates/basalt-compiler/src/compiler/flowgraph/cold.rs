// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Hot/cold partitioning.

use crate::ast::Location;
use crate::compiler::cfg::{BlockId, Cfg, Instr};
use crate::compiler::opcode::PseudoOp;

use super::cleanup::remove_redundant_jumps;

fn successors(cfg: &Cfg, id: BlockId) -> Vec<BlockId> {
    let block = cfg.block(id);
    let mut out: Vec<BlockId> = block
        .instrs
        .iter()
        .filter(|instr| instr.op.is_jump())
        .filter_map(|instr| instr.target)
        .collect();
    if block.has_fallthrough() {
        out.extend(block.next);
    }
    out
}

fn mark_warm(cfg: &mut Cfg) {
    let entry = cfg.entry;
    cfg.block_mut(entry).visited = true;
    let mut stack = vec![entry];
    while let Some(id) = stack.pop() {
        cfg.block_mut(id).warm = true;
        for succ in successors(cfg, id) {
            if !cfg.block(succ).visited {
                cfg.block_mut(succ).visited = true;
                stack.push(succ);
            }
        }
    }
}

fn mark_cold(cfg: &mut Cfg) {
    for block in &mut cfg.blocks {
        block.cold = false;
        block.warm = false;
        block.visited = false;
    }
    mark_warm(cfg);

    let mut stack = Vec::new();
    for id in cfg.order() {
        let block = cfg.block_mut(id);
        if block.is_handler && !block.warm {
            block.visited = true;
            stack.push(id);
        }
    }
    while let Some(id) = stack.pop() {
        cfg.block_mut(id).cold = true;
        for succ in successors(cfg, id) {
            let block = cfg.block_mut(succ);
            if !block.warm && !block.visited {
                block.visited = true;
                stack.push(succ);
            }
        }
    }
}

/// Moves blocks reachable only through exception edges to the end of the
/// layout.
///
/// Wherever a cold block falls through into a warm one, an explicit jump
/// is inserted first so the move preserves control flow.
pub(crate) fn push_cold_blocks_to_end(cfg: &mut Cfg) {
    if cfg.block(cfg.entry).next.is_none() {
        return;
    }
    mark_cold(cfg);

    for id in cfg.order() {
        let block = cfg.block(id);
        let Some(next) = block.next else {
            continue;
        };
        if block.cold && block.has_fallthrough() && cfg.block(next).warm {
            let jump = cfg.new_block();
            let explicit = cfg.block_mut(jump);
            explicit
                .instrs
                .push(Instr::jump(PseudoOp::Jump, next, Location::NONE));
            explicit.cold = true;
            explicit.predecessors = 1;
            explicit.next = Some(next);
            cfg.block_mut(id).next = Some(jump);
        }
    }

    let mut cold_head: Option<BlockId> = None;
    let mut cold_tail: Option<BlockId> = None;
    let mut b = cfg.entry;
    loop {
        while let Some(next) = cfg.block(b).next {
            if cfg.block(next).cold {
                break;
            }
            b = next;
        }
        let Some(streak_start) = cfg.block(b).next else {
            break;
        };
        let mut streak_end = streak_start;
        while let Some(next) = cfg.block(streak_end).next {
            if !cfg.block(next).cold {
                break;
            }
            streak_end = next;
        }
        match cold_tail {
            None => cold_head = Some(streak_start),
            Some(tail) => cfg.block_mut(tail).next = Some(streak_start),
        }
        cold_tail = Some(streak_end);
        let after = cfg.block_mut(streak_end).next.take();
        cfg.block_mut(b).next = after;
    }
    cfg.block_mut(b).next = cold_head;

    if cold_head.is_some() {
        remove_redundant_jumps(cfg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::flowgraph::except::mark_except_handlers;
    use crate::compiler::opcode::Opcode;

    fn loc(line: i32) -> Location {
        Location::line_only(line)
    }

    #[test]
    fn test_handler_moves_after_warm_code() {
        // try: x
        // except: pass
        // return
        let mut cfg = Cfg::new();
        let handler = cfg.new_label();
        let exit = cfg.new_label();
        cfg.add_jump(PseudoOp::SetupFinally, handler, loc(1)).unwrap();
        cfg.addop(Opcode::LoadName, 0, loc(2)).unwrap();
        cfg.addop(Opcode::PopTop, 0, loc(2)).unwrap();
        cfg.addop(PseudoOp::PopBlock, 0, loc(2)).unwrap();
        cfg.add_jump(PseudoOp::Jump, exit, loc(2)).unwrap();
        cfg.use_label(handler).unwrap();
        cfg.addop(Opcode::PushExcInfo, 0, loc(3)).unwrap();
        cfg.addop(Opcode::PopTop, 0, loc(3)).unwrap();
        cfg.addop(Opcode::PopExcept, 0, loc(3)).unwrap();
        cfg.use_label(exit).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(4)).unwrap();
        cfg.translate_labels().unwrap();
        mark_except_handlers(&mut cfg);

        let handler_block = cfg.label_block(handler).unwrap();
        let exit_block = cfg.label_block(exit).unwrap();
        push_cold_blocks_to_end(&mut cfg);

        let order = cfg.order();
        assert!(cfg.block(handler_block).cold);
        assert!(!cfg.block(exit_block).cold);
        let handler_pos = order.iter().position(|id| *id == handler_block).unwrap();
        let exit_pos = order.iter().position(|id| *id == exit_block).unwrap();
        assert!(exit_pos < handler_pos);

        // The handler used to fall into the exit block; it now jumps there.
        let bridge = cfg.block(order[handler_pos + 1]);
        assert!(bridge.instrs[0].op.is_pseudo(PseudoOp::Jump));
        assert_eq!(bridge.instrs[0].target, Some(exit_block));
        // The warm jump to the exit became a NOP once they were adjacent.
        assert!(cfg.block(order[0]).last().unwrap().is(Opcode::Nop));
    }

    #[test]
    fn test_single_block_untouched() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::ReturnConst, 0, loc(1)).unwrap();
        push_cold_blocks_to_end(&mut cfg);
        assert_eq!(cfg.order().len(), 1);
        assert!(!cfg.block(cfg.entry).warm);
    }
}
