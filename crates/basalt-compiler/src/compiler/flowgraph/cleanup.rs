// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Whole-graph cleanup: no-ops, empty and unreachable blocks, redundant
//! jumps, fall-through chains and unused constants.

use crate::compiler::cfg::{BlockId, Cfg};
use crate::compiler::opcode::Opcode;
use crate::constant::Constant;
use crate::error::{CompileError, Result};

/// Unlinks empty blocks and retargets every reference to the next
/// non-empty block in layout order.
pub(crate) fn eliminate_empty_blocks(cfg: &mut Cfg) -> Result<()> {
    let order = cfg.order();
    let mut resolved: Vec<Option<BlockId>> = vec![None; cfg.blocks.len()];
    let mut next_live = None;
    for &id in order.iter().rev() {
        if !cfg.block(id).instrs.is_empty() {
            next_live = Some(id);
        }
        resolved[id.index()] = next_live;
    }
    let live: Vec<BlockId> = order
        .iter()
        .copied()
        .filter(|id| !cfg.block(*id).instrs.is_empty())
        .collect();
    let Some(&first) = live.first() else {
        return Ok(());
    };
    if live.len() == order.len() {
        return Ok(());
    }

    for &id in &order {
        let block = cfg.block(id);
        if block.instrs.is_empty() && block.is_handler {
            let lasti = block.preserve_lasti;
            if let Some(to) = resolved[id.index()] {
                let to = cfg.block_mut(to);
                to.is_handler = true;
                to.preserve_lasti |= lasti;
            }
        }
    }

    cfg.entry = first;
    for pair in live.windows(2) {
        cfg.block_mut(pair[0]).next = Some(pair[1]);
    }
    if let Some(&last) = live.last() {
        cfg.block_mut(last).next = None;
    }

    let resolve = |id: BlockId| {
        resolved.get(id.index()).copied().flatten().ok_or_else(|| {
            CompileError::internal(format!("reference to block {} runs off the end", id.0))
        })
    };
    for &id in &live {
        for instr in &mut cfg.blocks[id.index()].instrs {
            if let Some(target) = instr.target {
                instr.target = Some(resolve(target)?);
            }
            if let Some(handler) = instr.handler {
                instr.handler = Some(resolve(handler)?);
            }
        }
    }
    Ok(())
}

fn next_first_line(cfg: &Cfg, id: BlockId) -> Option<i32> {
    let mut cursor = cfg.block(id).next;
    while let Some(next) = cursor {
        if let Some(first) = cfg.block(next).instrs.first() {
            return Some(first.loc.line);
        }
        cursor = cfg.block(next).next;
    }
    None
}

/// Drops `NOP`s that carry no line event of their own.
///
/// Returns how many were removed.
pub(crate) fn remove_redundant_nops(cfg: &mut Cfg, id: BlockId) -> usize {
    let following_line = next_first_line(cfg, id);
    let block = cfg.block_mut(id);
    let mut instrs = std::mem::take(&mut block.instrs);
    let count = instrs.len();
    let mut kept = Vec::with_capacity(count);
    let mut prev_line = -1;
    for src in 0..count {
        let line = instrs[src].loc.line;
        if instrs[src].is(Opcode::Nop) {
            if line < 0 || prev_line == line {
                continue;
            }
            if src + 1 < count {
                let next_line = instrs[src + 1].loc.line;
                if next_line == line {
                    continue;
                }
                if next_line < 0 {
                    instrs[src + 1].loc = instrs[src].loc;
                    continue;
                }
            } else if following_line == Some(line) {
                continue;
            }
        }
        kept.push(instrs[src].clone());
        prev_line = line;
    }
    instrs.clear();
    block.instrs = kept;
    count - block.instrs.len()
}

/// Removes `NOP`s and `LOAD_CONST`/`COPY 1` immediately discarded by `POP_TOP`.
///
/// Pairs may straddle a fall-through edge but never a jump target.
pub(crate) fn remove_redundant_nops_and_pairs(cfg: &mut Cfg) {
    let referenced = cfg.referenced_blocks();
    loop {
        let mut done = true;
        let mut last: Option<(BlockId, usize)> = None;
        for id in cfg.order() {
            remove_redundant_nops(cfg, id);
            if referenced[id.index()] || cfg.block(id).is_handler {
                last = None;
            }
            for i in 0..cfg.block(id).instrs.len() {
                let prev = last.replace((id, i));
                if !cfg.block(id).instrs[i].is(Opcode::PopTop) {
                    continue;
                }
                let Some((prev_block, prev_index)) = prev else {
                    continue;
                };
                let prev_instr = &cfg.block(prev_block).instrs[prev_index];
                let pushes_discardable = prev_instr.is(Opcode::LoadConst)
                    || (prev_instr.is(Opcode::Copy) && prev_instr.arg == 1);
                if pushes_discardable {
                    cfg.block_mut(prev_block).instrs[prev_index].set_nop();
                    cfg.block_mut(id).instrs[i].set_nop();
                    done = false;
                }
            }
            let block = cfg.block(id);
            if block.last().is_some_and(|instr| instr.op.is_jump()) || !block.has_fallthrough() {
                last = None;
            }
        }
        if done {
            break;
        }
    }
}

/// Clears every block that cannot be reached from the entry block, then
/// unlinks it.
pub(crate) fn remove_unreachable_blocks(cfg: &mut Cfg) -> Result<()> {
    cfg.mark_reachable();
    for id in cfg.order() {
        if cfg.block(id).predecessors == 0 {
            let block = cfg.block_mut(id);
            block.instrs.clear();
            block.is_handler = false;
        }
    }
    eliminate_empty_blocks(cfg)
}

/// Turns unconditional jumps to the layout successor into `NOP`s.
pub(crate) fn remove_redundant_jumps(cfg: &mut Cfg) -> bool {
    let mut changed = false;
    for id in cfg.order() {
        let next = cfg.block(id).next;
        if let Some(last) = cfg.block_mut(id).last_mut() {
            if last.op.is_unconditional_jump() && last.target.is_some() && last.target == next {
                last.set_nop();
                changed = true;
            }
        }
    }
    changed
}

/// Appends a block to its layout predecessor when control can only reach
/// it by falling through.
pub(crate) fn merge_fallthrough_chains(cfg: &mut Cfg) -> bool {
    let referenced = cfg.referenced_blocks();
    let mut changed = false;
    let mut cursor = Some(cfg.entry);
    while let Some(id) = cursor {
        let block = cfg.block(id);
        let Some(next) = block.next else {
            break;
        };
        let mergeable = !block.is_terminated()
            && !referenced[next.index()]
            && !cfg.block(next).is_handler;
        if !mergeable {
            cursor = Some(next);
            continue;
        }
        let moved = std::mem::take(&mut cfg.block_mut(next).instrs);
        let after = cfg.block_mut(next).next.take();
        let block = cfg.block_mut(id);
        block.instrs.extend(moved);
        block.next = after;
        changed = true;
    }
    changed
}

/// Drops constants no instruction refers to and renumbers the rest.
///
/// The first constant is always kept; it may be a docstring.
pub(crate) fn remove_unused_consts(cfg: &mut Cfg, consts: &mut Vec<Constant>) -> Result<()> {
    if consts.is_empty() {
        return Ok(());
    }
    let order = cfg.order();
    let mut used = vec![false; consts.len()];
    used[0] = true;
    for &id in &order {
        for instr in &cfg.block(id).instrs {
            if instr.op.real().is_some_and(Opcode::has_const) {
                let slot = used.get_mut(instr.arg as usize).ok_or_else(|| {
                    CompileError::internal(format!("{} refers to missing constant {}", instr.op, instr.arg))
                })?;
                *slot = true;
            }
        }
    }
    if used.iter().all(|u| *u) {
        return Ok(());
    }

    let mut remap = vec![0u32; consts.len()];
    let mut kept = Vec::with_capacity(consts.len());
    for (index, value) in std::mem::take(consts).into_iter().enumerate() {
        if used[index] {
            remap[index] = kept.len() as u32;
            kept.push(value);
        }
    }
    *consts = kept;

    for &id in &order {
        for instr in &mut cfg.blocks[id.index()].instrs {
            if instr.op.real().is_some_and(Opcode::has_const) {
                instr.arg = remap[instr.arg as usize];
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Location;
    use crate::compiler::opcode::PseudoOp;

    fn loc(line: i32) -> Location {
        Location::line_only(line)
    }

    #[test]
    fn test_nop_with_same_line_as_neighbour_is_removed() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadName, 0, loc(1)).unwrap();
        cfg.addop(Opcode::Nop, 0, loc(1)).unwrap();
        cfg.addop(Opcode::Nop, 0, loc(2)).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(3)).unwrap();
        let entry = cfg.entry;
        assert_eq!(remove_redundant_nops(&mut cfg, entry), 1);
        assert_eq!(cfg.block(entry).instrs.len(), 3);
    }

    #[test]
    fn test_nop_moves_line_to_unlocated_successor() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::Nop, 0, loc(4)).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, Location::NONE).unwrap();
        let entry = cfg.entry;
        remove_redundant_nops(&mut cfg, entry);
        let instrs = &cfg.block(entry).instrs;
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].loc.line, 4);
    }

    #[test]
    fn test_load_const_pop_top_pair_removed() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadConst, 0, loc(1)).unwrap();
        cfg.addop(Opcode::PopTop, 0, loc(1)).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(2)).unwrap();
        remove_redundant_nops_and_pairs(&mut cfg);
        let entry = cfg.entry;
        let instrs = &cfg.block(entry).instrs;
        assert_eq!(instrs.len(), 2);
        assert!(instrs[0].is(Opcode::Nop));
        assert_eq!(instrs[0].loc.line, 1);
        assert!(instrs[1].is(Opcode::ReturnConst));
        assert_eq!(instrs[1].loc.line, 2);
    }

    #[test]
    fn test_load_const_pop_top_pair_on_one_line_vanishes() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadConst, 0, loc(1)).unwrap();
        cfg.addop(Opcode::PopTop, 0, loc(1)).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(1)).unwrap();
        remove_redundant_nops_and_pairs(&mut cfg);
        let entry = cfg.entry;
        let instrs = &cfg.block(entry).instrs;
        assert_eq!(instrs.len(), 1);
        assert!(instrs[0].is(Opcode::ReturnConst));
    }

    #[test]
    fn test_unreachable_block_removed_and_jump_dropped() {
        let mut cfg = Cfg::new();
        let end = cfg.new_label();
        cfg.add_jump(PseudoOp::Jump, end, loc(1)).unwrap();
        cfg.addop(Opcode::LoadName, 0, loc(2)).unwrap();
        cfg.addop(Opcode::PopTop, 0, loc(2)).unwrap();
        cfg.use_label(end).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(3)).unwrap();
        cfg.translate_labels().unwrap();

        remove_unreachable_blocks(&mut cfg).unwrap();
        assert_eq!(cfg.order().len(), 2);
        assert!(remove_redundant_jumps(&mut cfg));
        assert!(cfg.block(cfg.entry).instrs[0].is(Opcode::Nop));
    }

    #[test]
    fn test_empty_block_jump_is_retargeted() {
        let mut cfg = Cfg::new();
        let empty = cfg.new_label();
        cfg.addop(Opcode::LoadName, 0, loc(1)).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfTrue, empty, loc(1)).unwrap();
        cfg.addop(Opcode::Nop, 0, loc(2)).unwrap();
        cfg.use_label(empty).unwrap();
        let tail = cfg.new_label();
        cfg.use_label(tail).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(3)).unwrap();
        cfg.translate_labels().unwrap();

        eliminate_empty_blocks(&mut cfg).unwrap();
        let order = cfg.order();
        assert_eq!(order.len(), 3);
        let jump = cfg.block(order[0]).last().unwrap();
        assert_eq!(jump.target, Some(order[2]));
    }

    #[test]
    fn test_fallthrough_chain_merges() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadName, 0, loc(1)).unwrap();
        let split = cfg.new_label();
        cfg.use_label(split).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc(1)).unwrap();
        cfg.translate_labels().unwrap();
        assert_eq!(cfg.order().len(), 2);
        assert!(merge_fallthrough_chains(&mut cfg));
        assert_eq!(cfg.order().len(), 1);
        assert_eq!(cfg.block(cfg.entry).instrs.len(), 2);
    }

    #[test]
    fn test_unused_consts_compacted() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadConst, 2, loc(1)).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc(1)).unwrap();
        let mut consts = vec![Constant::None, Constant::from(1), Constant::from(2)];
        remove_unused_consts(&mut cfg, &mut consts).unwrap();
        assert_eq!(consts, vec![Constant::None, Constant::from(2)]);
        assert_eq!(cfg.block(cfg.entry).instrs[0].arg, 1);
    }
}
