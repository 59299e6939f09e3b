// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Per-block peephole rewrites and tail inlining.

use crate::compiler::cfg::{BlockId, Cfg, Instr};
use crate::compiler::flowgraph::swaps::{apply_static_swaps, swaptimize};
use crate::compiler::opcode::{AnyOp, Opcode, PseudoOp};
use crate::constant::{ConstCache, Constant};
use crate::error::{CompileError, Result};

/// Maximum number of constants a unit may hold.
pub const MAX_CONSTS: usize = u32::MAX as usize - 1;

pub(crate) fn const_at(consts: &[Constant], index: u32) -> Result<&Constant> {
    consts.get(index as usize).ok_or_else(|| {
        CompileError::internal(format!(
            "constant index {index} out of range ({} constants)",
            consts.len()
        ))
    })
}

/// The first instruction of a jump's destination, with the destination.
#[derive(Clone)]
struct JumpDest {
    block: BlockId,
    first: Instr,
}

fn jump_dest(cfg: &Cfg, instr: &Instr) -> Option<JumpDest> {
    if !instr.op.has_target() {
        return None;
    }
    let block = instr.target?;
    let first = cfg.block(block).instrs.first()?.clone();
    Some(JumpDest { block, first })
}

/// Retargets `instr` to the destination of the jump it lands on.
///
/// Only done when no line event would be lost and the target actually
/// changes.
fn jump_thread(instr: &mut Instr, dest: &Instr, op: AnyOp) -> bool {
    let same_line = instr.loc.line == dest.loc.line || dest.loc.line < 0;
    if same_line && instr.target != dest.target {
        instr.target = dest.target;
        instr.op = op;
        true
    } else {
        false
    }
}

const JUMP: AnyOp = AnyOp::Pseudo(PseudoOp::Jump);
const POP_JUMP_IF_FALSE: AnyOp = AnyOp::Pseudo(PseudoOp::PopJumpIfFalse);
const POP_JUMP_IF_TRUE: AnyOp = AnyOp::Pseudo(PseudoOp::PopJumpIfTrue);
const POP_JUMP_IF_NONE: AnyOp = AnyOp::Pseudo(PseudoOp::PopJumpIfNone);
const POP_JUMP_IF_NOT_NONE: AnyOp = AnyOp::Pseudo(PseudoOp::PopJumpIfNotNone);
const JUMP_IF_FALSE_OR_POP: AnyOp = AnyOp::Real(Opcode::JumpIfFalseOrPop);
const JUMP_IF_TRUE_OR_POP: AnyOp = AnyOp::Real(Opcode::JumpIfTrueOrPop);

/// Replaces `LOAD_CONST` x n; `BUILD_TUPLE n` with one `LOAD_CONST` of the
/// folded tuple.
fn fold_tuple_on_constants(
    instrs: &mut [Instr],
    start: usize,
    n: usize,
    consts: &mut Vec<Constant>,
    cache: &mut ConstCache,
) -> Result<()> {
    let window = &instrs[start..start + n];
    if !window.iter().all(|instr| instr.is(Opcode::LoadConst)) {
        return Ok(());
    }
    let items = window
        .iter()
        .map(|instr| const_at(consts, instr.arg).cloned())
        .collect::<Result<Vec<_>>>()?;
    let folded = cache.merge(Constant::tuple(items));
    let index = match consts.iter().position(|c| *c == folded) {
        Some(index) => index,
        None => {
            if consts.len() >= MAX_CONSTS {
                return Err(CompileError::overflow("too many constants"));
            }
            consts.push(folded);
            consts.len() - 1
        }
    };
    for instr in &mut instrs[start..start + n] {
        instr.set_nop();
    }
    instrs[start + n].set(Opcode::LoadConst, index as u32);
    Ok(())
}

/// Runs the peephole rewrites over one block.
pub(crate) fn optimize_basic_block(
    cfg: &mut Cfg,
    id: BlockId,
    consts: &mut Vec<Constant>,
    cache: &mut ConstCache,
) -> Result<()> {
    let thread_limit = cfg.blocks.len() * 2 + 8;
    let mut threads = 0;

    let mut opcode = AnyOp::Real(Opcode::Nop);
    let mut oparg = 0u32;
    let mut dest: Option<JumpDest> = None;

    let mut i = 0;
    while i < cfg.block(id).instrs.len() {
        let inst = cfg.block(id).instrs[i].clone();
        let is_copy_of_load_const =
            opcode.is(Opcode::LoadConst) && inst.is(Opcode::Copy) && inst.arg == 1;
        if !is_copy_of_load_const {
            opcode = inst.op;
            oparg = inst.arg;
            dest = jump_dest(cfg, &inst);
        }
        let block = &mut cfg.blocks[id.index()];
        let len = block.instrs.len();
        let nextop = block.instrs.get(i + 1).map(|next| next.op);
        let mut redo = false;

        match opcode {
            AnyOp::Real(Opcode::LoadConst) => match nextop {
                Some(next @ (POP_JUMP_IF_FALSE | POP_JUMP_IF_TRUE)) => {
                    let is_true = const_at(consts, oparg)?.is_truthy();
                    block.instrs[i].set_nop();
                    if is_true == (next == POP_JUMP_IF_TRUE) {
                        block.instrs[i + 1].op = JUMP;
                    } else {
                        block.instrs[i + 1].set_nop();
                    }
                }
                Some(next @ (JUMP_IF_FALSE_OR_POP | JUMP_IF_TRUE_OR_POP)) => {
                    let is_true = const_at(consts, oparg)?.is_truthy();
                    if is_true == (next == JUMP_IF_TRUE_OR_POP) {
                        block.instrs[i + 1].op = JUMP;
                    } else {
                        block.instrs[i].set_nop();
                        block.instrs[i + 1].set_nop();
                    }
                }
                Some(AnyOp::Real(Opcode::IsOp)) => {
                    if const_at(consts, oparg)?.is_none() && i + 2 < len {
                        let mut invert = block.instrs[i + 1].arg != 0;
                        let jump_op = block.instrs[i + 2].op;
                        let folds = match jump_op {
                            POP_JUMP_IF_FALSE => {
                                invert = !invert;
                                true
                            }
                            POP_JUMP_IF_TRUE => true,
                            _ => false,
                        };
                        if folds {
                            block.instrs[i].set_nop();
                            block.instrs[i + 1].set_nop();
                            block.instrs[i + 2].op = if invert {
                                POP_JUMP_IF_NOT_NONE
                            } else {
                                POP_JUMP_IF_NONE
                            };
                        }
                    }
                }
                Some(AnyOp::Real(Opcode::ReturnValue)) => {
                    block.instrs[i].set_nop();
                    i += 1;
                    block.instrs[i].set(Opcode::ReturnConst, oparg);
                }
                _ => {}
            },

            AnyOp::Real(Opcode::BuildTuple) => {
                let n = oparg as usize;
                let unpacks_same = nextop == Some(AnyOp::Real(Opcode::UnpackSequence))
                    && block.instrs[i + 1].arg == oparg;
                match n {
                    1 if unpacks_same => {
                        block.instrs[i].set_nop();
                        block.instrs[i + 1].set_nop();
                    }
                    2 | 3 if unpacks_same => {
                        block.instrs[i].set_nop();
                        block.instrs[i + 1].op = AnyOp::Real(Opcode::Swap);
                    }
                    _ if i >= n => {
                        fold_tuple_on_constants(&mut block.instrs, i - n, n, consts, cache)?;
                    }
                    _ => {}
                }
            }

            POP_JUMP_IF_NONE | POP_JUMP_IF_NOT_NONE | POP_JUMP_IF_FALSE | POP_JUMP_IF_TRUE
            | JUMP => {
                if let Some(dest) = &dest {
                    if dest.first.op == JUMP {
                        redo = jump_thread(&mut block.instrs[i], &dest.first, opcode);
                    }
                }
            }

            JUMP_IF_FALSE_OR_POP | JUMP_IF_TRUE_OR_POP => {
                if let Some(dest) = &dest {
                    let (same_cond, same_kind, opposite_kind, opposite_cond) =
                        if opcode == JUMP_IF_FALSE_OR_POP {
                            (
                                POP_JUMP_IF_FALSE,
                                JUMP_IF_FALSE_OR_POP,
                                JUMP_IF_TRUE_OR_POP,
                                POP_JUMP_IF_TRUE,
                            )
                        } else {
                            (
                                POP_JUMP_IF_TRUE,
                                JUMP_IF_TRUE_OR_POP,
                                JUMP_IF_FALSE_OR_POP,
                                POP_JUMP_IF_FALSE,
                            )
                        };
                    let target_op = dest.first.op;
                    if target_op == same_cond {
                        redo = jump_thread(&mut block.instrs[i], &dest.first, same_cond);
                    } else if target_op == JUMP || target_op == same_kind {
                        redo = jump_thread(&mut block.instrs[i], &dest.first, same_kind);
                    } else if target_op == opposite_kind || target_op == opposite_cond {
                        let after = cfg.blocks[dest.block.index()].next;
                        let block = &mut cfg.blocks[id.index()];
                        if let Some(after) = after {
                            if block.instrs[i].loc.line == dest.first.loc.line {
                                block.instrs[i].op = same_cond;
                                block.instrs[i].target = Some(after);
                                redo = true;
                            }
                        }
                    }
                }
            }

            AnyOp::Real(Opcode::Swap) => {
                if oparg == 1 {
                    block.instrs[i].set_nop();
                } else {
                    swaptimize(block, &mut i);
                    apply_static_swaps(block, i);
                }
            }

            AnyOp::Real(Opcode::PushNull) => {
                if nextop == Some(AnyOp::Real(Opcode::LoadGlobal))
                    && block.instrs[i + 1].arg & 1 == 0
                {
                    block.instrs[i].set_nop();
                    block.instrs[i + 1].arg |= 1;
                }
            }

            _ => {}
        }

        if redo && threads < thread_limit {
            threads += 1;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Replaces an unconditional jump to a short exit block with a copy of it.
pub(crate) fn inline_small_exit_block(cfg: &mut Cfg, id: BlockId, max_size: usize) -> bool {
    let Some(last) = cfg.block(id).last() else {
        return false;
    };
    if !last.op.is_unconditional_jump() {
        return false;
    }
    let Some(target) = last.target else {
        return false;
    };
    let target_block = cfg.block(target);
    if !target_block.exits_scope() || target_block.instrs.len() > max_size {
        return false;
    }
    let copy = target_block.instrs.clone();
    let block = cfg.block_mut(id);
    if let Some(last) = block.last_mut() {
        last.set_nop();
    }
    block.instrs.extend(copy);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Location;

    fn loc(line: i32) -> Location {
        Location::line_only(line)
    }

    fn ops(cfg: &Cfg, id: BlockId) -> Vec<AnyOp> {
        cfg.block(id).instrs.iter().map(|instr| instr.op).collect()
    }

    #[test]
    fn test_constant_true_condition_becomes_nops() {
        let mut cfg = Cfg::new();
        let else_label = cfg.new_label();
        cfg.addop(Opcode::LoadConst, 0, loc(1)).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfFalse, else_label, loc(1)).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(2)).unwrap();
        cfg.use_label(else_label).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(3)).unwrap();
        cfg.translate_labels().unwrap();

        let mut consts = vec![Constant::Bool(true)];
        let mut cache = ConstCache::new();
        let entry = cfg.entry;
        optimize_basic_block(&mut cfg, entry, &mut consts, &mut cache).unwrap();
        assert_eq!(
            ops(&cfg, entry),
            vec![AnyOp::Real(Opcode::Nop), AnyOp::Real(Opcode::Nop)]
        );
    }

    #[test]
    fn test_constant_false_condition_becomes_jump() {
        let mut cfg = Cfg::new();
        let else_label = cfg.new_label();
        cfg.addop(Opcode::LoadConst, 0, loc(1)).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfFalse, else_label, loc(1)).unwrap();
        cfg.use_label(else_label).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(3)).unwrap();
        cfg.translate_labels().unwrap();

        let mut consts = vec![Constant::from(0)];
        let mut cache = ConstCache::new();
        let entry = cfg.entry;
        optimize_basic_block(&mut cfg, entry, &mut consts, &mut cache).unwrap();
        assert_eq!(ops(&cfg, entry), vec![AnyOp::Real(Opcode::Nop), JUMP]);
    }

    #[test]
    fn test_is_none_comparison_folds_to_none_jump() {
        let mut cfg = Cfg::new();
        let target = cfg.new_label();
        cfg.addop(Opcode::LoadFast, 0, loc(1)).unwrap();
        cfg.addop(Opcode::LoadConst, 0, loc(1)).unwrap();
        cfg.addop(Opcode::IsOp, 1, loc(1)).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfFalse, target, loc(1)).unwrap();
        cfg.use_label(target).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(2)).unwrap();
        cfg.translate_labels().unwrap();

        let mut consts = vec![Constant::None];
        let mut cache = ConstCache::new();
        let entry = cfg.entry;
        optimize_basic_block(&mut cfg, entry, &mut consts, &mut cache).unwrap();
        // `x is not None` tested for falsehood jumps when x is None.
        assert_eq!(cfg.block(entry).instrs[3].op, POP_JUMP_IF_NONE);
    }

    #[test]
    fn test_load_const_return_becomes_return_const() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadConst, 1, loc(1)).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc(1)).unwrap();
        let mut consts = vec![Constant::None, Constant::from(5)];
        let mut cache = ConstCache::new();
        let entry = cfg.entry;
        optimize_basic_block(&mut cfg, entry, &mut consts, &mut cache).unwrap();
        let last = cfg.block(entry).last().unwrap();
        assert!(last.is(Opcode::ReturnConst));
        assert_eq!(last.arg, 1);
    }

    #[test]
    fn test_build_unpack_pair_becomes_swap() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadName, 0, loc(1)).unwrap();
        cfg.addop(Opcode::LoadName, 1, loc(1)).unwrap();
        cfg.addop(Opcode::BuildTuple, 2, loc(1)).unwrap();
        cfg.addop(Opcode::UnpackSequence, 2, loc(1)).unwrap();
        cfg.addop(Opcode::StoreName, 0, loc(1)).unwrap();
        cfg.addop(Opcode::StoreName, 1, loc(1)).unwrap();
        let mut consts = vec![];
        let mut cache = ConstCache::new();
        let entry = cfg.entry;
        optimize_basic_block(&mut cfg, entry, &mut consts, &mut cache).unwrap();
        let instrs = &cfg.block(entry).instrs;
        assert!(instrs[2].is(Opcode::Nop));
        assert!(instrs[3].is(Opcode::Swap));
        assert_eq!(instrs[3].arg, 2);
        assert!(!instrs.iter().any(|i| i.is(Opcode::BuildTuple)));
    }

    #[test]
    fn test_constant_tuple_is_folded() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadConst, 0, loc(1)).unwrap();
        cfg.addop(Opcode::LoadConst, 1, loc(1)).unwrap();
        cfg.addop(Opcode::BuildTuple, 2, loc(1)).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc(1)).unwrap();
        let mut consts = vec![Constant::from(1), Constant::from(2)];
        let mut cache = ConstCache::new();
        let entry = cfg.entry;
        optimize_basic_block(&mut cfg, entry, &mut consts, &mut cache).unwrap();
        assert_eq!(consts.len(), 3);
        assert_eq!(
            consts[2],
            Constant::tuple(vec![Constant::from(1), Constant::from(2)])
        );
        let instrs = &cfg.block(entry).instrs;
        assert!(instrs[2].is(Opcode::LoadConst));
        assert_eq!(instrs[2].arg, 2);
    }

    #[test]
    fn test_jump_to_jump_is_threaded() {
        let mut cfg = Cfg::new();
        let middle = cfg.new_label();
        let end = cfg.new_label();
        cfg.add_jump(PseudoOp::Jump, middle, loc(1)).unwrap();
        cfg.use_label(middle).unwrap();
        cfg.add_jump(PseudoOp::Jump, end, loc(1)).unwrap();
        cfg.use_label(end).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(2)).unwrap();
        cfg.translate_labels().unwrap();

        let mut consts = vec![Constant::None];
        let mut cache = ConstCache::new();
        let entry = cfg.entry;
        optimize_basic_block(&mut cfg, entry, &mut consts, &mut cache).unwrap();
        assert_eq!(cfg.block(entry).instrs[0].target, cfg.label_block(end));
    }

    #[test]
    fn test_push_null_fuses_into_load_global() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::PushNull, 0, loc(1)).unwrap();
        cfg.addop(Opcode::LoadGlobal, 4, loc(1)).unwrap();
        let mut consts = vec![];
        let mut cache = ConstCache::new();
        let entry = cfg.entry;
        optimize_basic_block(&mut cfg, entry, &mut consts, &mut cache).unwrap();
        assert_eq!(cfg.block(entry).instrs[1].arg, 5);
    }

    #[test]
    fn test_small_exit_block_is_inlined() {
        let mut cfg = Cfg::new();
        let exit = cfg.new_label();
        cfg.addop(Opcode::LoadName, 0, loc(1)).unwrap();
        cfg.add_jump(PseudoOp::Jump, exit, loc(1)).unwrap();
        cfg.use_label(exit).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(2)).unwrap();
        cfg.translate_labels().unwrap();
        let entry = cfg.entry;
        assert!(inline_small_exit_block(&mut cfg, entry, 4));
        let instrs = &cfg.block(entry).instrs;
        assert_eq!(instrs.len(), 3);
        assert!(instrs[1].is(Opcode::Nop));
        assert!(instrs[2].is(Opcode::ReturnConst));
        assert!(!inline_small_exit_block(&mut cfg, entry, 4));
    }
}
