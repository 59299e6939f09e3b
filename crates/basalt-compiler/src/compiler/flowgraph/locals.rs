// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Possibly-uninitialized local detection.
//!
//! Every `LOAD_FAST` that may observe an unbound slot is rewritten to
//! `LOAD_FAST_CHECK`. The first 64 slots are tracked precisely with one
//! bitmask per block, propagated along fall-through, jump and handler edges
//! until nothing changes. Slots past that are only tracked within a block.

use crate::compiler::cfg::{BlockId, Cfg};
use crate::compiler::opcode::{AnyOp, Opcode};

const MASK_BITS: usize = 64;

struct Scan {
    unsafe_masks: Vec<u64>,
    on_stack: Vec<bool>,
    stack: Vec<BlockId>,
}

impl Scan {
    fn maybe_push(&mut self, id: BlockId, unsafe_mask: u64) {
        let slot = &mut self.unsafe_masks[id.index()];
        let both = *slot | unsafe_mask;
        if *slot != both {
            *slot = both;
            if !self.on_stack[id.index()] {
                self.on_stack[id.index()] = true;
                self.stack.push(id);
            }
        }
    }

    fn scan_block(&mut self, cfg: &mut Cfg, id: BlockId) {
        let mut unsafe_mask = self.unsafe_masks[id.index()];
        let count = cfg.block(id).instrs.len();
        for i in 0..count {
            let instr = &mut cfg.blocks[id.index()].instrs[i];
            if let Some(handler) = instr.handler {
                self.maybe_push(handler, unsafe_mask);
            }
            if instr.arg as usize >= MASK_BITS {
                continue;
            }
            let bit = 1u64 << instr.arg;
            match instr.op {
                AnyOp::Real(Opcode::DeleteFast) => unsafe_mask |= bit,
                AnyOp::Real(Opcode::StoreFast | Opcode::LoadFastCheck) => unsafe_mask &= !bit,
                AnyOp::Real(Opcode::LoadFast) => {
                    if unsafe_mask & bit != 0 {
                        instr.op = AnyOp::Real(Opcode::LoadFastCheck);
                    }
                    unsafe_mask &= !bit;
                }
                _ => {}
            }
        }
        let block = cfg.block(id);
        if block.has_fallthrough() {
            if let Some(next) = block.next {
                self.maybe_push(next, unsafe_mask);
            }
        }
        if let Some(last) = block.last() {
            if last.op.is_jump() {
                if let Some(target) = last.target {
                    self.maybe_push(target, unsafe_mask);
                }
            }
        }
    }
}

/// Per-block approximation for slots 64 and up: a load is trusted only
/// after a store or load of the same slot earlier in its own block.
fn fast_scan_many_locals(cfg: &mut Cfg, nlocals: usize) {
    let mut states = vec![0usize; nlocals - MASK_BITS];
    let mut blocknum = 0usize;
    for id in cfg.order() {
        blocknum += 1;
        for instr in &mut cfg.blocks[id.index()].instrs {
            let arg = instr.arg as usize;
            if arg < MASK_BITS || arg >= nlocals {
                continue;
            }
            let state = &mut states[arg - MASK_BITS];
            match instr.op {
                AnyOp::Real(Opcode::DeleteFast) => *state = blocknum - 1,
                AnyOp::Real(Opcode::StoreFast) => *state = blocknum,
                AnyOp::Real(Opcode::LoadFast) => {
                    if *state != blocknum {
                        instr.op = AnyOp::Real(Opcode::LoadFastCheck);
                    }
                    *state = blocknum;
                }
                _ => {}
            }
        }
    }
}

/// Rewrites loads of locals that may be unbound into checked loads.
///
/// Parameters (the first `nparams` slots) start bound; every other local
/// starts unbound.
pub(crate) fn add_checks_for_loads_of_uninitialized_variables(
    cfg: &mut Cfg,
    nlocals: usize,
    nparams: usize,
) {
    if nlocals == 0 {
        return;
    }
    let tracked = if nlocals > MASK_BITS {
        fast_scan_many_locals(cfg, nlocals);
        MASK_BITS
    } else {
        nlocals
    };

    let mut scan = Scan {
        unsafe_masks: vec![0; cfg.blocks.len()],
        on_stack: vec![false; cfg.blocks.len()],
        stack: Vec::new(),
    };
    let start_mask = (nparams..tracked).fold(0u64, |mask, i| mask | (1u64 << i));
    scan.maybe_push(cfg.entry, start_mask);

    for id in cfg.order() {
        scan.scan_block(cfg, id);
    }
    while let Some(id) = scan.stack.pop() {
        scan.on_stack[id.index()] = false;
        scan.scan_block(cfg, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Location;
    use crate::compiler::opcode::PseudoOp;

    fn loc() -> Location {
        Location::line_only(1)
    }

    fn loads(cfg: &Cfg) -> Vec<AnyOp> {
        cfg.order()
            .into_iter()
            .flat_map(|id| cfg.block(id).instrs.iter().map(|i| i.op))
            .filter(|op| op.is(Opcode::LoadFast) || op.is(Opcode::LoadFastCheck))
            .collect()
    }

    #[test]
    fn test_parameter_load_is_unchecked() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadFast, 0, loc()).unwrap();
        cfg.addop(Opcode::LoadFast, 1, loc()).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc()).unwrap();
        add_checks_for_loads_of_uninitialized_variables(&mut cfg, 2, 1);
        assert_eq!(
            loads(&cfg),
            vec![
                AnyOp::Real(Opcode::LoadFast),
                AnyOp::Real(Opcode::LoadFastCheck)
            ]
        );
    }

    #[test]
    fn test_conditional_store_requires_check() {
        // if c: x = 1
        // return x
        let mut cfg = Cfg::new();
        let join = cfg.new_label();
        cfg.addop(Opcode::LoadFast, 0, loc()).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfFalse, join, loc()).unwrap();
        cfg.addop(Opcode::LoadConst, 0, loc()).unwrap();
        cfg.addop(Opcode::StoreFast, 1, loc()).unwrap();
        cfg.use_label(join).unwrap();
        cfg.addop(Opcode::LoadFast, 1, loc()).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc()).unwrap();
        cfg.translate_labels().unwrap();
        add_checks_for_loads_of_uninitialized_variables(&mut cfg, 2, 1);
        assert_eq!(loads(&cfg)[1], AnyOp::Real(Opcode::LoadFastCheck));
    }

    #[test]
    fn test_store_on_every_path_needs_no_check() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadConst, 0, loc()).unwrap();
        cfg.addop(Opcode::StoreFast, 0, loc()).unwrap();
        cfg.addop(Opcode::LoadFast, 0, loc()).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc()).unwrap();
        add_checks_for_loads_of_uninitialized_variables(&mut cfg, 1, 0);
        assert_eq!(loads(&cfg), vec![AnyOp::Real(Opcode::LoadFast)]);
    }

    #[test]
    fn test_delete_on_one_path_with_many_locals() {
        // 70 locals, all stored up front; slot 3 is deleted on one branch
        // and read after the join.
        let mut cfg = Cfg::new();
        let join = cfg.new_label();
        for slot in 0..70 {
            cfg.addop(Opcode::LoadConst, 0, loc()).unwrap();
            cfg.addop(Opcode::StoreFast, slot, loc()).unwrap();
        }
        cfg.addop(Opcode::LoadFast, 0, loc()).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfFalse, join, loc()).unwrap();
        cfg.addop(Opcode::DeleteFast, 3, loc()).unwrap();
        cfg.use_label(join).unwrap();
        cfg.addop(Opcode::LoadFast, 3, loc()).unwrap();
        cfg.addop(Opcode::LoadFast, 69, loc()).unwrap();
        cfg.addop(Opcode::BuildTuple, 2, loc()).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc()).unwrap();
        cfg.translate_labels().unwrap();
        add_checks_for_loads_of_uninitialized_variables(&mut cfg, 70, 0);

        let join_block = cfg.label_block(join).unwrap();
        let instrs = &cfg.block(join_block).instrs;
        assert!(instrs[0].is(Opcode::LoadFastCheck));
        // Slots past the mask are only trusted within their own block.
        assert!(instrs[1].is(Opcode::LoadFastCheck));
        // The condition read in the entry block follows its store.
        assert!(cfg.block(cfg.entry).instrs[140].is(Opcode::LoadFast));
    }
}
