// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Stack-shuffle fusion.
//!
//! A run of `SWAP`s and `NOP`s is simulated on a model stack and rewritten
//! as the shortest sequence of swaps realizing the same permutation: each
//! cycle of the permutation is walked through position zero, the only slot
//! a `SWAP` can exchange with. The rewritten swaps are placed from the end
//! of the run backwards, so undoing the shuffle in reverse performs it.

use crate::compiler::cfg::{BasicBlock, Instr};
use crate::compiler::opcode::Opcode;

const VISITED: i64 = -1;

/// Rewrites the swap run starting at `*ix` into its minimal form.
///
/// On return `*ix` points at the last instruction of the run.
pub(crate) fn swaptimize(block: &mut BasicBlock, ix: &mut usize) {
    let instrs = &mut block.instrs[*ix..];
    let mut depth = instrs[0].arg as usize;
    let mut len = 1;
    let mut more = false;
    while len < instrs.len() {
        let instr = &instrs[len];
        if instr.is(Opcode::Swap) {
            depth = depth.max(instr.arg as usize);
            more = true;
        } else if !instr.is(Opcode::Nop) {
            break;
        }
        len += 1;
    }
    if !more || instrs[..len].iter().any(|i| i.is(Opcode::Swap) && i.arg == 0) {
        return;
    }

    let mut stack: Vec<i64> = (0..depth as i64).collect();
    for instr in &instrs[..len] {
        if instr.is(Opcode::Swap) {
            let other = instr.arg as usize - 1;
            stack.swap(0, other);
        }
    }

    // `current` counts the slots still free, filled from the back.
    let mut current = len;
    for i in 0..depth {
        if stack[i] == VISITED || stack[i] == i as i64 {
            continue;
        }
        let mut j = i;
        loop {
            if j != 0 {
                current -= 1;
                instrs[current].set(Opcode::Swap, j as u32 + 1);
            }
            if stack[j] == VISITED {
                break;
            }
            let next = stack[j] as usize;
            stack[j] = VISITED;
            j = next;
        }
    }
    for instr in &mut instrs[..current] {
        instr.set_nop();
    }
    *ix += len - 1;
}

fn is_swappable(instr: &Instr) -> bool {
    instr.is(Opcode::StoreFast) || instr.is(Opcode::PopTop)
}

fn stores_to(instr: &Instr) -> Option<u32> {
    instr.is(Opcode::StoreFast).then_some(instr.arg)
}

fn next_swappable(block: &BasicBlock, mut i: usize, line: Option<i32>) -> Option<usize> {
    loop {
        i += 1;
        let instr = block.instrs.get(i)?;
        if let Some(line) = line {
            if line >= 0 && instr.loc.line != line {
                return None;
            }
        }
        if instr.is(Opcode::Nop) {
            continue;
        }
        return is_swappable(instr).then_some(i);
    }
}

/// Removes swaps whose operands are immediately consumed by stores or pops
/// by reordering those consumers instead.
///
/// `SWAP 2; POP_TOP; STORE_FAST x` becomes `NOP; STORE_FAST x; POP_TOP`.
pub(crate) fn apply_static_swaps(block: &mut BasicBlock, end: usize) {
    let mut i = end as isize;
    while i >= 0 {
        let idx = i as usize;
        i -= 1;
        let swap = &block.instrs[idx];
        if !swap.is(Opcode::Swap) {
            if swap.is(Opcode::Nop) || is_swappable(swap) {
                continue;
            }
            return;
        }
        let count = swap.arg;
        let Some(j) = next_swappable(block, idx, None) else {
            return;
        };
        let line = block.instrs[j].loc.line;
        let mut k = j;
        for _ in 1..count {
            match next_swappable(block, k, Some(line)) {
                Some(next) => k = next,
                None => return,
            }
        }

        let store_j = stores_to(&block.instrs[j]);
        let store_k = stores_to(&block.instrs[k]);
        if store_j.is_some() || store_k.is_some() {
            if store_j == store_k {
                return;
            }
            let clash = block.instrs[j + 1..k].iter().any(|instr| {
                stores_to(instr).is_some_and(|slot| Some(slot) == store_j || Some(slot) == store_k)
            });
            if clash {
                return;
            }
        }

        block.instrs[idx].set_nop();
        block.instrs.swap(j, k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Location;

    fn block(ops: &[(Opcode, u32)]) -> BasicBlock {
        BasicBlock {
            instrs: ops
                .iter()
                .map(|(op, arg)| Instr::new(*op, *arg, Location::line_only(1)))
                .collect(),
            ..BasicBlock::default()
        }
    }

    fn ops(block: &BasicBlock) -> Vec<(Opcode, u32)> {
        block
            .instrs
            .iter()
            .map(|instr| (instr.op.real().unwrap(), instr.arg))
            .collect()
    }

    #[test]
    fn test_double_swap_cancels() {
        let mut b = block(&[(Opcode::Swap, 2), (Opcode::Swap, 2)]);
        let mut ix = 0;
        swaptimize(&mut b, &mut ix);
        assert_eq!(ix, 1);
        assert_eq!(ops(&b), vec![(Opcode::Nop, 0), (Opcode::Nop, 0)]);
    }

    #[test]
    fn test_rotation_uses_minimal_swaps() {
        // Net effect is a single exchange of the top and third items.
        let mut b = block(&[(Opcode::Swap, 2), (Opcode::Swap, 2), (Opcode::Swap, 3)]);
        let mut ix = 0;
        swaptimize(&mut b, &mut ix);
        assert_eq!(
            ops(&b),
            vec![(Opcode::Nop, 0), (Opcode::Nop, 0), (Opcode::Swap, 3)]
        );
    }

    #[test]
    fn test_single_swap_untouched() {
        let mut b = block(&[(Opcode::Swap, 3), (Opcode::PopTop, 0)]);
        let mut ix = 0;
        swaptimize(&mut b, &mut ix);
        assert_eq!(ix, 0);
        assert_eq!(ops(&b)[0], (Opcode::Swap, 3));
    }

    #[test]
    fn test_static_swap_reorders_stores() {
        let mut b = block(&[
            (Opcode::Swap, 2),
            (Opcode::StoreFast, 0),
            (Opcode::StoreFast, 1),
        ]);
        apply_static_swaps(&mut b, 0);
        assert_eq!(
            ops(&b),
            vec![(Opcode::Nop, 0), (Opcode::StoreFast, 1), (Opcode::StoreFast, 0)]
        );
    }

    #[test]
    fn test_static_swap_refuses_same_slot() {
        let mut b = block(&[
            (Opcode::Swap, 2),
            (Opcode::StoreFast, 0),
            (Opcode::StoreFast, 0),
        ]);
        apply_static_swaps(&mut b, 0);
        assert_eq!(ops(&b)[0], (Opcode::Swap, 2));
    }
}
