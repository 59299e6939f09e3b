// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Maximum operand-stack depth.

use crate::compiler::cfg::{BlockId, Cfg};
use crate::compiler::code::CodeFlags;
use crate::error::{CompileError, Result};

/// Hard ceiling on the operand stack of one frame.
pub const MAX_STACK_DEPTH: i32 = 1 << 20;

fn push(
    cfg: &mut Cfg,
    stack: &mut Vec<BlockId>,
    target: BlockId,
    depth: i32,
) -> Result<()> {
    if depth < 0 {
        return Err(CompileError::internal(format!(
            "stack underflow entering block {}",
            target.0
        )));
    }
    let block = cfg.block_mut(target);
    match block.start_depth {
        Some(known) if known != depth => Err(CompileError::internal(format!(
            "inconsistent stack depth at block {}: {known} vs {depth}",
            target.0
        ))),
        Some(_) => Ok(()),
        None => {
            block.start_depth = Some(depth);
            stack.push(target);
            Ok(())
        }
    }
}

/// Computes the deepest operand stack any path through the graph reaches.
///
/// Every block's entry depth is recorded in `start_depth`; handler blocks
/// receive the depth of the edge from their push. Suspend-capable scopes
/// start with the sent value already on the stack.
pub(crate) fn stackdepth(cfg: &mut Cfg, flags: CodeFlags) -> Result<u32> {
    for block in &mut cfg.blocks {
        block.start_depth = None;
    }
    let suspends =
        flags.intersects(CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR);
    let seed = i32::from(suspends);
    let mut max_depth = seed;
    let mut stack = Vec::new();
    let entry = cfg.entry;
    push(cfg, &mut stack, entry, seed)?;

    while let Some(id) = stack.pop() {
        let mut depth = cfg.block(id).start_depth.unwrap_or(0);
        let mut falls_through = true;
        for i in 0..cfg.block(id).instrs.len() {
            let instr = &cfg.block(id).instrs[i];
            let (op, arg, target) = (instr.op, instr.arg, instr.target);
            let new_depth = depth + op.stack_effect(arg, false)?;
            if new_depth < 0 {
                return Err(CompileError::internal(format!(
                    "stack underflow at {op} in block {}",
                    id.0
                )));
            }
            max_depth = max_depth.max(new_depth);
            if let Some(target) = target {
                let target_depth = depth + op.stack_effect(arg, true)?;
                max_depth = max_depth.max(target_depth);
                push(cfg, &mut stack, target, target_depth)?;
            }
            if max_depth > MAX_STACK_DEPTH {
                return Err(CompileError::overflow("stack depth exceeds the frame limit"));
            }
            depth = new_depth;
            if op.is_unconditional_jump() || op.is_scope_exit() {
                falls_through = false;
                break;
            }
        }
        if falls_through {
            if let Some(next) = cfg.block(id).next {
                push(cfg, &mut stack, next, depth)?;
            }
        }
    }
    // `max_depth` is non-negative: it starts at the seed and only grows.
    Ok(max_depth as u32)
}
