// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Exception-handler labelling.
//!
//! Walks the graph with a simulated handler stack and records, on every
//! instruction, the innermost handler that is active when it executes.

use crate::compiler::cfg::{BlockId, Cfg};
use crate::compiler::opcode::{AnyOp, Opcode, PseudoOp};
use crate::error::{CompileError, Result};

/// Flags every block that is the target of a handler push.
pub(crate) fn mark_except_handlers(cfg: &mut Cfg) {
    let mut handlers = Vec::new();
    for id in cfg.order() {
        for instr in &cfg.block(id).instrs {
            if instr.op.is_block_push() {
                if let Some(target) = instr.target {
                    handlers.push(target);
                }
            }
        }
    }
    for block in &mut cfg.blocks {
        block.is_handler = false;
    }
    for target in handlers {
        cfg.block_mut(target).is_handler = true;
    }
}

/// The compile-time mirror of the runtime handler stack.
#[derive(Debug, Clone, Default)]
struct ExceptStack {
    handlers: Vec<BlockId>,
}

impl ExceptStack {
    fn top(&self) -> Option<BlockId> {
        self.handlers.last().copied()
    }

    fn depth(&self) -> usize {
        self.handlers.len()
    }
}

/// Assigns the active handler to every instruction.
///
/// Handler pushes record the enclosing handler, `POP_BLOCK` records the
/// handler that is active after the pop, and `YIELD_VALUE` receives the
/// handler-stack depth as its operand.
pub(crate) fn label_exception_targets(cfg: &mut Cfg) -> Result<()> {
    for block in &mut cfg.blocks {
        block.visited = false;
        block.preserve_lasti = false;
    }
    let mut pending: Vec<Option<ExceptStack>> = vec![None; cfg.blocks.len()];
    let entry = cfg.entry;
    pending[entry.index()] = Some(ExceptStack::default());
    cfg.block_mut(entry).visited = true;
    let mut todo = vec![entry];

    while let Some(id) = todo.pop() {
        let mut stack = pending[id.index()].take().ok_or_else(|| {
            CompileError::internal(format!("block {} queued without a handler stack", id.0))
        })?;
        let mut handler = stack.top();
        let count = cfg.block(id).instrs.len();

        for i in 0..count {
            let instr = &cfg.block(id).instrs[i];
            let op = instr.op;
            let target = instr.target;

            if op.is_block_push() {
                let target = target.ok_or_else(|| {
                    CompileError::internal(format!("{op} without a handler block"))
                })?;
                if !cfg.block(target).visited {
                    cfg.block_mut(target).visited = true;
                    pending[target.index()] = Some(stack.clone());
                    todo.push(target);
                }
                cfg.blocks[id.index()].instrs[i].handler = handler;
                if matches!(
                    op,
                    AnyOp::Pseudo(PseudoOp::SetupCleanup | PseudoOp::SetupWith)
                ) {
                    cfg.block_mut(target).preserve_lasti = true;
                }
                stack.handlers.push(target);
                handler = Some(target);
            } else if op.is_pseudo(PseudoOp::PopBlock) {
                if stack.handlers.pop().is_none() {
                    return Err(CompileError::internal("POP_BLOCK with no active handler"));
                }
                handler = stack.top();
                cfg.blocks[id.index()].instrs[i].handler = handler;
            } else if op.is_jump() {
                cfg.blocks[id.index()].instrs[i].handler = handler;
                let target = target
                    .ok_or_else(|| CompileError::internal(format!("{op} without a target")))?;
                if !cfg.block(target).visited {
                    cfg.block_mut(target).visited = true;
                    pending[target.index()] = Some(stack.clone());
                    todo.push(target);
                }
            } else if op.is(Opcode::YieldValue) {
                let instr = &mut cfg.blocks[id.index()].instrs[i];
                instr.handler = handler;
                instr.arg = stack.depth() as u32;
            } else {
                cfg.blocks[id.index()].instrs[i].handler = handler;
            }
        }

        let block = cfg.block(id);
        if block.has_fallthrough() {
            if let Some(next) = block.next {
                if !cfg.block(next).visited {
                    cfg.block_mut(next).visited = true;
                    pending[next.index()] = Some(stack);
                    todo.push(next);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Location;

    fn loc() -> Location {
        Location::line_only(1)
    }

    #[test]
    fn test_handlers_follow_push_and_pop() {
        let mut cfg = Cfg::new();
        let handler = cfg.new_label();
        cfg.add_jump(PseudoOp::SetupFinally, handler, loc()).unwrap();
        cfg.addop(Opcode::LoadName, 0, loc()).unwrap();
        cfg.addop(PseudoOp::PopBlock, 0, loc()).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc()).unwrap();
        cfg.use_label(handler).unwrap();
        cfg.addop(Opcode::PushExcInfo, 0, loc()).unwrap();
        cfg.addop(Opcode::Reraise, 0, loc()).unwrap();
        cfg.translate_labels().unwrap();

        mark_except_handlers(&mut cfg);
        label_exception_targets(&mut cfg).unwrap();

        let order = cfg.order();
        let body = cfg.block(order[0]);
        let handler_block = order[1];
        assert!(cfg.block(handler_block).is_handler);
        assert!(!cfg.block(handler_block).preserve_lasti);
        assert_eq!(body.instrs[0].handler, None);
        assert_eq!(body.instrs[1].handler, Some(handler_block));
        assert_eq!(body.instrs[2].handler, None);
        assert_eq!(body.instrs[3].handler, None);
    }

    #[test]
    fn test_cleanup_preserves_lasti_and_yield_depth() {
        let mut cfg = Cfg::new();
        let cleanup = cfg.new_label();
        cfg.add_jump(PseudoOp::SetupCleanup, cleanup, loc()).unwrap();
        cfg.addop(Opcode::LoadConst, 0, loc()).unwrap();
        cfg.addop(Opcode::YieldValue, 0, loc()).unwrap();
        cfg.addop(PseudoOp::PopBlock, 0, loc()).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc()).unwrap();
        cfg.use_label(cleanup).unwrap();
        cfg.addop(Opcode::Reraise, 1, loc()).unwrap();
        cfg.translate_labels().unwrap();

        mark_except_handlers(&mut cfg);
        label_exception_targets(&mut cfg).unwrap();

        let order = cfg.order();
        assert!(cfg.block(order[1]).preserve_lasti);
        assert_eq!(cfg.block(order[0]).instrs[2].arg, 1);
    }

    #[test]
    fn test_unbalanced_pop_block_is_internal_error() {
        let mut cfg = Cfg::new();
        cfg.addop(PseudoOp::PopBlock, 0, loc()).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc()).unwrap();
        cfg.translate_labels().unwrap();
        assert!(matches!(
            label_exception_targets(&mut cfg),
            Err(CompileError::Internal(_))
        ));
    }
}
