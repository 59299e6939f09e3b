// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Frame blocks: the static nesting of loops and protected regions.
//!
//! `return`, `break` and `continue` may leave several protected regions at
//! once. Each region pushes a [`FrameBlock`] while its body is lowered; an
//! early exit walks the stack from the top and replays whatever cleanup each
//! region would have run on its normal path (popping the iterator of a `for`,
//! calling `__exit__`, re-emitting a `finally` body, ...).

use tracing::trace;

use crate::ast::{Location, Stmt};
use crate::compiler::cfg::Label;
use crate::compiler::opcode::{Opcode, PseudoOp};
use crate::constant::Constant;
use crate::error::{CompileError, Result};

use super::{Compiler, ExprContext, MAX_FRAME_BLOCKS};

/// What a frame block protects.
#[derive(Debug, Clone, Copy)]
pub(super) enum FrameBlockKind<'a> {
    WhileLoop,
    /// The iterator sits on the stack for the whole loop
    ForLoop,
    TryExcept,
    /// Carries the `finally` body so it can be replayed on early exit
    FinallyTry(&'a [Stmt]),
    /// Inside the exceptional copy of a `finally` body
    FinallyEnd,
    With(Location),
    AsyncWith(Location),
    /// Body of an `except` clause, with the bound name if any
    HandlerCleanup(Option<&'a str>),
    /// A value that must be popped on early exit
    PopValue,
    ExceptionHandler,
    AsyncComprehensionGenerator,
}

impl FrameBlockKind<'_> {
    fn is_loop(&self) -> bool {
        matches!(self, FrameBlockKind::WhileLoop | FrameBlockKind::ForLoop)
    }
}

/// One entry of the frame-block stack.
#[derive(Debug, Clone, Copy)]
pub(super) struct FrameBlock<'a> {
    pub kind: FrameBlockKind<'a>,
    /// Loop head (`continue` target) or region start
    pub block: Option<Label>,
    /// Loop exit (`break` target) or handler
    pub exit: Option<Label>,
}

impl<'a> Compiler<'a> {
    pub(super) fn push_fblock(
        &mut self,
        kind: FrameBlockKind<'a>,
        block: Option<Label>,
        exit: Option<Label>,
    ) -> Result<()> {
        if self.unit.fblocks.len() >= MAX_FRAME_BLOCKS {
            return Err(CompileError::overflow("too many statically nested blocks"));
        }
        trace!("push frame block {:?} at depth {}", kind, self.unit.fblocks.len());
        self.unit.fblocks.push(FrameBlock { kind, block, exit });
        Ok(())
    }

    pub(super) fn pop_fblock(&mut self) -> Result<FrameBlock<'a>> {
        self.unit
            .fblocks
            .pop()
            .ok_or_else(|| CompileError::internal("frame block stack underflow"))
    }

    /// `__exit__(None, None, None)` for the normal path out of a `with`.
    pub(super) fn call_exit_with_nones(&mut self, loc: Location) -> Result<()> {
        for _ in 0..3 {
            self.emit_const(Constant::None, loc)?;
        }
        self.emit(Opcode::Call, 2, loc)
    }

    /// Emits the cleanup one frame block needs when control leaves it early.
    ///
    /// With `preserve_tos` the value on top of the stack (a return value)
    /// must survive the cleanup. `loc` is cleared when the cleanup ran user
    /// code, so the instruction that finally leaves looks artificial.
    fn unwind_fblock(
        &mut self,
        info: &FrameBlock<'a>,
        loc: &mut Location,
        preserve_tos: bool,
    ) -> Result<()> {
        match info.kind {
            FrameBlockKind::WhileLoop
            | FrameBlockKind::ExceptionHandler
            | FrameBlockKind::AsyncComprehensionGenerator => Ok(()),
            FrameBlockKind::ForLoop => {
                if preserve_tos {
                    self.emit(Opcode::Swap, 2, *loc)?;
                }
                self.emit(Opcode::PopTop, 0, *loc)
            }
            FrameBlockKind::TryExcept => self.emit(PseudoOp::PopBlock, 0, *loc),
            FrameBlockKind::FinallyTry(body) => {
                self.emit(PseudoOp::PopBlock, 0, *loc)?;
                if preserve_tos {
                    self.push_fblock(FrameBlockKind::PopValue, None, None)?;
                }
                self.compile_statements(body)?;
                if preserve_tos {
                    self.pop_fblock()?;
                }
                *loc = Location::NONE;
                Ok(())
            }
            FrameBlockKind::FinallyEnd => {
                if preserve_tos {
                    self.emit(Opcode::Swap, 2, *loc)?;
                }
                self.emit(Opcode::PopTop, 0, *loc)?;
                if preserve_tos {
                    self.emit(Opcode::Swap, 2, *loc)?;
                }
                self.emit(PseudoOp::PopBlock, 0, *loc)?;
                self.emit(Opcode::PopExcept, 0, *loc)
            }
            FrameBlockKind::With(with_loc) | FrameBlockKind::AsyncWith(with_loc) => {
                *loc = with_loc;
                self.emit(PseudoOp::PopBlock, 0, *loc)?;
                if preserve_tos {
                    self.emit(Opcode::Swap, 2, *loc)?;
                }
                self.call_exit_with_nones(*loc)?;
                if matches!(info.kind, FrameBlockKind::AsyncWith(_)) {
                    self.emit(Opcode::GetAwaitable, 2, *loc)?;
                    self.emit_const(Constant::None, *loc)?;
                    self.add_yield_from(*loc, true)?;
                }
                self.emit(Opcode::PopTop, 0, *loc)?;
                *loc = Location::NONE;
                Ok(())
            }
            FrameBlockKind::HandlerCleanup(name) => {
                if name.is_some() {
                    self.emit(PseudoOp::PopBlock, 0, *loc)?;
                }
                if preserve_tos {
                    self.emit(Opcode::Swap, 2, *loc)?;
                }
                self.emit(PseudoOp::PopBlock, 0, *loc)?;
                self.emit(Opcode::PopExcept, 0, *loc)?;
                if let Some(name) = name {
                    self.emit_const(Constant::None, *loc)?;
                    self.compile_name(name, ExprContext::Store, *loc)?;
                    self.compile_name(name, ExprContext::Delete, *loc)?;
                }
                Ok(())
            }
            FrameBlockKind::PopValue => {
                if preserve_tos {
                    self.emit(Opcode::Swap, 2, *loc)?;
                }
                self.emit(Opcode::PopTop, 0, *loc)
            }
        }
    }

    /// Unwinds frame blocks from the top of the stack.
    ///
    /// With `find_loop` the walk stops at the innermost loop and returns it,
    /// leaving the loop's own cleanup to the caller. The stack is restored
    /// before returning, so code after the early exit still sees it.
    pub(super) fn unwind_fblock_stack(
        &mut self,
        loc: &mut Location,
        preserve_tos: bool,
        find_loop: bool,
    ) -> Result<Option<FrameBlock<'a>>> {
        let Some(top) = self.unit.fblocks.last().copied() else {
            return Ok(None);
        };
        if find_loop && top.kind.is_loop() {
            return Ok(Some(top));
        }
        self.unit.fblocks.pop();
        let result = self
            .unwind_fblock(&top, loc, preserve_tos)
            .and_then(|()| self.unwind_fblock_stack(loc, preserve_tos, find_loop));
        self.unit.fblocks.push(top);
        result
    }

    pub(super) fn compile_break(&mut self, loc: Location) -> Result<()> {
        let origin = loc;
        let mut loc = loc;
        self.emit(Opcode::Nop, 0, loc)?;
        let Some(lp) = self.unwind_fblock_stack(&mut loc, false, true)? else {
            return Err(self.error("'break' outside loop", origin));
        };
        self.unwind_fblock(&lp, &mut loc, false)?;
        let exit = lp
            .exit
            .ok_or_else(|| CompileError::internal("loop without an exit label"))?;
        self.emit_jump(PseudoOp::Jump, exit, loc)
    }

    pub(super) fn compile_continue(&mut self, loc: Location) -> Result<()> {
        let origin = loc;
        let mut loc = loc;
        self.emit(Opcode::Nop, 0, loc)?;
        let Some(lp) = self.unwind_fblock_stack(&mut loc, false, true)? else {
            return Err(self.error("'continue' not properly in loop", origin));
        };
        let head = lp
            .block
            .ok_or_else(|| CompileError::internal("loop without a head label"))?;
        self.emit_jump(PseudoOp::Jump, head, loc)
    }
}
