// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Statement lowering.

use crate::ast::{
    Alias, ExceptHandler, Expr, ExprKind, Location, Operator, Stmt, StmtKind, WithItem,
};
use crate::compiler::cfg::Label;
use crate::compiler::opcode::{Intrinsic1, Opcode, PseudoOp};
use crate::constant::Constant;
use crate::error::{CompileError, Result};
use crate::symtable::mangle;

use super::fblock::FrameBlockKind;
use super::{Compiler, ExprContext, UnitKind};

impl<'a> Compiler<'a> {
    pub(super) fn compile_statement(&mut self, stmt: &'a Stmt) -> Result<()> {
        let loc = stmt.location;
        match &stmt.kind {
            StmtKind::FunctionDef(def) => self.compile_function_def(def, loc),
            StmtKind::ClassDef(class) => self.compile_class_def(class, loc),
            StmtKind::Return(value) => self.compile_return(value.as_ref(), loc),
            StmtKind::Delete(targets) => targets
                .iter()
                .try_for_each(|target| self.compile_target(target, ExprContext::Delete)),
            StmtKind::Assign { targets, value } => {
                self.compile_expression(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.emit(Opcode::Copy, 1, loc)?;
                    }
                    self.compile_target(target, ExprContext::Store)?;
                }
                Ok(())
            }
            StmtKind::AugAssign { target, op, value } => {
                self.compile_aug_assign(target, *op, value, loc)
            }
            StmtKind::AnnAssign {
                target,
                annotation,
                value,
                simple,
            } => self.compile_ann_assign(target, annotation, value.as_ref(), *simple, loc),
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
                is_async: false,
            } => self.compile_for(target, iter, body, orelse, loc),
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
                is_async: true,
            } => self.compile_async_for(target, iter, body, orelse, loc),
            StmtKind::While { test, body, orelse } => self.compile_while(test, body, orelse),
            StmtKind::If { test, body, orelse } => self.compile_if(test, body, orelse),
            StmtKind::With {
                items,
                body,
                is_async: false,
            } => self.compile_with(items, body, loc),
            StmtKind::With {
                items,
                body,
                is_async: true,
            } => {
                if self.unit.kind != UnitKind::AsyncFunction {
                    return Err(self.error("'async with' outside async function", loc));
                }
                self.compile_async_with(items, body, loc)
            }
            StmtKind::Match { subject, cases } => self.compile_match(subject, cases, loc),
            StmtKind::Raise { exc, cause } => {
                let mut n = 0;
                if let Some(exc) = exc {
                    self.compile_expression(exc)?;
                    n += 1;
                    if let Some(cause) = cause {
                        self.compile_expression(cause)?;
                        n += 1;
                    }
                }
                self.emit(Opcode::RaiseVarargs, n, loc)
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                if finalbody.is_empty() {
                    self.compile_try_except(body, handlers, orelse, loc)
                } else {
                    self.compile_try_finally(body, handlers, orelse, finalbody, loc)
                }
            }
            StmtKind::Assert { test, msg } => self.compile_assert(test, msg.as_ref(), loc),
            StmtKind::Import(names) => self.compile_import(names, loc),
            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => self.compile_import_from(module.as_deref(), names, *level, loc),
            StmtKind::Global(_) | StmtKind::Nonlocal(_) => Ok(()),
            StmtKind::Expr(value) => {
                if value.as_constant().is_some() {
                    return self.emit(Opcode::Nop, 0, loc);
                }
                self.compile_expression(value)?;
                self.emit(Opcode::PopTop, 0, Location::NONE)
            }
            StmtKind::Pass => self.emit(Opcode::Nop, 0, loc),
            StmtKind::Break => self.compile_break(loc),
            StmtKind::Continue => self.compile_continue(loc),
        }
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    fn compile_aug_assign(
        &mut self,
        target: &'a Expr,
        op: Operator,
        value: &'a Expr,
        loc: Location,
    ) -> Result<()> {
        let target_loc = target.location;
        match &target.kind {
            ExprKind::Attribute { value: base, attr } => {
                self.compile_expression(base)?;
                self.emit(Opcode::Copy, 1, target_loc)?;
                self.emit_load_attr(attr, false, target_loc)?;
            }
            ExprKind::Subscript { value: base, slice } => {
                self.compile_expression(base)?;
                if is_two_element_slice(slice) {
                    self.compile_slice_bounds(slice)?;
                    for _ in 0..3 {
                        self.emit(Opcode::Copy, 3, target_loc)?;
                    }
                    self.emit(Opcode::BinarySlice, 0, target_loc)?;
                } else {
                    self.compile_expression(slice)?;
                    self.emit(Opcode::Copy, 2, target_loc)?;
                    self.emit(Opcode::Copy, 2, target_loc)?;
                    self.emit(Opcode::BinarySubscr, 0, target_loc)?;
                }
            }
            ExprKind::Name(id) => self.compile_name(id, ExprContext::Load, target_loc)?,
            _ => {
                return Err(CompileError::internal(
                    "invalid target for augmented assignment",
                ));
            }
        }

        self.compile_expression(value)?;
        self.emit(Opcode::BinaryOp, op.oparg(true), loc)?;

        match &target.kind {
            ExprKind::Attribute { attr, .. } => {
                self.emit(Opcode::Swap, 2, target_loc)?;
                self.emit_mangled_name_op(Opcode::StoreAttr, attr, target_loc)
            }
            ExprKind::Subscript { slice, .. } => {
                if is_two_element_slice(slice) {
                    self.emit(Opcode::Swap, 4, target_loc)?;
                    self.emit(Opcode::Swap, 3, target_loc)?;
                    self.emit(Opcode::Swap, 2, target_loc)?;
                    self.emit(Opcode::StoreSlice, 0, target_loc)
                } else {
                    self.emit(Opcode::Swap, 3, target_loc)?;
                    self.emit(Opcode::Swap, 2, target_loc)?;
                    self.emit(Opcode::StoreSubscr, 0, target_loc)
                }
            }
            ExprKind::Name(id) => self.compile_name(id, ExprContext::Store, target_loc),
            _ => Err(CompileError::internal(
                "invalid target for augmented assignment",
            )),
        }
    }

    fn compile_ann_assign(
        &mut self,
        target: &'a Expr,
        annotation: &'a Expr,
        value: Option<&'a Expr>,
        simple: bool,
        loc: Location,
    ) -> Result<()> {
        if let Some(value) = value {
            self.compile_expression(value)?;
            self.compile_target(target, ExprContext::Store)?;
        }
        let stores_annotations = matches!(self.unit.kind, UnitKind::Module | UnitKind::Class);
        match &target.kind {
            ExprKind::Name(id) => {
                if id == "__debug__" {
                    return Err(self.error("cannot assign to __debug__", target.location));
                }
                if simple && stores_annotations && !self.defers_annotations() {
                    self.compile_expression(annotation)?;
                    self.emit_name_op(Opcode::LoadName, "__annotations__", loc)?;
                    let mangled =
                        mangle(self.unit.private.as_deref(), id).into_owned();
                    self.emit_const(Constant::str(&mangled), loc)?;
                    self.emit(Opcode::StoreSubscr, 0, loc)?;
                }
            }
            ExprKind::Attribute { value: base, .. } => {
                if value.is_none() {
                    self.check_annotation_expr(base)?;
                }
            }
            ExprKind::Subscript { value: base, slice } => {
                if value.is_none() {
                    self.check_annotation_expr(base)?;
                    self.check_annotation_subscript(slice)?;
                }
            }
            _ => {
                return Err(CompileError::internal(
                    "invalid target for annotated assignment",
                ));
            }
        }
        if !simple && stores_annotations && !self.defers_annotations() {
            self.check_annotation_expr(annotation)?;
        }
        Ok(())
    }

    /// Evaluates an expression for its side effects only.
    fn check_annotation_expr(&mut self, expr: &'a Expr) -> Result<()> {
        self.compile_expression(expr)?;
        self.emit(Opcode::PopTop, 0, expr.location)
    }

    fn check_annotation_subscript(&mut self, slice: &'a Expr) -> Result<()> {
        match &slice.kind {
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.check_annotation_expr(part)?;
                }
                Ok(())
            }
            ExprKind::Tuple(elts) => elts
                .iter()
                .try_for_each(|elt| self.check_annotation_subscript(elt)),
            _ => self.check_annotation_expr(slice),
        }
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    fn compile_return(&mut self, value: Option<&'a Expr>, loc: Location) -> Result<()> {
        if !self.unit.kind.is_function_like() {
            return Err(self.error("'return' outside function", loc));
        }
        if value.is_some() && self.unit.is_async_generator() {
            return Err(self.error("'return' with value in async generator", loc));
        }
        let constant = value.and_then(|v| v.as_constant());
        let preserve_tos = value.is_some() && constant.is_none();
        let mut loc = loc;
        match value {
            Some(value) if preserve_tos => self.compile_expression(value)?,
            Some(value) => self.emit(Opcode::Nop, 0, value.location)?,
            None => {}
        }
        if value.is_none_or(|v| v.location.line != loc.line) {
            self.emit(Opcode::Nop, 0, loc)?;
        }
        self.unwind_fblock_stack(&mut loc, preserve_tos, false)?;
        match (value, constant) {
            (None, _) => self.emit_const(Constant::None, loc)?,
            (Some(_), Some(constant)) => self.emit_const(constant.clone(), loc)?,
            (Some(_), None) => {}
        }
        self.emit(Opcode::ReturnValue, 0, loc)
    }

    fn compile_if(&mut self, test: &'a Expr, body: &'a [Stmt], orelse: &'a [Stmt]) -> Result<()> {
        let end = self.new_label();
        let next = if orelse.is_empty() {
            end
        } else {
            self.new_label()
        };
        self.compile_jump_if(test, next, false)?;
        self.compile_statements(body)?;
        if !orelse.is_empty() {
            self.emit_jump(PseudoOp::Jump, end, Location::NONE)?;
            self.use_label(next)?;
            self.compile_statements(orelse)?;
        }
        self.use_label(end)
    }

    fn compile_while(&mut self, test: &'a Expr, body: &'a [Stmt], orelse: &'a [Stmt]) -> Result<()> {
        let head = self.new_label();
        let anchor = self.new_label();
        let end = self.new_label();

        self.use_label(head)?;
        self.push_fblock(FrameBlockKind::WhileLoop, Some(head), Some(end))?;
        self.compile_jump_if(test, anchor, false)?;
        self.compile_statements(body)?;
        self.emit_jump(PseudoOp::Jump, head, Location::NONE)?;
        self.pop_fblock()?;

        self.use_label(anchor)?;
        self.compile_statements(orelse)?;
        self.use_label(end)
    }

    fn compile_for(
        &mut self,
        target: &'a Expr,
        iter: &'a Expr,
        body: &'a [Stmt],
        orelse: &'a [Stmt],
        loc: Location,
    ) -> Result<()> {
        let start = self.new_label();
        let cleanup = self.new_label();
        let end = self.new_label();

        self.push_fblock(FrameBlockKind::ForLoop, Some(start), Some(end))?;
        self.compile_expression(iter)?;
        self.emit(Opcode::GetIter, 0, loc)?;

        self.use_label(start)?;
        self.emit_jump(Opcode::ForIter, cleanup, loc)?;
        self.compile_target(target, ExprContext::Store)?;
        self.compile_statements(body)?;
        self.emit_jump(PseudoOp::Jump, start, Location::NONE)?;

        self.use_label(cleanup)?;
        self.pop_fblock()?;
        self.compile_statements(orelse)?;
        self.use_label(end)
    }

    fn compile_async_for(
        &mut self,
        target: &'a Expr,
        iter: &'a Expr,
        body: &'a [Stmt],
        orelse: &'a [Stmt],
        loc: Location,
    ) -> Result<()> {
        if self.unit.kind != UnitKind::AsyncFunction {
            return Err(self.error("'async for' outside async function", loc));
        }
        let start = self.new_label();
        let except = self.new_label();
        let end = self.new_label();

        self.compile_expression(iter)?;
        self.emit(Opcode::GetAiter, 0, loc)?;

        self.use_label(start)?;
        self.push_fblock(FrameBlockKind::ForLoop, Some(start), Some(end))?;
        self.emit_jump(PseudoOp::SetupFinally, except, loc)?;
        self.emit(Opcode::GetAnext, 0, loc)?;
        self.emit_const(Constant::None, loc)?;
        self.add_yield_from(loc, true)?;
        self.emit(PseudoOp::PopBlock, 0, loc)?;

        self.compile_target(target, ExprContext::Store)?;
        self.compile_statements(body)?;
        self.emit_jump(PseudoOp::Jump, start, Location::NONE)?;
        self.pop_fblock()?;

        // END_ASYNC_FOR belongs to the loop header, not the body.
        self.use_label(except)?;
        self.emit(Opcode::EndAsyncFor, 0, iter.location)?;
        self.compile_statements(orelse)?;
        self.use_label(end)
    }

    // ========================================================================
    // Exception handling
    // ========================================================================

    /// `COPY 3; POP_EXCEPT; RERAISE 1`: restores the previous exception and
    /// re-raises the current one.
    pub(super) fn pop_except_and_reraise(&mut self, loc: Location) -> Result<()> {
        self.emit(Opcode::Copy, 3, loc)?;
        self.emit(Opcode::PopExcept, 0, loc)?;
        self.emit(Opcode::Reraise, 1, loc)
    }

    fn compile_try_finally(
        &mut self,
        body: &'a [Stmt],
        handlers: &'a [ExceptHandler],
        orelse: &'a [Stmt],
        finalbody: &'a [Stmt],
        loc: Location,
    ) -> Result<()> {
        let start = self.new_label();
        let end = self.new_label();
        let exit = self.new_label();
        let cleanup = self.new_label();

        self.emit_jump(PseudoOp::SetupFinally, end, loc)?;
        self.use_label(start)?;
        self.push_fblock(FrameBlockKind::FinallyTry(finalbody), Some(start), Some(end))?;
        if handlers.is_empty() {
            self.compile_statements(body)?;
        } else {
            self.compile_try_except(body, handlers, orelse, loc)?;
        }
        self.emit(PseudoOp::PopBlock, 0, Location::NONE)?;
        self.pop_fblock()?;
        self.compile_statements(finalbody)?;
        self.emit_jump(PseudoOp::Jump, exit, Location::NONE)?;

        // Exceptional path: a second copy of the final body.
        self.use_label(end)?;
        self.emit_jump(PseudoOp::SetupCleanup, cleanup, Location::NONE)?;
        self.emit(Opcode::PushExcInfo, 0, Location::NONE)?;
        self.push_fblock(FrameBlockKind::FinallyEnd, Some(end), None)?;
        self.compile_statements(finalbody)?;
        self.pop_fblock()?;
        self.emit(Opcode::Reraise, 0, Location::NONE)?;

        self.use_label(cleanup)?;
        self.pop_except_and_reraise(Location::NONE)?;
        self.use_label(exit)
    }

    fn compile_try_except(
        &mut self,
        body: &'a [Stmt],
        handlers: &'a [ExceptHandler],
        orelse: &'a [Stmt],
        loc: Location,
    ) -> Result<()> {
        let start = self.new_label();
        let mut except = self.new_label();
        let end = self.new_label();
        let cleanup = self.new_label();

        self.emit_jump(PseudoOp::SetupFinally, except, loc)?;
        self.use_label(start)?;
        self.push_fblock(FrameBlockKind::TryExcept, Some(start), None)?;
        self.compile_statements(body)?;
        self.pop_fblock()?;
        self.emit(PseudoOp::PopBlock, 0, Location::NONE)?;
        self.compile_statements(orelse)?;
        self.emit_jump(PseudoOp::Jump, end, Location::NONE)?;

        self.use_label(except)?;
        self.emit_jump(PseudoOp::SetupCleanup, cleanup, Location::NONE)?;
        self.emit(Opcode::PushExcInfo, 0, Location::NONE)?;
        self.push_fblock(FrameBlockKind::ExceptionHandler, None, None)?;

        for (i, handler) in handlers.iter().enumerate() {
            let hloc = handler.location;
            if handler.typ.is_none() && i + 1 < handlers.len() {
                return Err(self.error("default 'except:' must be last", hloc));
            }
            except = self.new_label();
            if let Some(typ) = &handler.typ {
                self.compile_expression(typ)?;
                self.emit(Opcode::CheckExcMatch, 0, hloc)?;
                self.emit_jump(PseudoOp::PopJumpIfFalse, except, hloc)?;
            }
            match &handler.name {
                Some(name) => self.compile_named_handler(name, &handler.body, end, hloc)?,
                None => {
                    let cleanup_body = self.new_label();
                    self.emit(Opcode::PopTop, 0, hloc)?;
                    self.use_label(cleanup_body)?;
                    self.push_fblock(FrameBlockKind::HandlerCleanup(None), Some(cleanup_body), None)?;
                    self.compile_statements(&handler.body)?;
                    self.pop_fblock()?;
                    self.emit(PseudoOp::PopBlock, 0, Location::NONE)?;
                    self.emit(Opcode::PopExcept, 0, Location::NONE)?;
                    self.emit_jump(PseudoOp::Jump, end, Location::NONE)?;
                }
            }
            self.use_label(except)?;
        }

        self.pop_fblock()?;
        self.emit(Opcode::Reraise, 0, Location::NONE)?;

        self.use_label(cleanup)?;
        self.pop_except_and_reraise(Location::NONE)?;
        self.use_label(end)
    }

    /// `except T as name:`. The body runs under an inner cleanup that
    /// unbinds `name` however the handler is left.
    fn compile_named_handler(
        &mut self,
        name: &'a str,
        body: &'a [Stmt],
        end: Label,
        loc: Location,
    ) -> Result<()> {
        let cleanup_end = self.new_label();
        let cleanup_body = self.new_label();

        self.compile_name(name, ExprContext::Store, loc)?;
        self.emit_jump(PseudoOp::SetupCleanup, cleanup_end, loc)?;
        self.use_label(cleanup_body)?;
        self.push_fblock(
            FrameBlockKind::HandlerCleanup(Some(name)),
            Some(cleanup_body),
            None,
        )?;
        self.compile_statements(body)?;
        self.pop_fblock()?;
        self.emit(PseudoOp::PopBlock, 0, Location::NONE)?;
        self.emit(PseudoOp::PopBlock, 0, Location::NONE)?;
        self.emit(Opcode::PopExcept, 0, Location::NONE)?;
        self.unbind(name)?;
        self.emit_jump(PseudoOp::Jump, end, Location::NONE)?;

        self.use_label(cleanup_end)?;
        self.unbind(name)?;
        self.emit(Opcode::Reraise, 1, Location::NONE)
    }

    /// `name = None; del name`
    fn unbind(&mut self, name: &str) -> Result<()> {
        self.emit_const(Constant::None, Location::NONE)?;
        self.compile_name(name, ExprContext::Store, Location::NONE)?;
        self.compile_name(name, ExprContext::Delete, Location::NONE)
    }

    // ========================================================================
    // Context managers
    // ========================================================================

    fn compile_with(&mut self, items: &'a [WithItem], body: &'a [Stmt], loc: Location) -> Result<()> {
        let Some((item, rest)) = items.split_first() else {
            return Err(CompileError::internal("'with' without items"));
        };
        let block = self.new_label();
        let final_ = self.new_label();
        let exit = self.new_label();
        let cleanup = self.new_label();

        self.compile_expression(&item.context_expr)?;
        let item_loc = item.context_expr.location;
        self.emit(Opcode::BeforeWith, 0, item_loc)?;
        self.emit_jump(PseudoOp::SetupWith, final_, item_loc)?;

        self.use_label(block)?;
        self.push_fblock(FrameBlockKind::With(item_loc), Some(block), Some(final_))?;
        match &item.optional_vars {
            Some(vars) => self.compile_target(vars, ExprContext::Store)?,
            None => self.emit(Opcode::PopTop, 0, item_loc)?,
        }
        if rest.is_empty() {
            self.compile_statements(body)?;
        } else {
            self.compile_with(rest, body, loc)?;
        }
        self.emit(PseudoOp::PopBlock, 0, Location::NONE)?;
        self.pop_fblock()?;

        // Normal exit: __exit__(None, None, None)
        self.call_exit_with_nones(loc)?;
        self.emit(Opcode::PopTop, 0, loc)?;
        self.emit_jump(PseudoOp::Jump, exit, loc)?;

        self.use_label(final_)?;
        self.emit_jump(PseudoOp::SetupCleanup, cleanup, loc)?;
        self.emit(Opcode::PushExcInfo, 0, loc)?;
        self.emit(Opcode::WithExceptStart, 0, loc)?;
        self.with_except_finish(cleanup)?;

        self.use_label(exit)
    }

    fn compile_async_with(
        &mut self,
        items: &'a [WithItem],
        body: &'a [Stmt],
        loc: Location,
    ) -> Result<()> {
        let Some((item, rest)) = items.split_first() else {
            return Err(CompileError::internal("'async with' without items"));
        };
        let block = self.new_label();
        let final_ = self.new_label();
        let exit = self.new_label();
        let cleanup = self.new_label();

        self.compile_expression(&item.context_expr)?;
        self.emit(Opcode::BeforeAsyncWith, 0, loc)?;
        self.emit(Opcode::GetAwaitable, 1, loc)?;
        self.emit_const(Constant::None, loc)?;
        self.add_yield_from(loc, true)?;
        self.emit_jump(PseudoOp::SetupWith, final_, loc)?;

        self.use_label(block)?;
        self.push_fblock(FrameBlockKind::AsyncWith(loc), Some(block), Some(final_))?;
        match &item.optional_vars {
            Some(vars) => self.compile_target(vars, ExprContext::Store)?,
            None => self.emit(Opcode::PopTop, 0, loc)?,
        }
        if rest.is_empty() {
            self.compile_statements(body)?;
        } else {
            self.compile_async_with(rest, body, loc)?;
        }
        self.pop_fblock()?;
        self.emit(PseudoOp::PopBlock, 0, loc)?;

        self.call_exit_with_nones(loc)?;
        self.emit(Opcode::GetAwaitable, 2, loc)?;
        self.emit_const(Constant::None, loc)?;
        self.add_yield_from(loc, true)?;
        self.emit(Opcode::PopTop, 0, loc)?;
        self.emit_jump(PseudoOp::Jump, exit, loc)?;

        self.use_label(final_)?;
        self.emit_jump(PseudoOp::SetupCleanup, cleanup, loc)?;
        self.emit(Opcode::PushExcInfo, 0, loc)?;
        self.emit(Opcode::WithExceptStart, 0, loc)?;
        self.emit(Opcode::GetAwaitable, 2, loc)?;
        self.emit_const(Constant::None, loc)?;
        self.add_yield_from(loc, true)?;
        self.with_except_finish(cleanup)?;

        self.use_label(exit)
    }

    /// Tail of the exceptional path out of a `with`: re-raise unless
    /// `__exit__` returned a true value.
    fn with_except_finish(&mut self, cleanup: Label) -> Result<()> {
        let suppress = self.new_label();
        let exit = self.new_label();
        self.emit_jump(PseudoOp::PopJumpIfTrue, suppress, Location::NONE)?;
        self.emit(Opcode::Reraise, 2, Location::NONE)?;

        self.use_label(suppress)?;
        self.emit(Opcode::PopTop, 0, Location::NONE)?;
        self.emit(PseudoOp::PopBlock, 0, Location::NONE)?;
        self.emit(Opcode::PopExcept, 0, Location::NONE)?;
        self.emit(Opcode::PopTop, 0, Location::NONE)?;
        self.emit(Opcode::PopTop, 0, Location::NONE)?;
        self.emit_jump(PseudoOp::Jump, exit, Location::NONE)?;

        self.use_label(cleanup)?;
        self.pop_except_and_reraise(Location::NONE)?;
        self.use_label(exit)
    }

    // ========================================================================
    // Simple statements
    // ========================================================================

    fn compile_assert(&mut self, test: &'a Expr, msg: Option<&'a Expr>, loc: Location) -> Result<()> {
        let always_true = match &test.kind {
            ExprKind::Tuple(elts) => !elts.is_empty(),
            ExprKind::Constant(Constant::Tuple(items)) => !items.is_empty(),
            _ => false,
        };
        if always_true {
            self.warn("assertion is always true, perhaps remove parentheses?", loc)?;
        }
        if self.options.optimize.strips_asserts() {
            return Ok(());
        }
        let end = self.new_label();
        self.compile_jump_if(test, end, true)?;
        self.emit(Opcode::LoadAssertionError, 0, loc)?;
        if let Some(msg) = msg {
            self.compile_expression(msg)?;
            self.emit(Opcode::Call, 0, loc)?;
        }
        self.emit(Opcode::RaiseVarargs, 1, loc)?;
        self.use_label(end)
    }

    fn compile_import(&mut self, names: &'a [Alias], loc: Location) -> Result<()> {
        for alias in names {
            self.emit_const(Constant::from(0), loc)?;
            self.emit_const(Constant::None, loc)?;
            self.emit_mangled_name_op(Opcode::ImportName, &alias.name, loc)?;
            match &alias.asname {
                Some(asname) => self.compile_import_as(&alias.name, asname, loc)?,
                None => {
                    let top = alias.name.split('.').next().unwrap_or(&alias.name);
                    self.compile_name(top, ExprContext::Store, loc)?;
                }
            }
        }
        Ok(())
    }

    /// Binds `import a.b.c as d`: walks the submodules with `IMPORT_FROM`.
    fn compile_import_as(&mut self, name: &str, asname: &str, loc: Location) -> Result<()> {
        let mut parts = name.split('.').skip(1).peekable();
        if parts.peek().is_none() {
            return self.compile_name(asname, ExprContext::Store, loc);
        }
        while let Some(attr) = parts.next() {
            self.emit_mangled_name_op(Opcode::ImportFrom, attr, loc)?;
            if parts.peek().is_some() {
                self.emit(Opcode::Swap, 2, loc)?;
                self.emit(Opcode::PopTop, 0, loc)?;
            }
        }
        self.compile_name(asname, ExprContext::Store, loc)?;
        self.emit(Opcode::PopTop, 0, loc)
    }

    fn compile_import_from(
        &mut self,
        module: Option<&str>,
        names: &'a [Alias],
        level: u32,
        loc: Location,
    ) -> Result<()> {
        self.emit_const(Constant::from(i64::from(level)), loc)?;
        let fromlist = names.iter().map(|a| Constant::str(&a.name)).collect();
        self.emit_const(Constant::tuple(fromlist), loc)?;
        self.emit_mangled_name_op(Opcode::ImportName, module.unwrap_or(""), loc)?;
        for (i, alias) in names.iter().enumerate() {
            if i == 0 && alias.name.starts_with('*') {
                self.emit(
                    Opcode::CallIntrinsic1,
                    Intrinsic1::ImportStar as u32,
                    loc,
                )?;
                return self.emit(Opcode::PopTop, 0, Location::NONE);
            }
            self.emit_mangled_name_op(Opcode::ImportFrom, &alias.name, loc)?;
            let store_name = alias.asname.as_deref().unwrap_or(&alias.name);
            self.compile_name(store_name, ExprContext::Store, loc)?;
        }
        self.emit(Opcode::PopTop, 0, loc)
    }
}

/// `a[lo:hi]` without a step, which has dedicated slice opcodes.
pub(super) fn is_two_element_slice(expr: &Expr) -> bool {
    matches!(&expr.kind, ExprKind::Slice { step: None, .. })
}
