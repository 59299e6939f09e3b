// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Expression lowering.
//!
//! Covers plain values, assignment targets, conditional jumps, calls and
//! literal displays. Operand-heavy displays and calls switch to incremental
//! building above [`STACK_USE_GUIDELINE`] operands so stack use stays
//! bounded.

use rustc_hash::FxHashSet;

use crate::ast::{
    BoolOperator, CmpOperator, Conversion, Expr, ExprKind, Keyword, Location, UnaryOperator,
};
use crate::compiler::cfg::Label;
use crate::compiler::opcode::{
    ComparisonOperator, FORMAT_WITH_SPEC, Intrinsic1, Opcode, PseudoOp,
};
use crate::constant::Constant;
use crate::error::{CompileError, Result};
use crate::symtable::mangle;

use super::functions::ComprehensionKind;
use super::statements::is_two_element_slice;
use super::{Compiler, ExprContext, STACK_USE_GUIDELINE, UnitKind};

/// Opcodes used to build one kind of display incrementally.
#[derive(Clone, Copy)]
struct Builder {
    build: Opcode,
    add: Opcode,
    extend: Opcode,
    tuple: bool,
}

const LIST_BUILDER: Builder = Builder {
    build: Opcode::BuildList,
    add: Opcode::ListAppend,
    extend: Opcode::ListExtend,
    tuple: false,
};

const TUPLE_BUILDER: Builder = Builder {
    tuple: true,
    ..LIST_BUILDER
};

const SET_BUILDER: Builder = Builder {
    build: Opcode::BuildSet,
    add: Opcode::SetAdd,
    extend: Opcode::SetUpdate,
    tuple: false,
};

impl<'a> Compiler<'a> {
    /// Evaluates `expr` and leaves its value on the stack.
    pub(super) fn compile_expression(&mut self, expr: &'a Expr) -> Result<()> {
        self.visit_expr(expr, ExprContext::Load)
    }

    /// Stores the value on top of the stack into `target`, or deletes it.
    pub(super) fn compile_target(&mut self, target: &'a Expr, ctx: ExprContext) -> Result<()> {
        self.visit_expr(target, ctx)
    }

    fn visit_expr(&mut self, expr: &'a Expr, ctx: ExprContext) -> Result<()> {
        let loc = expr.location;
        match &expr.kind {
            ExprKind::Name(id) => self.compile_name(id, ctx, loc),
            ExprKind::Attribute { value, attr } => {
                self.compile_expression(value)?;
                let loc = attr_location(loc, expr);
                match ctx {
                    ExprContext::Load => self.emit_load_attr(attr, false, loc),
                    ExprContext::Store => self.emit_mangled_name_op(Opcode::StoreAttr, attr, loc),
                    ExprContext::Delete => {
                        self.emit_mangled_name_op(Opcode::DeleteAttr, attr, loc)
                    }
                }
            }
            ExprKind::Subscript { value, slice } => self.compile_subscript(expr, value, slice, ctx),
            ExprKind::Starred(_) => match ctx {
                ExprContext::Store => Err(self.error(
                    "starred assignment target must be in a list or tuple",
                    loc,
                )),
                _ => Err(self.error("can't use starred expression here", loc)),
            },
            ExprKind::List(elts) | ExprKind::Tuple(elts) => {
                let builder = if matches!(expr.kind, ExprKind::Tuple(_)) {
                    TUPLE_BUILDER
                } else {
                    LIST_BUILDER
                };
                match ctx {
                    ExprContext::Load => self.starunpack_helper(elts, 0, builder, loc),
                    ExprContext::Store => self.assignment_helper(elts, loc),
                    ExprContext::Delete => elts
                        .iter()
                        .try_for_each(|elt| self.compile_target(elt, ExprContext::Delete)),
                }
            }
            _ if ctx != ExprContext::Load => Err(CompileError::internal(format!(
                "expression cannot be used as a {ctx:?} target"
            ))),
            ExprKind::Constant(value) => self.emit_const(value.clone(), loc),
            ExprKind::BoolOp { op, values } => self.compile_bool_op(*op, values, loc),
            ExprKind::NamedExpr { target, value } => {
                self.compile_expression(value)?;
                self.emit(Opcode::Copy, 1, loc)?;
                self.compile_target(target, ExprContext::Store)
            }
            ExprKind::BinOp { left, op, right } => {
                self.compile_expression(left)?;
                self.compile_expression(right)?;
                self.emit(Opcode::BinaryOp, op.oparg(false), loc)
            }
            ExprKind::UnaryOp { op, operand } => {
                self.compile_expression(operand)?;
                let opcode = match op {
                    UnaryOperator::Invert => Opcode::UnaryInvert,
                    UnaryOperator::Not => Opcode::UnaryNot,
                    UnaryOperator::UAdd => Opcode::UnaryPositive,
                    UnaryOperator::USub => Opcode::UnaryNegative,
                };
                self.emit(opcode, 0, loc)
            }
            ExprKind::Lambda { args, body } => self.compile_lambda(expr, args, body),
            ExprKind::IfExp { test, body, orelse } => {
                let end = self.new_label();
                let next = self.new_label();
                self.compile_jump_if(test, next, false)?;
                self.compile_expression(body)?;
                self.emit_jump(PseudoOp::JumpNoInterrupt, end, Location::NONE)?;
                self.use_label(next)?;
                self.compile_expression(orelse)?;
                self.use_label(end)
            }
            ExprKind::Dict { keys, values } => self.compile_dict(keys, values, loc),
            ExprKind::Set(elts) => self.starunpack_helper(elts, 0, SET_BUILDER, loc),
            ExprKind::ListComp { elt, generators } => {
                self.compile_comprehension(expr, ComprehensionKind::List, generators, elt, None)
            }
            ExprKind::SetComp { elt, generators } => {
                self.compile_comprehension(expr, ComprehensionKind::Set, generators, elt, None)
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => self.compile_comprehension(
                expr,
                ComprehensionKind::Dict,
                generators,
                key,
                Some(&**value),
            ),
            ExprKind::GeneratorExp { elt, generators } => self.compile_comprehension(
                expr,
                ComprehensionKind::Generator,
                generators,
                elt,
                None,
            ),
            ExprKind::Await(value) => {
                if !self.unit.kind.is_function_like() {
                    return Err(self.error("'await' outside function", loc));
                }
                if !matches!(
                    self.unit.kind,
                    UnitKind::AsyncFunction | UnitKind::Comprehension
                ) {
                    return Err(self.error("'await' outside async function", loc));
                }
                self.compile_expression(value)?;
                self.emit(Opcode::GetAwaitable, 0, loc)?;
                self.emit_const(Constant::None, loc)?;
                self.add_yield_from(loc, true)
            }
            ExprKind::Yield(value) => {
                if !self.unit.kind.is_function_like() {
                    return Err(self.error("'yield' outside function", loc));
                }
                match value {
                    Some(value) => self.compile_expression(value)?,
                    None => self.emit_const(Constant::None, loc)?,
                }
                self.emit_yield(loc)
            }
            ExprKind::YieldFrom(value) => {
                if !self.unit.kind.is_function_like() {
                    return Err(self.error("'yield' outside function", loc));
                }
                if self.unit.kind == UnitKind::AsyncFunction {
                    return Err(self.error("'yield from' inside async function", loc));
                }
                self.compile_expression(value)?;
                self.emit(Opcode::GetYieldFromIter, 0, loc)?;
                self.emit_const(Constant::None, loc)?;
                self.add_yield_from(loc, false)
            }
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => self.compile_compare(expr, left, ops, comparators),
            ExprKind::Call {
                func,
                args,
                keywords,
            } => self.compile_call(func, args, keywords, loc),
            ExprKind::FormattedValue {
                value,
                conversion,
                format_spec,
            } => {
                self.compile_expression(value)?;
                let mut oparg = match conversion {
                    Conversion::None => 0,
                    Conversion::Str => 1,
                    Conversion::Repr => 2,
                    Conversion::Ascii => 3,
                };
                if let Some(spec) = format_spec {
                    self.compile_expression(spec)?;
                    oparg |= FORMAT_WITH_SPEC as u32;
                }
                self.emit(Opcode::FormatValue, oparg, loc)
            }
            ExprKind::JoinedStr(values) => self.compile_joined_str(values, loc),
            ExprKind::Slice { lower, upper, step } => {
                let mut n = 2;
                self.compile_optional(lower.as_deref(), loc)?;
                self.compile_optional(upper.as_deref(), loc)?;
                if let Some(step) = step {
                    self.compile_expression(step)?;
                    n += 1;
                }
                self.emit(Opcode::BuildSlice, n, loc)
            }
        }
    }

    /// The expression, or `None` when absent.
    fn compile_optional(&mut self, expr: Option<&'a Expr>, loc: Location) -> Result<()> {
        match expr {
            Some(expr) => self.compile_expression(expr),
            None => self.emit_const(Constant::None, loc),
        }
    }

    /// `LOAD_ATTR`; the low operand bit requests a method load.
    pub(super) fn emit_load_attr(&mut self, attr: &str, method: bool, loc: Location) -> Result<()> {
        let mangled = mangle(self.unit.private.as_deref(), attr).into_owned();
        let index = self.unit.name_index(&mangled)?;
        self.emit(Opcode::LoadAttr, (index << 1) | u32::from(method), loc)
    }

    /// `YIELD_VALUE` with its resume point.
    pub(super) fn emit_yield(&mut self, loc: Location) -> Result<()> {
        if self.unit.is_async_generator() {
            self.emit(Opcode::CallIntrinsic1, Intrinsic1::AsyncGenWrap as u32, loc)?;
        }
        self.emit(Opcode::YieldValue, 0, loc)?;
        self.emit(Opcode::Resume, 1, loc)
    }

    /// The delegation loop shared by `await` and `yield from`.
    ///
    /// Expects the sub-iterator and the first value to send on the stack and
    /// leaves the sub-iterator's return value.
    pub(super) fn add_yield_from(&mut self, loc: Location, is_await: bool) -> Result<()> {
        let send = self.new_label();
        let fail = self.new_label();
        let exit = self.new_label();

        self.use_label(send)?;
        self.emit_jump(Opcode::Send, exit, loc)?;
        self.emit_jump(PseudoOp::SetupFinally, fail, loc)?;
        self.emit(Opcode::YieldValue, 0, loc)?;
        self.emit(PseudoOp::PopBlock, 0, Location::NONE)?;
        self.emit(Opcode::Resume, if is_await { 3 } else { 2 }, loc)?;
        self.emit_jump(PseudoOp::JumpNoInterrupt, send, loc)?;

        self.use_label(fail)?;
        self.emit(Opcode::CleanupThrow, 0, loc)?;

        self.use_label(exit)?;
        self.emit(Opcode::EndSend, 0, loc)
    }

    // ========================================================================
    // Targets
    // ========================================================================

    /// Unpacks the value on top of the stack into a tuple or list target.
    fn assignment_helper(&mut self, elts: &'a [Expr], loc: Location) -> Result<()> {
        let n = elts.len();
        let mut seen_star = false;
        for (i, elt) in elts.iter().enumerate() {
            if !elt.is_starred() {
                continue;
            }
            if seen_star {
                return Err(self.error("multiple starred expressions in assignment", elt.location));
            }
            let after = n - i - 1;
            if i >= 1 << 8 || after >= (i32::MAX >> 8) as usize {
                return Err(self.error(
                    "too many expressions in star-unpacking assignment",
                    elt.location,
                ));
            }
            self.emit(Opcode::UnpackEx, (i + (after << 8)) as u32, loc)?;
            seen_star = true;
        }
        if !seen_star {
            let count = u32::try_from(n)
                .map_err(|_| CompileError::overflow("too many targets in assignment"))?;
            self.emit(Opcode::UnpackSequence, count, loc)?;
        }
        for elt in elts {
            let target = match &elt.kind {
                ExprKind::Starred(inner) => inner,
                _ => elt,
            };
            self.compile_target(target, ExprContext::Store)?;
        }
        Ok(())
    }

    fn compile_subscript(
        &mut self,
        expr: &'a Expr,
        value: &'a Expr,
        slice: &'a Expr,
        ctx: ExprContext,
    ) -> Result<()> {
        let loc = expr.location;
        if ctx == ExprContext::Load {
            self.check_subscripter(value, loc)?;
            self.check_index(value, slice, loc)?;
        }
        self.compile_expression(value)?;
        if is_two_element_slice(slice) && ctx != ExprContext::Delete {
            self.compile_slice_bounds(slice)?;
            let op = match ctx {
                ExprContext::Load => Opcode::BinarySlice,
                _ => Opcode::StoreSlice,
            };
            return self.emit(op, 0, loc);
        }
        self.compile_expression(slice)?;
        let op = match ctx {
            ExprContext::Load => Opcode::BinarySubscr,
            ExprContext::Store => Opcode::StoreSubscr,
            ExprContext::Delete => Opcode::DeleteSubscr,
        };
        self.emit(op, 0, loc)
    }

    /// Pushes the two bounds of a step-less slice.
    pub(super) fn compile_slice_bounds(&mut self, slice: &'a Expr) -> Result<()> {
        let ExprKind::Slice { lower, upper, .. } = &slice.kind else {
            return Err(CompileError::internal("slice bounds of a non-slice"));
        };
        self.compile_optional(lower.as_deref(), slice.location)?;
        self.compile_optional(upper.as_deref(), slice.location)
    }

    // ========================================================================
    // Conditions
    // ========================================================================

    /// Jumps to `target` when `expr` is truthy (`cond == true`) or falsy,
    /// without materializing intermediate boolean values.
    pub(super) fn compile_jump_if(&mut self, expr: &'a Expr, target: Label, cond: bool) -> Result<()> {
        let loc = expr.location;
        match &expr.kind {
            ExprKind::UnaryOp {
                op: UnaryOperator::Not,
                operand,
            } => self.compile_jump_if(operand, target, !cond),
            ExprKind::BoolOp { op, values } => {
                let Some((last, rest)) = values.split_last() else {
                    return Err(CompileError::internal("boolean operation without operands"));
                };
                let cond2 = *op == BoolOperator::Or;
                let next2 = if cond2 != cond {
                    self.new_label()
                } else {
                    target
                };
                for value in rest {
                    self.compile_jump_if(value, next2, cond2)?;
                }
                self.compile_jump_if(last, target, cond)?;
                if next2 != target {
                    self.use_label(next2)?;
                }
                Ok(())
            }
            ExprKind::IfExp { test, body, orelse } => {
                let end = self.new_label();
                let next2 = self.new_label();
                self.compile_jump_if(test, next2, false)?;
                self.compile_jump_if(body, target, cond)?;
                self.emit_jump(PseudoOp::JumpNoInterrupt, end, Location::NONE)?;
                self.use_label(next2)?;
                self.compile_jump_if(orelse, target, cond)?;
                self.use_label(end)
            }
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } if ops.len() > 1 => {
                self.check_compare(left, ops, comparators, loc)?;
                let cleanup = self.new_label();
                self.compile_expression(left)?;
                let last = ops.len() - 1;
                for (op, comparator) in ops[..last].iter().zip(comparators) {
                    self.compile_expression(comparator)?;
                    self.emit(Opcode::Swap, 2, loc)?;
                    self.emit(Opcode::Copy, 2, loc)?;
                    self.emit_compare_op(*op, loc)?;
                    self.emit_jump(PseudoOp::PopJumpIfFalse, cleanup, loc)?;
                }
                self.compile_expression(&comparators[last])?;
                self.emit_compare_op(ops[last], loc)?;
                self.emit_jump(pop_jump_if(cond), target, loc)?;
                let end = self.new_label();
                self.emit_jump(PseudoOp::JumpNoInterrupt, end, Location::NONE)?;

                self.use_label(cleanup)?;
                self.emit(Opcode::PopTop, 0, loc)?;
                if !cond {
                    self.emit_jump(PseudoOp::JumpNoInterrupt, target, Location::NONE)?;
                }
                self.use_label(end)
            }
            _ => {
                self.compile_expression(expr)?;
                self.emit_jump(pop_jump_if(cond), target, loc)
            }
        }
    }

    fn compile_bool_op(&mut self, op: BoolOperator, values: &'a [Expr], loc: Location) -> Result<()> {
        let Some((last, rest)) = values.split_last() else {
            return Err(CompileError::internal("boolean operation without operands"));
        };
        let jump = match op {
            BoolOperator::And => Opcode::JumpIfFalseOrPop,
            BoolOperator::Or => Opcode::JumpIfTrueOrPop,
        };
        let end = self.new_label();
        for value in rest {
            self.compile_expression(value)?;
            self.emit_jump(jump, end, loc)?;
        }
        self.compile_expression(last)?;
        self.use_label(end)
    }

    fn emit_compare_op(&mut self, op: CmpOperator, loc: Location) -> Result<()> {
        let (opcode, arg) = match op {
            CmpOperator::Eq => (Opcode::CompareOp, ComparisonOperator::Equal as u32),
            CmpOperator::NotEq => (Opcode::CompareOp, ComparisonOperator::NotEqual as u32),
            CmpOperator::Lt => (Opcode::CompareOp, ComparisonOperator::Less as u32),
            CmpOperator::LtE => (Opcode::CompareOp, ComparisonOperator::LessOrEqual as u32),
            CmpOperator::Gt => (Opcode::CompareOp, ComparisonOperator::Greater as u32),
            CmpOperator::GtE => (Opcode::CompareOp, ComparisonOperator::GreaterOrEqual as u32),
            CmpOperator::Is => (Opcode::IsOp, 0),
            CmpOperator::IsNot => (Opcode::IsOp, 1),
            CmpOperator::In => (Opcode::ContainsOp, 0),
            CmpOperator::NotIn => (Opcode::ContainsOp, 1),
        };
        self.emit(opcode, arg, loc)
    }

    fn compile_compare(
        &mut self,
        expr: &'a Expr,
        left: &'a Expr,
        ops: &[CmpOperator],
        comparators: &'a [Expr],
    ) -> Result<()> {
        let loc = expr.location;
        if ops.is_empty() || ops.len() != comparators.len() {
            return Err(CompileError::internal("malformed comparison"));
        }
        self.check_compare(left, ops, comparators, loc)?;
        self.compile_expression(left)?;
        let last = ops.len() - 1;
        if last == 0 {
            self.compile_expression(&comparators[0])?;
            return self.emit_compare_op(ops[0], loc);
        }
        let cleanup = self.new_label();
        for (op, comparator) in ops[..last].iter().zip(comparators) {
            self.compile_expression(comparator)?;
            self.emit(Opcode::Swap, 2, loc)?;
            self.emit(Opcode::Copy, 2, loc)?;
            self.emit_compare_op(*op, loc)?;
            self.emit_jump(Opcode::JumpIfFalseOrPop, cleanup, loc)?;
        }
        self.compile_expression(&comparators[last])?;
        self.emit_compare_op(ops[last], loc)?;
        let end = self.new_label();
        self.emit_jump(PseudoOp::JumpNoInterrupt, end, Location::NONE)?;

        self.use_label(cleanup)?;
        self.emit(Opcode::Swap, 2, loc)?;
        self.emit(Opcode::PopTop, 0, loc)?;
        self.use_label(end)
    }

    /// Warns about `is` comparisons against literals.
    fn check_compare(
        &mut self,
        left: &Expr,
        ops: &[CmpOperator],
        comparators: &[Expr],
        loc: Location,
    ) -> Result<()> {
        let mut lhs_ok = is_identity_safe(left);
        for (op, right) in ops.iter().zip(comparators) {
            let rhs_ok = is_identity_safe(right);
            if !lhs_ok || !rhs_ok {
                match op {
                    CmpOperator::Is => {
                        self.warn("\"is\" with a literal. Did you mean \"==\"?", loc)?
                    }
                    CmpOperator::IsNot => {
                        self.warn("\"is not\" with a literal. Did you mean \"!=\"?", loc)?
                    }
                    _ => {}
                }
            }
            lhs_ok = rhs_ok;
        }
        Ok(())
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn validate_keywords(&self, keywords: &[Keyword]) -> Result<()> {
        let mut seen = FxHashSet::default();
        for keyword in keywords {
            let Some(name) = keyword.arg.as_deref() else {
                continue;
            };
            if name == "__debug__" {
                return Err(self.error("cannot assign to __debug__", keyword.location));
            }
            if !seen.insert(name) {
                return Err(self.error(
                    format!("keyword argument repeated: {name}"),
                    keyword.location,
                ));
            }
        }
        Ok(())
    }

    fn compile_call(
        &mut self,
        func: &'a Expr,
        args: &'a [Expr],
        keywords: &'a [Keyword],
        loc: Location,
    ) -> Result<()> {
        self.validate_keywords(keywords)?;
        if self.try_method_call(func, args, keywords, loc)? {
            return Ok(());
        }
        self.check_caller(func)?;
        self.emit(Opcode::PushNull, 0, func.location)?;
        self.compile_expression(func)?;
        self.call_helper(0, args, keywords, loc)
    }

    /// `obj.meth(...)` as `LOAD_ATTR` with the method bit plus `CALL`,
    /// skipping the bound-method allocation. Returns whether it applied.
    fn try_method_call(
        &mut self,
        func: &'a Expr,
        args: &'a [Expr],
        keywords: &'a [Keyword],
        loc: Location,
    ) -> Result<bool> {
        let ExprKind::Attribute { value, attr } = &func.kind else {
            return Ok(false);
        };
        if args.iter().any(Expr::is_starred) || keywords.iter().any(|kw| kw.arg.is_none()) {
            return Ok(false);
        }
        if let ExprKind::Name(id) = &value.kind {
            if self.is_import_originated(id) {
                return Ok(false);
            }
        }
        let nkw = keywords.len();
        if args.len() + nkw + usize::from(nkw != 0) >= STACK_USE_GUIDELINE {
            return Ok(false);
        }

        self.compile_expression(value)?;
        let attr_loc = attr_location(func.location, func);
        self.emit_load_attr(attr, true, attr_loc)?;
        for arg in args {
            self.compile_expression(arg)?;
        }
        if nkw > 0 {
            for keyword in keywords {
                self.compile_expression(&keyword.value)?;
            }
            self.emit_kw_names(keywords, loc)?;
        }
        let argc = (args.len() + nkw) as u32;
        self.emit(Opcode::Call, argc, attr_location(loc, func))?;
        Ok(true)
    }

    fn emit_kw_names(&mut self, keywords: &[Keyword], loc: Location) -> Result<()> {
        let names = keywords
            .iter()
            .filter_map(|kw| kw.arg.as_deref())
            .map(Constant::str)
            .collect();
        let value = self.cache.merge(Constant::tuple(names));
        let index = self.unit.const_index(value)?;
        self.emit(Opcode::KwNames, index, loc)
    }

    /// Emits the arguments and the call for a callable already on the stack
    /// together with `pushed` extra positional values.
    pub(super) fn call_helper(
        &mut self,
        pushed: usize,
        args: &'a [Expr],
        keywords: &'a [Keyword],
        loc: Location,
    ) -> Result<()> {
        self.validate_keywords(keywords)?;
        let nargs = args.len();
        let nkw = keywords.len();
        let needs_ex_call = nargs + nkw * 2 > STACK_USE_GUIDELINE
            || args.iter().any(Expr::is_starred)
            || keywords.iter().any(|kw| kw.arg.is_none());

        if !needs_ex_call {
            for arg in args {
                self.compile_expression(arg)?;
            }
            if nkw > 0 {
                for keyword in keywords {
                    self.compile_expression(&keyword.value)?;
                }
                self.emit_kw_names(keywords, loc)?;
            }
            return self.emit(Opcode::Call, (pushed + nargs + nkw) as u32, loc);
        }

        // Positional arguments as one tuple.
        match args {
            [Expr {
                kind: ExprKind::Starred(inner),
                ..
            }] if pushed == 0 => self.compile_expression(inner)?,
            _ => self.starunpack_helper(args, pushed, TUPLE_BUILDER, loc)?,
        }

        // Keyword arguments as one dict.
        if nkw > 0 {
            let mut nseen = 0;
            let mut have_dict = false;
            for (i, keyword) in keywords.iter().enumerate() {
                if keyword.arg.is_some() {
                    nseen += 1;
                    continue;
                }
                if nseen > 0 {
                    self.subkwargs(&keywords[i - nseen..i], loc)?;
                    if have_dict {
                        self.emit(Opcode::DictMerge, 1, loc)?;
                    }
                    have_dict = true;
                    nseen = 0;
                }
                if !have_dict {
                    self.emit(Opcode::BuildMap, 0, loc)?;
                    have_dict = true;
                }
                self.compile_expression(&keyword.value)?;
                self.emit(Opcode::DictMerge, 1, loc)?;
            }
            if nseen > 0 {
                self.subkwargs(&keywords[nkw - nseen..], loc)?;
                if have_dict {
                    self.emit(Opcode::DictMerge, 1, loc)?;
                }
            }
        }
        self.emit(Opcode::CallFunctionEx, u32::from(nkw > 0), loc)
    }

    /// A run of named keyword arguments as a dict.
    fn subkwargs(&mut self, keywords: &'a [Keyword], loc: Location) -> Result<()> {
        let n = keywords.len();
        let big = n * 2 > STACK_USE_GUIDELINE;
        if n > 1 && !big {
            for keyword in keywords {
                self.compile_expression(&keyword.value)?;
            }
            let keys = keywords
                .iter()
                .filter_map(|kw| kw.arg.as_deref())
                .map(Constant::str)
                .collect();
            self.emit_const(Constant::tuple(keys), loc)?;
            return self.emit(Opcode::BuildConstKeyMap, n as u32, loc);
        }
        if big {
            self.emit(Opcode::BuildMap, 0, loc)?;
        }
        for keyword in keywords {
            let name = keyword.arg.as_deref().unwrap_or_default();
            self.emit_const(Constant::str(name), loc)?;
            self.compile_expression(&keyword.value)?;
            if big {
                self.emit(Opcode::MapAdd, 1, loc)?;
            }
        }
        if !big {
            self.emit(Opcode::BuildMap, n as u32, loc)?;
        }
        Ok(())
    }

    // ========================================================================
    // Displays
    // ========================================================================

    /// Builds a list, tuple or set from `elts`, expanding starred items.
    /// `pushed` values already on the stack become the leading elements.
    fn starunpack_helper(
        &mut self,
        elts: &'a [Expr],
        pushed: usize,
        builder: Builder,
        loc: Location,
    ) -> Result<()> {
        let n = elts.len();
        let foldable = builder.build == Opcode::BuildList
            && n > 2
            && elts.iter().all(|elt| elt.as_constant().is_some());
        if foldable {
            let folded = Constant::tuple(elts.iter().filter_map(Expr::as_constant).cloned().collect());
            if builder.tuple && pushed == 0 {
                return self.emit_const(folded, loc);
            }
            self.emit(builder.build, pushed as u32, loc)?;
            self.emit_const(folded, loc)?;
            self.emit(builder.extend, 1, loc)?;
            if builder.tuple {
                self.emit(Opcode::CallIntrinsic1, Intrinsic1::ListToTuple as u32, loc)?;
            }
            return Ok(());
        }

        let big = n + pushed > STACK_USE_GUIDELINE;
        let seen_star = elts.iter().any(Expr::is_starred);
        if !seen_star && !big {
            for elt in elts {
                self.compile_expression(elt)?;
            }
            let op = if builder.tuple {
                Opcode::BuildTuple
            } else {
                builder.build
            };
            return self.emit(op, (n + pushed) as u32, loc);
        }

        let mut sequence_built = false;
        if big {
            self.emit(builder.build, pushed as u32, loc)?;
            sequence_built = true;
        }
        for (i, elt) in elts.iter().enumerate() {
            if let ExprKind::Starred(inner) = &elt.kind {
                if !sequence_built {
                    self.emit(builder.build, (i + pushed) as u32, loc)?;
                    sequence_built = true;
                }
                self.compile_expression(inner)?;
                self.emit(builder.extend, 1, loc)?;
            } else {
                self.compile_expression(elt)?;
                if sequence_built {
                    self.emit(builder.add, 1, loc)?;
                }
            }
        }
        if builder.tuple {
            self.emit(Opcode::CallIntrinsic1, Intrinsic1::ListToTuple as u32, loc)?;
        }
        Ok(())
    }

    fn compile_dict(&mut self, keys: &'a [Option<Expr>], values: &'a [Expr], loc: Location) -> Result<()> {
        if keys.len() != values.len() {
            return Err(CompileError::internal("dict display with mismatched keys"));
        }
        let n = values.len();
        let mut have_dict = false;
        let mut elements = 0;
        for i in 0..n {
            if keys[i].is_none() {
                if elements > 0 {
                    self.subdict(&keys[i - elements..i], &values[i - elements..i], loc)?;
                    if have_dict {
                        self.emit(Opcode::DictUpdate, 1, loc)?;
                    }
                    have_dict = true;
                    elements = 0;
                }
                if !have_dict {
                    self.emit(Opcode::BuildMap, 0, loc)?;
                    have_dict = true;
                }
                self.compile_expression(&values[i])?;
                self.emit(Opcode::DictUpdate, 1, loc)?;
            } else if elements * 2 > STACK_USE_GUIDELINE {
                self.subdict(&keys[i - elements..=i], &values[i - elements..=i], loc)?;
                if have_dict {
                    self.emit(Opcode::DictUpdate, 1, loc)?;
                }
                have_dict = true;
                elements = 0;
            } else {
                elements += 1;
            }
        }
        if elements > 0 {
            self.subdict(&keys[n - elements..], &values[n - elements..], loc)?;
            if have_dict {
                self.emit(Opcode::DictUpdate, 1, loc)?;
            }
            have_dict = true;
        }
        if !have_dict {
            self.emit(Opcode::BuildMap, 0, loc)?;
        }
        Ok(())
    }

    /// A run of `key: value` items without unpacking.
    fn subdict(&mut self, keys: &'a [Option<Expr>], values: &'a [Expr], loc: Location) -> Result<()> {
        let n = keys.len();
        let big = n * 2 > STACK_USE_GUIDELINE;
        let const_keys: Option<Vec<Constant>> = keys
            .iter()
            .map(|key| key.as_ref().and_then(Expr::as_constant).cloned())
            .collect();
        if let Some(const_keys) = const_keys.filter(|_| n > 1 && !big) {
            for value in values {
                self.compile_expression(value)?;
            }
            self.emit_const(Constant::tuple(const_keys), loc)?;
            return self.emit(Opcode::BuildConstKeyMap, n as u32, loc);
        }
        if big {
            self.emit(Opcode::BuildMap, 0, loc)?;
        }
        for (key, value) in keys.iter().zip(values) {
            let key = key
                .as_ref()
                .ok_or_else(|| CompileError::internal("unpacking inside a dict item run"))?;
            self.compile_expression(key)?;
            self.compile_expression(value)?;
            if big {
                self.emit(Opcode::MapAdd, 1, loc)?;
            }
        }
        if !big {
            self.emit(Opcode::BuildMap, n as u32, loc)?;
        }
        Ok(())
    }

    fn compile_joined_str(&mut self, values: &'a [Expr], loc: Location) -> Result<()> {
        if values.len() > STACK_USE_GUIDELINE {
            self.emit_const(Constant::str(""), loc)?;
            self.emit_load_attr("join", true, loc)?;
            self.emit(Opcode::BuildList, 0, loc)?;
            for value in values {
                self.compile_expression(value)?;
                self.emit(Opcode::ListAppend, 1, loc)?;
            }
            return self.emit(Opcode::Call, 1, loc);
        }
        for value in values {
            self.compile_expression(value)?;
        }
        if values.len() != 1 {
            self.emit(Opcode::BuildString, values.len() as u32, loc)?;
        }
        Ok(())
    }

    // ========================================================================
    // Warnings about likely-missing commas
    // ========================================================================

    fn check_caller(&mut self, func: &Expr) -> Result<()> {
        let literal = matches!(
            func.kind,
            ExprKind::Constant(_)
                | ExprKind::Tuple(_)
                | ExprKind::List(_)
                | ExprKind::ListComp { .. }
                | ExprKind::Dict { .. }
                | ExprKind::DictComp { .. }
                | ExprKind::Set(_)
                | ExprKind::SetComp { .. }
                | ExprKind::GeneratorExp { .. }
                | ExprKind::JoinedStr(_)
                | ExprKind::FormattedValue { .. }
        );
        match infer_type(func).filter(|_| literal) {
            Some(type_name) => self.warn(
                format!("'{type_name}' object is not callable; perhaps you missed a comma?"),
                func.location,
            ),
            None => Ok(()),
        }
    }

    fn check_subscripter(&mut self, value: &Expr, loc: Location) -> Result<()> {
        let suspicious = match &value.kind {
            ExprKind::Constant(c) => matches!(
                c,
                Constant::None
                    | Constant::Ellipsis
                    | Constant::Bool(_)
                    | Constant::Int(_)
                    | Constant::Float(_)
                    | Constant::Complex { .. }
            ),
            ExprKind::Set(_)
            | ExprKind::SetComp { .. }
            | ExprKind::GeneratorExp { .. }
            | ExprKind::Lambda { .. } => true,
            _ => false,
        };
        match infer_type(value).filter(|_| suspicious) {
            Some(type_name) => self.warn(
                format!("'{type_name}' object is not subscriptable; perhaps you missed a comma?"),
                loc,
            ),
            None => Ok(()),
        }
    }

    fn check_index(&mut self, value: &Expr, slice: &Expr, loc: Location) -> Result<()> {
        let Some(index_type) = infer_type(slice) else {
            return Ok(());
        };
        if matches!(index_type, "int" | "bool") {
            return Ok(());
        }
        let suspicious = match &value.kind {
            ExprKind::Constant(c) => {
                matches!(c, Constant::Str(_) | Constant::Bytes(_) | Constant::Tuple(_))
            }
            ExprKind::Tuple(_)
            | ExprKind::List(_)
            | ExprKind::ListComp { .. }
            | ExprKind::JoinedStr(_)
            | ExprKind::FormattedValue { .. } => true,
            _ => false,
        };
        match infer_type(value).filter(|_| suspicious) {
            Some(value_type) => self.warn(
                format!(
                    "{value_type} indices must be integers or slices, not {index_type}; \
                     perhaps you missed a comma?"
                ),
                loc,
            ),
            None => Ok(()),
        }
    }
}

fn pop_jump_if(cond: bool) -> PseudoOp {
    if cond {
        PseudoOp::PopJumpIfTrue
    } else {
        PseudoOp::PopJumpIfFalse
    }
}

/// Operands for which `is` has well-defined identity semantics.
fn is_identity_safe(expr: &Expr) -> bool {
    match expr.as_constant() {
        Some(value) => matches!(
            value,
            Constant::None | Constant::Bool(_) | Constant::Ellipsis
        ),
        None => true,
    }
}

/// The static type name of a literal expression, if it has one.
fn infer_type(expr: &Expr) -> Option<&'static str> {
    match &expr.kind {
        ExprKind::Tuple(_) => Some("tuple"),
        ExprKind::List(_) | ExprKind::ListComp { .. } => Some("list"),
        ExprKind::Dict { .. } | ExprKind::DictComp { .. } => Some("dict"),
        ExprKind::Set(_) | ExprKind::SetComp { .. } => Some("set"),
        ExprKind::GeneratorExp { .. } => Some("generator"),
        ExprKind::Lambda { .. } => Some("function"),
        ExprKind::JoinedStr(_) | ExprKind::FormattedValue { .. } => Some("str"),
        ExprKind::Constant(value) => Some(value.type_name()),
        _ => None,
    }
}

/// For an attribute that continues on a later line, moves the start of
/// `loc` to the attribute name so tracebacks point at it.
fn attr_location(mut loc: Location, attr_expr: &Expr) -> Location {
    let ExprKind::Attribute { attr, .. } = &attr_expr.kind else {
        return loc;
    };
    let end = attr_expr.location;
    if loc.line == end.end_line {
        return loc;
    }
    loc.line = end.end_line;
    let len = attr.chars().count() as i32;
    if len <= end.end_col {
        loc.col = end.end_col - len;
    } else {
        loc.col = -1;
        loc.end_col = -1;
    }
    loc.end_line = loc.end_line.max(loc.line);
    if loc.line == loc.end_line {
        loc.end_col = loc.end_col.max(loc.col);
    }
    loc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute(line: i32, end_line: i32, end_col: i32) -> Expr {
        Expr {
            kind: ExprKind::Attribute {
                value: Box::new(Expr {
                    kind: ExprKind::Name("obj".into()),
                    location: Location::new(line, 0, line, 3),
                }),
                attr: "method".into(),
            },
            location: Location::new(line, 0, end_line, end_col),
        }
    }

    #[test]
    fn test_attr_location_same_line_is_unchanged() {
        let expr = attribute(1, 1, 10);
        assert_eq!(attr_location(expr.location, &expr), expr.location);
    }

    #[test]
    fn test_attr_location_moves_to_attribute_line() {
        let expr = attribute(1, 3, 10);
        let loc = attr_location(expr.location, &expr);
        assert_eq!(loc.line, 3);
        assert_eq!(loc.col, 4);
        assert_eq!(loc.end_line, 3);
        assert_eq!(loc.end_col, 10);
    }

    #[test]
    fn test_identity_safe_constants() {
        let none = Expr {
            kind: ExprKind::Constant(Constant::None),
            location: Location::NONE,
        };
        let int = Expr {
            kind: ExprKind::Constant(Constant::from(1)),
            location: Location::NONE,
        };
        assert!(is_identity_safe(&none));
        assert!(!is_identity_safe(&int));
    }

    #[test]
    fn test_infer_type_names() {
        let tuple = Expr {
            kind: ExprKind::Tuple(vec![]),
            location: Location::NONE,
        };
        assert_eq!(infer_type(&tuple), Some("tuple"));
        let name = Expr {
            kind: ExprKind::Name("x".into()),
            location: Location::NONE,
        };
        assert_eq!(infer_type(&name), None);
    }
}
