// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Structural pattern matching.
//!
//! A pattern is compiled against the subject on top of the stack. Captured
//! values are not stored while the pattern is still being tested: they stay
//! on the stack below whatever the remaining checks need, and are bound only
//! once the whole pattern has matched. A failed check jumps into a chain of
//! `POP_TOP` blocks, entering it at the depth that pops exactly the
//! intermediate values and pending captures live at that point.

use crate::ast::{
    Expr, ExprKind, Location, MatchCase, Operator, Pattern, PatternKind, UnaryOperator,
};
use crate::compiler::cfg::Label;
use crate::compiler::opcode::{AnyOp, ComparisonOperator, Opcode, PseudoOp};
use crate::constant::Constant;
use crate::error::{CompileError, Result};

use super::{Compiler, ExprContext};

/// Bookkeeping for one pattern being compiled.
#[derive(Debug, Default)]
struct PatternContext {
    /// Names captured so far, in stack order
    stores: Vec<String>,
    /// Whether an irrefutable pattern is allowed here
    allow_irrefutable: bool,
    /// `fail_pop[n]` pops `n` values and falls into the failure path
    fail_pop: Vec<Label>,
    /// Values above the pending captures that a failure must pop
    on_top: usize,
}

impl PatternContext {
    fn new(allow_irrefutable: bool) -> Self {
        Self {
            allow_irrefutable,
            ..Self::default()
        }
    }
}

/// Values a `MatchValue` pattern may compare against.
fn is_match_value_expr(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Constant(_) | ExprKind::Attribute { .. } => true,
        // Negative numbers and complex literals.
        ExprKind::UnaryOp {
            op: UnaryOperator::USub,
            operand,
        } => operand.as_constant().is_some(),
        ExprKind::BinOp { left, right, .. } => {
            is_match_value_expr(left) && right.as_constant().is_some()
        }
        _ => false,
    }
}

impl<'a> Compiler<'a> {
    pub(super) fn compile_match(
        &mut self,
        subject: &'a Expr,
        cases: &'a [MatchCase],
        _loc: Location,
    ) -> Result<()> {
        self.compile_expression(subject)?;
        let Some(last_case) = cases.last() else {
            return Err(CompileError::internal("match statement without cases"));
        };
        let end = self.new_label();
        let has_default = last_case.pattern.is_wildcard() && cases.len() > 1;
        let tested = cases.len() - usize::from(has_default);

        for (i, case) in cases[..tested].iter().enumerate() {
            let ploc = case.pattern.location;
            let keeps_subject = i + 1 != tested;
            if keeps_subject {
                self.emit(Opcode::Copy, 1, ploc)?;
            }
            // Irrefutable cases must be guarded, last, or both.
            let mut pc = PatternContext::new(case.guard.is_some() || i + 1 == cases.len());
            self.compile_pattern(&case.pattern, &mut pc)?;
            debug_assert_eq!(pc.on_top, 0);

            for name in &pc.stores {
                self.compile_name(name, ExprContext::Store, ploc)?;
            }
            if let Some(guard) = &case.guard {
                self.ensure_fail_pop(&mut pc, 0);
                self.compile_jump_if(guard, pc.fail_pop[0], false)?;
            }
            if keeps_subject {
                self.emit(Opcode::PopTop, 0, ploc)?;
            }
            self.compile_statements(&case.body)?;
            self.emit_jump(PseudoOp::Jump, end, Location::NONE)?;
            self.emit_and_reset_fail_pop(&mut pc, ploc)?;
        }

        if has_default {
            let ploc = last_case.pattern.location;
            if cases.len() == 1 {
                self.emit(Opcode::PopTop, 0, ploc)?;
            } else {
                self.emit(Opcode::Nop, 0, ploc)?;
            }
            if let Some(guard) = &last_case.guard {
                self.compile_jump_if(guard, end, false)?;
            }
            self.compile_statements(&last_case.body)?;
        }
        self.use_label(end)
    }

    // ========================================================================
    // Failure paths
    // ========================================================================

    fn ensure_fail_pop(&mut self, pc: &mut PatternContext, n: usize) {
        while pc.fail_pop.len() <= n {
            let label = self.new_label();
            pc.fail_pop.push(label);
        }
    }

    /// Jumps to the failure path, popping the values on top plus every
    /// pending capture.
    fn jump_to_fail_pop(
        &mut self,
        pc: &mut PatternContext,
        op: impl Into<AnyOp>,
        loc: Location,
    ) -> Result<()> {
        let pops = pc.on_top + pc.stores.len();
        self.ensure_fail_pop(pc, pops);
        self.emit_jump(op, pc.fail_pop[pops], loc)
    }

    /// Emits the `POP_TOP` chain, deepest entry first, and leaves the
    /// current block at `fail_pop[0]`.
    fn emit_and_reset_fail_pop(&mut self, pc: &mut PatternContext, loc: Location) -> Result<()> {
        let Some((&first, rest)) = pc.fail_pop.split_first() else {
            return Ok(());
        };
        for &label in rest.iter().rev() {
            self.use_label(label)?;
            self.emit(Opcode::PopTop, 0, loc)?;
        }
        self.use_label(first)?;
        pc.fail_pop.clear();
        Ok(())
    }

    // ========================================================================
    // Captures
    // ========================================================================

    /// `SWAP count, SWAP count-1, ... SWAP 2`: moves the top of the stack
    /// `count - 1` places down.
    fn rotate(&mut self, count: usize, loc: Location) -> Result<()> {
        for n in (2..=count).rev() {
            self.emit(Opcode::Swap, n as u32, loc)?;
        }
        Ok(())
    }

    /// Queues the value on top of the stack for binding to `name`, or
    /// discards it for `_`.
    fn store_capture(
        &mut self,
        name: Option<&str>,
        pc: &mut PatternContext,
        loc: Location,
    ) -> Result<()> {
        let Some(name) = name else {
            return self.emit(Opcode::PopTop, 0, loc);
        };
        if name == "__debug__" {
            return Err(self.error("cannot assign to __debug__", loc));
        }
        if pc.stores.iter().any(|stored| stored == name) {
            return Err(self.error(
                format!("multiple assignments to name '{name}' in pattern"),
                loc,
            ));
        }
        self.rotate(pc.on_top + pc.stores.len() + 1, loc)?;
        pc.stores.push(name.to_string());
        Ok(())
    }

    // ========================================================================
    // Patterns
    // ========================================================================

    fn compile_pattern(&mut self, pattern: &'a Pattern, pc: &mut PatternContext) -> Result<()> {
        let loc = pattern.location;
        match &pattern.kind {
            PatternKind::MatchValue(value) => {
                if !is_match_value_expr(value) {
                    return Err(self.error(
                        "patterns may only match literals and attribute lookups",
                        loc,
                    ));
                }
                self.compile_expression(value)?;
                self.emit(Opcode::CompareOp, ComparisonOperator::Equal as u32, loc)?;
                self.jump_to_fail_pop(pc, PseudoOp::PopJumpIfFalse, loc)
            }
            PatternKind::MatchSingleton(value) => {
                self.emit_const(value.clone(), loc)?;
                self.emit(Opcode::IsOp, 0, loc)?;
                self.jump_to_fail_pop(pc, PseudoOp::PopJumpIfFalse, loc)
            }
            PatternKind::MatchSequence(patterns) => self.compile_sequence_pattern(patterns, pc, loc),
            PatternKind::MatchMapping {
                keys,
                patterns,
                rest,
            } => self.compile_mapping_pattern(keys, patterns, rest.as_deref(), pc, loc),
            PatternKind::MatchClass {
                cls,
                patterns,
                kwd_attrs,
                kwd_patterns,
            } => self.compile_class_pattern(cls, patterns, kwd_attrs, kwd_patterns, pc, loc),
            PatternKind::MatchStar(name) => self.store_capture(name.as_deref(), pc, loc),
            PatternKind::MatchAs { pattern: None, name } => {
                if !pc.allow_irrefutable {
                    let message = match name {
                        Some(name) => {
                            format!("name capture '{name}' makes remaining patterns unreachable")
                        }
                        None => "wildcard makes remaining patterns unreachable".to_string(),
                    };
                    return Err(self.error(message, loc));
                }
                self.store_capture(name.as_deref(), pc, loc)
            }
            PatternKind::MatchAs {
                pattern: Some(inner),
                name,
            } => {
                pc.on_top += 1;
                self.emit(Opcode::Copy, 1, loc)?;
                self.compile_pattern(inner, pc)?;
                pc.on_top -= 1;
                self.store_capture(name.as_deref(), pc, loc)
            }
            PatternKind::MatchOr(alternatives) => self.compile_or_pattern(alternatives, pc, loc),
        }
    }

    /// A nested pattern: irrefutable sub-patterns are always allowed.
    fn compile_subpattern(&mut self, pattern: &'a Pattern, pc: &mut PatternContext) -> Result<()> {
        let allow_irrefutable = std::mem::replace(&mut pc.allow_irrefutable, true);
        self.compile_pattern(pattern, pc)?;
        pc.allow_irrefutable = allow_irrefutable;
        Ok(())
    }

    fn compile_sequence_pattern(
        &mut self,
        patterns: &'a [Pattern],
        pc: &mut PatternContext,
        loc: Location,
    ) -> Result<()> {
        let size = patterns.len();
        let mut star = None;
        let mut only_wildcard = true;
        let mut star_wildcard = false;
        for (i, pattern) in patterns.iter().enumerate() {
            if matches!(pattern.kind, PatternKind::MatchStar(_)) {
                if star.is_some() {
                    return Err(self.error("multiple starred names in sequence pattern", loc));
                }
                star_wildcard = pattern.is_star_wildcard();
                only_wildcard &= star_wildcard;
                star = Some(i);
            } else {
                only_wildcard &= pattern.is_wildcard();
            }
        }

        // The subject stays on top through the type and length checks.
        pc.on_top += 1;
        self.emit(Opcode::MatchSequence, 0, loc)?;
        self.jump_to_fail_pop(pc, PseudoOp::PopJumpIfFalse, loc)?;
        let length_check = match star {
            None => Some((size, ComparisonOperator::Equal)),
            Some(_) if size > 1 => Some((size - 1, ComparisonOperator::GreaterOrEqual)),
            Some(_) => None,
        };
        if let Some((len, cmp)) = length_check {
            self.emit(Opcode::GetLen, 0, loc)?;
            self.emit_const(Constant::from(len as i64), loc)?;
            self.emit(Opcode::CompareOp, cmp as u32, loc)?;
            self.jump_to_fail_pop(pc, PseudoOp::PopJumpIfFalse, loc)?;
        }
        pc.on_top -= 1;

        if only_wildcard {
            self.emit(Opcode::PopTop, 0, loc)
        } else if let (Some(star), true) = (star, star_wildcard) {
            self.sequence_subscr(patterns, star, pc, loc)
        } else {
            self.sequence_unpack(patterns, pc, loc)
        }
    }

    /// Unpacks the subject and matches each element in turn.
    fn sequence_unpack(
        &mut self,
        patterns: &'a [Pattern],
        pc: &mut PatternContext,
        loc: Location,
    ) -> Result<()> {
        let n = patterns.len();
        let mut seen_star = false;
        for (i, pattern) in patterns.iter().enumerate() {
            if !matches!(pattern.kind, PatternKind::MatchStar(_)) {
                continue;
            }
            if seen_star {
                return Err(self.error("multiple starred expressions in sequence pattern", loc));
            }
            let after = n - i - 1;
            if i >= 1 << 8 || after >= (i32::MAX >> 8) as usize {
                return Err(self.error(
                    "too many expressions in star-unpacking sequence pattern",
                    loc,
                ));
            }
            self.emit(Opcode::UnpackEx, (i + (after << 8)) as u32, loc)?;
            seen_star = true;
        }
        if !seen_star {
            self.emit(Opcode::UnpackSequence, n as u32, loc)?;
        }

        pc.on_top += n;
        for pattern in patterns {
            pc.on_top -= 1;
            self.compile_subpattern(pattern, pc)?;
        }
        Ok(())
    }

    /// With a `*_` wildcard, indexes only the elements that are tested.
    /// Elements after the star use `len(subject) - k`, since the subject
    /// need not support negative indices.
    fn sequence_subscr(
        &mut self,
        patterns: &'a [Pattern],
        star: usize,
        pc: &mut PatternContext,
        loc: Location,
    ) -> Result<()> {
        let size = patterns.len();
        pc.on_top += 1;
        for (i, pattern) in patterns.iter().enumerate() {
            if pattern.is_wildcard() || i == star {
                continue;
            }
            self.emit(Opcode::Copy, 1, loc)?;
            if i < star {
                self.emit_const(Constant::from(i as i64), loc)?;
            } else {
                self.emit(Opcode::GetLen, 0, loc)?;
                self.emit_const(Constant::from((size - i) as i64), loc)?;
                self.emit(Opcode::BinaryOp, Operator::Sub.oparg(false), loc)?;
            }
            self.emit(Opcode::BinarySubscr, 0, loc)?;
            self.compile_subpattern(pattern, pc)?;
        }
        pc.on_top -= 1;
        self.emit(Opcode::PopTop, 0, loc)
    }

    fn compile_mapping_pattern(
        &mut self,
        keys: &'a [Expr],
        patterns: &'a [Pattern],
        rest: Option<&str>,
        pc: &mut PatternContext,
        loc: Location,
    ) -> Result<()> {
        let size = keys.len();
        if size != patterns.len() {
            return Err(self.error(
                format!(
                    "keys ({size}) / patterns ({}) length mismatch in mapping pattern",
                    patterns.len()
                ),
                loc,
            ));
        }

        pc.on_top += 1;
        self.emit(Opcode::MatchMapping, 0, loc)?;
        self.jump_to_fail_pop(pc, PseudoOp::PopJumpIfFalse, loc)?;
        if size == 0 && rest.is_none() {
            // `{}` matches any mapping.
            pc.on_top -= 1;
            return self.emit(Opcode::PopTop, 0, loc);
        }
        if size > 0 {
            self.emit(Opcode::GetLen, 0, loc)?;
            self.emit_const(Constant::from(size as i64), loc)?;
            self.emit(
                Opcode::CompareOp,
                ComparisonOperator::GreaterOrEqual as u32,
                loc,
            )?;
            self.jump_to_fail_pop(pc, PseudoOp::PopJumpIfFalse, loc)?;
        }

        let mut seen: Vec<&Constant> = Vec::new();
        for key in keys {
            match &key.kind {
                ExprKind::Constant(value) => {
                    if seen.contains(&value) {
                        return Err(self.error(
                            format!("mapping pattern checks duplicate key ({value})"),
                            loc,
                        ));
                    }
                    seen.push(value);
                }
                ExprKind::Attribute { .. } => {}
                _ if is_match_value_expr(key) => {}
                _ => {
                    return Err(self.error(
                        "mapping pattern keys may only match literals and attribute lookups",
                        loc,
                    ));
                }
            }
            self.compile_expression(key)?;
        }
        self.emit(Opcode::BuildTuple, size as u32, loc)?;
        self.emit(Opcode::MatchKeys, 0, loc)?;
        // Keys tuple and values tuple (or None) now sit on the subject.
        pc.on_top += 2;
        self.emit(Opcode::Copy, 1, loc)?;
        self.emit_const(Constant::None, loc)?;
        self.emit(Opcode::IsOp, 1, loc)?;
        self.jump_to_fail_pop(pc, PseudoOp::PopJumpIfFalse, loc)?;

        self.emit(Opcode::UnpackSequence, size as u32, loc)?;
        pc.on_top += size;
        pc.on_top -= 1;
        for pattern in patterns {
            pc.on_top -= 1;
            self.compile_subpattern(pattern, pc)?;
        }
        pc.on_top -= 2;

        match rest {
            Some(rest) => {
                // rest = dict(subject); del rest[k] for each matched key
                self.emit(Opcode::BuildMap, 0, loc)?;
                self.emit(Opcode::Swap, 3, loc)?;
                self.emit(Opcode::DictUpdate, 2, loc)?;
                self.emit(Opcode::UnpackSequence, size as u32, loc)?;
                for remaining in (1..=size).rev() {
                    self.emit(Opcode::Copy, (1 + remaining) as u32, loc)?;
                    self.emit(Opcode::Swap, 2, loc)?;
                    self.emit(Opcode::DeleteSubscr, 0, loc)?;
                }
                self.store_capture(Some(rest), pc, loc)
            }
            None => {
                self.emit(Opcode::PopTop, 0, loc)?;
                self.emit(Opcode::PopTop, 0, loc)
            }
        }
    }

    fn compile_class_pattern(
        &mut self,
        cls: &'a Expr,
        patterns: &'a [Pattern],
        kwd_attrs: &'a [String],
        kwd_patterns: &'a [Pattern],
        pc: &mut PatternContext,
        loc: Location,
    ) -> Result<()> {
        let nargs = patterns.len();
        let nattrs = kwd_attrs.len();
        if nattrs != kwd_patterns.len() {
            return Err(self.error(
                format!(
                    "kwd_attrs ({nattrs}) / kwd_patterns ({}) length mismatch in class pattern",
                    kwd_patterns.len()
                ),
                loc,
            ));
        }
        for (i, attr) in kwd_attrs.iter().enumerate() {
            let attr_loc = kwd_patterns[i].location;
            if attr == "__debug__" {
                return Err(self.error("cannot assign to __debug__", attr_loc));
            }
            if let Some(j) = kwd_attrs[i + 1..].iter().position(|other| other == attr) {
                return Err(self.error(
                    format!("attribute name repeated in class pattern: {attr}"),
                    kwd_patterns[i + 1 + j].location,
                ));
            }
        }

        self.compile_expression(cls)?;
        let names = kwd_attrs.iter().map(|attr| Constant::str(attr)).collect();
        self.emit_const(Constant::tuple(names), loc)?;
        self.emit(Opcode::MatchClass, nargs as u32, loc)?;
        self.emit(Opcode::Copy, 1, loc)?;
        self.emit_const(Constant::None, loc)?;
        self.emit(Opcode::IsOp, 1, loc)?;
        // A tuple of the matched attributes, or None.
        pc.on_top += 1;
        self.jump_to_fail_pop(pc, PseudoOp::PopJumpIfFalse, loc)?;

        let total = nargs + nattrs;
        self.emit(Opcode::UnpackSequence, total as u32, loc)?;
        pc.on_top += total;
        pc.on_top -= 1;
        for pattern in patterns.iter().chain(kwd_patterns) {
            pc.on_top -= 1;
            if pattern.is_wildcard() {
                self.emit(Opcode::PopTop, 0, loc)?;
                continue;
            }
            self.compile_subpattern(pattern, pc)?;
        }
        Ok(())
    }

    fn compile_or_pattern(
        &mut self,
        alternatives: &'a [Pattern],
        pc: &mut PatternContext,
        loc: Location,
    ) -> Result<()> {
        let end = self.new_label();
        let outer_allows_irrefutable = pc.allow_irrefutable;
        // Names bound by the first alternative, in stack order.
        let mut control: Option<Vec<String>> = None;

        for (i, alt) in alternatives.iter().enumerate() {
            let is_last = i + 1 == alternatives.len();
            let mut alt_pc = PatternContext::new(is_last && outer_allows_irrefutable);
            self.emit(Opcode::Copy, 1, alt.location)?;
            self.compile_pattern(alt, &mut alt_pc)?;

            match &control {
                None => control = Some(alt_pc.stores.clone()),
                Some(control) if control.len() != alt_pc.stores.len() => {
                    return Err(self.error("alternative patterns bind different names", loc));
                }
                Some(control) => {
                    // Reorder this alternative's captures to match the first.
                    for icontrol in (0..control.len()).rev() {
                        let name = &control[icontrol];
                        let Some(istores) = alt_pc.stores.iter().position(|s| s == name) else {
                            return Err(
                                self.error("alternative patterns bind different names", loc)
                            );
                        };
                        if icontrol == istores {
                            continue;
                        }
                        let rotations = istores + 1;
                        let rotated: Vec<String> = alt_pc.stores.drain(..rotations).collect();
                        let at = icontrol - istores;
                        for (k, moved) in rotated.into_iter().enumerate() {
                            alt_pc.stores.insert(at + k, moved);
                        }
                        for _ in 0..rotations {
                            self.rotate(icontrol + 1, loc)?;
                        }
                    }
                }
            }
            self.emit_jump(PseudoOp::Jump, end, alt.location)?;
            self.emit_and_reset_fail_pop(&mut alt_pc, alt.location)?;
        }

        // No alternative matched: drop the subject copy and fail.
        self.emit(Opcode::PopTop, 0, loc)?;
        self.jump_to_fail_pop(pc, PseudoOp::Jump, loc)?;

        self.use_label(end)?;
        let control = control.unwrap_or_default();
        let nrots = control.len() + 1 + pc.on_top + pc.stores.len();
        for name in control {
            self.rotate(nrots, loc)?;
            if pc.stores.contains(&name) {
                return Err(self.error(
                    format!("multiple assignments to name '{name}' in pattern"),
                    loc,
                ));
            }
            pc.stores.push(name);
        }
        // The subject copy.
        self.emit(Opcode::PopTop, 0, loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(kind: ExprKind) -> Expr {
        Expr {
            kind,
            location: Location::NONE,
        }
    }

    #[test]
    fn test_match_value_expressions() {
        let one = expr(ExprKind::Constant(Constant::from(1i64)));
        assert!(is_match_value_expr(&one));

        let negative = expr(ExprKind::UnaryOp {
            op: UnaryOperator::USub,
            operand: Box::new(one.clone()),
        });
        assert!(is_match_value_expr(&negative));

        let name = expr(ExprKind::Name("x".into()));
        assert!(!is_match_value_expr(&name));

        let call = expr(ExprKind::Call {
            func: Box::new(name),
            args: vec![],
            keywords: vec![],
        });
        assert!(!is_match_value_expr(&call));
    }
}
