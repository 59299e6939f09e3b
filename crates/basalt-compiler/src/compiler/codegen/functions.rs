// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Scope-creating constructs: functions, lambdas, classes and
//! comprehensions.
//!
//! Each one compiles its body into a child unit, then emits the code in the
//! parent that turns the finished code object into a function (with
//! defaults, annotations and closure cells) and binds or calls it.

use std::sync::Arc;

use crate::ast::{Arguments, ClassDef, Comprehension, Expr, ExprKind, FunctionDef, Location};
use crate::compiler::code::{CodeFlags, CodeObject};
use crate::compiler::opcode::{Opcode, PseudoOp, make_function};
use crate::constant::Constant;
use crate::error::{CompileError, Result};
use crate::symtable::mangle;

use super::fblock::FrameBlockKind;
use super::{Compiler, ExprContext, UnitKind, docstring};

/// The four comprehension forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

impl ComprehensionKind {
    fn scope_name(self) -> &'static str {
        match self {
            ComprehensionKind::List => "<listcomp>",
            ComprehensionKind::Set => "<setcomp>",
            ComprehensionKind::Dict => "<dictcomp>",
            ComprehensionKind::Generator => "<genexpr>",
        }
    }
}

/// Element expressions of a comprehension: `elt`, or `key: value`.
#[derive(Clone, Copy)]
struct Element<'a> {
    kind: ComprehensionKind,
    elt: &'a Expr,
    value: Option<&'a Expr>,
}

fn count(n: usize, what: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| CompileError::overflow(format!("too many {what}")))
}

impl<'a> Compiler<'a> {
    fn check_debug_args(&self, args: &Arguments) -> Result<()> {
        match args.all().find(|arg| arg.name == "__debug__") {
            Some(arg) => Err(self.error("cannot assign to __debug__", arg.location)),
            None => Ok(()),
        }
    }

    /// Pushes positional and keyword-only defaults; returns the matching
    /// `MAKE_FUNCTION` flags.
    fn compile_defaults(&mut self, args: &'a Arguments, loc: Location) -> Result<u32> {
        let mut flags = 0;
        if !args.defaults.is_empty() {
            for default in &args.defaults {
                self.compile_expression(default)?;
            }
            self.emit(Opcode::BuildTuple, count(args.defaults.len(), "defaults")?, loc)?;
            flags |= make_function::DEFAULTS;
        }

        let mut keys = Vec::new();
        for (arg, default) in args.kwonly.iter().zip(&args.kw_defaults) {
            if let Some(default) = default {
                keys.push(Constant::str(&mangle(self.unit.private.as_deref(), &arg.name)));
                self.compile_expression(default)?;
            }
        }
        if !keys.is_empty() {
            let n = count(keys.len(), "keyword defaults")?;
            self.emit_const(Constant::tuple(keys), loc)?;
            self.emit(Opcode::BuildConstKeyMap, n, loc)?;
            flags |= make_function::KW_DEFAULTS;
        }
        Ok(flags)
    }

    /// Pushes `(name, annotation)` pairs as one tuple; returns whether
    /// anything was pushed.
    fn compile_annotations(
        &mut self,
        args: &'a Arguments,
        returns: Option<&'a Expr>,
        loc: Location,
    ) -> Result<bool> {
        if self.defers_annotations() {
            return Ok(false);
        }
        let params = args
            .args
            .iter()
            .chain(&args.posonly)
            .chain(args.vararg.as_ref())
            .chain(&args.kwonly)
            .chain(args.kwarg.as_ref())
            .filter_map(|arg| Some((arg.name.as_str(), arg.annotation.as_deref()?)));
        let annotated: Vec<(&str, &'a Expr)> = params
            .chain(returns.map(|ret| ("return", ret)))
            .collect();
        if annotated.is_empty() {
            return Ok(false);
        }

        for &(name, annotation) in &annotated {
            let mangled = mangle(self.unit.private.as_deref(), name).into_owned();
            self.emit_const(Constant::str(&mangled), loc)?;
            match &annotation.kind {
                // `*args: *Ts`
                ExprKind::Starred(inner) => {
                    self.compile_expression(inner)?;
                    self.emit(Opcode::UnpackSequence, 1, loc)?;
                }
                _ => self.compile_expression(annotation)?,
            }
        }
        self.emit(
            Opcode::BuildTuple,
            count(annotated.len() * 2, "annotations")?,
            loc,
        )?;
        Ok(true)
    }

    fn set_arg_counts(&mut self, args: &Arguments) -> Result<()> {
        self.unit.argcount = count(args.posonly.len() + args.args.len(), "parameters")?;
        self.unit.posonlyargcount = count(args.posonly.len(), "parameters")?;
        self.unit.kwonlyargcount = count(args.kwonly.len(), "parameters")?;
        if args.vararg.is_some() {
            self.unit.flags |= CodeFlags::VARARGS;
        }
        if args.kwarg.is_some() {
            self.unit.flags |= CodeFlags::VARKEYWORDS;
        }
        Ok(())
    }

    /// Turns a finished code object into a function on the stack.
    ///
    /// Free variables of the child are passed as a tuple of the parent's
    /// cells.
    fn make_closure(&mut self, code: CodeObject, mut flags: u32, loc: Location) -> Result<()> {
        let freevars = code.freevars();
        if !freevars.is_empty() {
            for name in &freevars {
                let index = self.unit.deref_index(name)?;
                self.emit(PseudoOp::LoadClosure, index, loc)?;
            }
            self.emit(Opcode::BuildTuple, count(freevars.len(), "closure cells")?, loc)?;
            flags |= make_function::CLOSURE;
        }
        self.emit_const(Constant::Code(Arc::new(code)), loc)?;
        self.emit(Opcode::MakeFunction, flags, loc)
    }

    fn compile_decorators(&mut self, decorators: &'a [Expr]) -> Result<()> {
        decorators
            .iter()
            .try_for_each(|decorator| self.compile_expression(decorator))
    }

    /// Calls the decorators innermost first.
    fn apply_decorators(&mut self, decorators: &'a [Expr]) -> Result<()> {
        decorators
            .iter()
            .rev()
            .try_for_each(|decorator| self.emit(Opcode::Call, 0, decorator.location))
    }

    // ========================================================================
    // def
    // ========================================================================

    pub(super) fn compile_function_def(&mut self, def: &'a FunctionDef, loc: Location) -> Result<()> {
        self.check_debug_args(&def.args)?;
        self.compile_decorators(&def.decorators)?;
        let firstlineno = def
            .decorators
            .first()
            .map_or(loc.line, |decorator| decorator.location.line);

        let mut flags = self.compile_defaults(&def.args, loc)?;
        if self.compile_annotations(&def.args, def.returns.as_deref(), loc)? {
            flags |= make_function::ANNOTATIONS;
        }

        let kind = if def.is_async {
            UnitKind::AsyncFunction
        } else {
            UnitKind::Function
        };
        let scope = self.table.scope_for(def)?;
        self.enter_scope(&def.name, kind, scope, firstlineno)?;

        // The first constant doubles as the docstring slot.
        let doc = docstring(&def.body).filter(|_| !self.options.optimize.strips_asserts());
        let first = self.cache.merge(doc.cloned().unwrap_or(Constant::None));
        self.unit.const_index(first)?;

        self.set_arg_counts(&def.args)?;
        let body = if doc.is_some() {
            &def.body[1..]
        } else {
            &def.body[..]
        };
        self.compile_statements(body)?;
        let code = self.exit_scope()?;

        self.make_closure(code, flags, loc)?;
        self.apply_decorators(&def.decorators)?;
        self.compile_name(&def.name, ExprContext::Store, loc)
    }

    // ========================================================================
    // class
    // ========================================================================

    pub(super) fn compile_class_def(&mut self, class: &'a ClassDef, loc: Location) -> Result<()> {
        self.compile_decorators(&class.decorators)?;
        let firstlineno = class
            .decorators
            .first()
            .map_or(loc.line, |decorator| decorator.location.line);

        let scope = self.table.scope_for(class)?;
        self.enter_scope(&class.name, UnitKind::Class, scope, firstlineno)?;

        self.compile_name("__name__", ExprContext::Load, loc)?;
        self.compile_name("__module__", ExprContext::Store, loc)?;
        let qualname = Constant::str(&self.unit.qualname);
        self.emit_const(qualname, loc)?;
        self.compile_name("__qualname__", ExprContext::Store, loc)?;
        self.compile_body(&class.body)?;

        // The class body returns its `__class__` cell, or None.
        if self.symbols().needs_class_closure {
            let index = self.unit.deref_index("__class__")?;
            self.emit(PseudoOp::LoadClosure, index, Location::NONE)?;
            self.emit(Opcode::Copy, 1, Location::NONE)?;
            self.compile_name("__classcell__", ExprContext::Store, Location::NONE)?;
        } else {
            self.emit_const(Constant::None, Location::NONE)?;
        }
        self.emit(Opcode::ReturnValue, 0, Location::NONE)?;
        let code = self.exit_scope()?;

        self.emit(Opcode::PushNull, 0, loc)?;
        self.emit(Opcode::LoadBuildClass, 0, loc)?;
        self.make_closure(code, 0, loc)?;
        self.emit_const(Constant::str(&class.name), loc)?;
        self.call_helper(2, &class.bases, &class.keywords, loc)?;
        self.apply_decorators(&class.decorators)?;
        self.compile_name(&class.name, ExprContext::Store, loc)
    }

    // ========================================================================
    // lambda
    // ========================================================================

    pub(super) fn compile_lambda(
        &mut self,
        expr: &'a Expr,
        args: &'a Arguments,
        body: &'a Expr,
    ) -> Result<()> {
        let loc = expr.location;
        self.check_debug_args(args)?;
        let flags = self.compile_defaults(args, loc)?;

        let scope = self.table.scope_for(expr)?;
        self.enter_scope("<lambda>", UnitKind::Lambda, scope, loc.line)?;
        // None first, so a lambda never has a docstring.
        let none = self.cache.merge(Constant::None);
        self.unit.const_index(none)?;
        self.set_arg_counts(args)?;

        self.compile_expression(body)?;
        self.emit(
            Opcode::ReturnValue,
            0,
            Location::new(loc.line, 0, loc.line, 0),
        )?;
        let code = self.exit_scope()?;
        self.make_closure(code, flags, loc)
    }

    // ========================================================================
    // Comprehensions
    // ========================================================================

    /// Compiles a comprehension into its own function and calls it with the
    /// outermost iterator.
    pub(super) fn compile_comprehension(
        &mut self,
        expr: &'a Expr,
        kind: ComprehensionKind,
        generators: &'a [Comprehension],
        elt: &'a Expr,
        value: Option<&'a Expr>,
    ) -> Result<()> {
        let loc = expr.location;
        let Some(outermost) = generators.first() else {
            return Err(CompileError::internal("comprehension without generators"));
        };
        let scope = self.table.scope_for(expr)?;
        let is_async = self.table.scope(scope).is_coroutine;
        let parent_is_async = matches!(
            self.unit.kind,
            UnitKind::AsyncFunction | UnitKind::Comprehension
        );
        if is_async && kind != ComprehensionKind::Generator && !parent_is_async {
            return Err(self.error(
                "asynchronous comprehension outside of an asynchronous function",
                loc,
            ));
        }

        self.enter_scope(kind.scope_name(), UnitKind::Comprehension, scope, loc.line)?;
        let build = match kind {
            ComprehensionKind::List => Some(Opcode::BuildList),
            ComprehensionKind::Set => Some(Opcode::BuildSet),
            ComprehensionKind::Dict => Some(Opcode::BuildMap),
            ComprehensionKind::Generator => None,
        };
        if let Some(build) = build {
            self.emit(build, 0, loc)?;
        }
        let element = Element { kind, elt, value };
        self.comprehension_generator(generators, 0, 0, element, loc)?;
        if build.is_some() {
            self.emit(Opcode::ReturnValue, 0, loc)?;
        }
        let code = self.exit_scope()?;

        self.make_closure(code, 0, loc)?;
        self.compile_expression(&outermost.iter)?;
        let get_iter = if outermost.is_async {
            Opcode::GetAiter
        } else {
            Opcode::GetIter
        };
        self.emit(get_iter, 0, loc)?;
        self.emit(Opcode::Call, 0, loc)?;
        if is_async && kind != ComprehensionKind::Generator {
            self.emit(Opcode::GetAwaitable, 0, loc)?;
            self.emit_const(Constant::None, loc)?;
            self.add_yield_from(loc, true)?;
        }
        Ok(())
    }

    fn comprehension_generator(
        &mut self,
        generators: &'a [Comprehension],
        index: usize,
        depth: u32,
        element: Element<'a>,
        loc: Location,
    ) -> Result<()> {
        if generators[index].is_async {
            self.async_comprehension_generator(generators, index, depth, element, loc)
        } else {
            self.sync_comprehension_generator(generators, index, depth, element, loc)
        }
    }

    /// The outermost iterator arrives as the implicit argument `.0`.
    fn load_outermost_iter(&mut self, loc: Location) -> Result<()> {
        self.unit.argcount = 1;
        self.emit(Opcode::LoadFast, 0, loc)
    }

    fn sync_comprehension_generator(
        &mut self,
        generators: &'a [Comprehension],
        index: usize,
        mut depth: u32,
        element: Element<'a>,
        loc: Location,
    ) -> Result<()> {
        let generator = &generators[index];
        let mut start = Some(self.new_label());
        let if_cleanup = self.new_label();
        let anchor = self.new_label();

        if index == 0 {
            self.load_outermost_iter(loc)?;
        } else {
            // `for y in [expr]` binds without iterating.
            let single = match &generator.iter.kind {
                ExprKind::List(elts) | ExprKind::Tuple(elts) => match elts.as_slice() {
                    [only] if !only.is_starred() => Some(only),
                    _ => None,
                },
                _ => None,
            };
            match single {
                Some(only) => {
                    self.compile_expression(only)?;
                    start = None;
                }
                None => {
                    self.compile_expression(&generator.iter)?;
                    self.emit(Opcode::GetIter, 0, loc)?;
                }
            }
        }

        if let Some(start) = start {
            depth += 1;
            self.use_label(start)?;
            self.emit_jump(Opcode::ForIter, anchor, loc)?;
        }
        self.compile_target(&generator.target, ExprContext::Store)?;
        for condition in &generator.ifs {
            self.compile_jump_if(condition, if_cleanup, false)?;
        }

        let elt_loc = if index + 1 < generators.len() {
            self.comprehension_generator(generators, index + 1, depth, element, loc)?;
            element.elt.location
        } else {
            self.comprehension_element(element, depth)?
        };

        self.use_label(if_cleanup)?;
        if let Some(start) = start {
            self.emit_jump(PseudoOp::Jump, start, elt_loc)?;
            self.use_label(anchor)?;
        }
        Ok(())
    }

    fn async_comprehension_generator(
        &mut self,
        generators: &'a [Comprehension],
        index: usize,
        mut depth: u32,
        element: Element<'a>,
        loc: Location,
    ) -> Result<()> {
        let generator = &generators[index];
        let start = self.new_label();
        let except = self.new_label();
        let if_cleanup = self.new_label();

        if index == 0 {
            self.load_outermost_iter(loc)?;
        } else {
            self.compile_expression(&generator.iter)?;
            self.emit(Opcode::GetAiter, 0, loc)?;
        }

        self.use_label(start)?;
        self.push_fblock(FrameBlockKind::AsyncComprehensionGenerator, Some(start), None)?;
        self.emit_jump(PseudoOp::SetupFinally, except, loc)?;
        self.emit(Opcode::GetAnext, 0, loc)?;
        self.emit_const(Constant::None, loc)?;
        self.add_yield_from(loc, true)?;
        self.emit(PseudoOp::PopBlock, 0, loc)?;
        self.compile_target(&generator.target, ExprContext::Store)?;
        for condition in &generator.ifs {
            self.compile_jump_if(condition, if_cleanup, false)?;
        }

        depth += 1;
        let elt_loc = if index + 1 < generators.len() {
            self.comprehension_generator(generators, index + 1, depth, element, loc)?;
            element.elt.location
        } else {
            self.comprehension_element(element, depth)?
        };

        self.use_label(if_cleanup)?;
        self.emit_jump(PseudoOp::Jump, start, elt_loc)?;
        self.pop_fblock()?;

        self.use_label(except)?;
        self.emit(Opcode::EndAsyncFor, 0, loc)
    }

    /// Adds one element to the result (or yields it); returns the location
    /// used for the add.
    fn comprehension_element(&mut self, element: Element<'a>, depth: u32) -> Result<Location> {
        let elt = element.elt;
        let mut elt_loc = elt.location;
        self.compile_expression(elt)?;
        match element.kind {
            ComprehensionKind::Generator => {
                self.emit_yield(elt_loc)?;
                self.emit(Opcode::PopTop, 0, elt_loc)?;
            }
            ComprehensionKind::List => self.emit(Opcode::ListAppend, depth + 1, elt_loc)?,
            ComprehensionKind::Set => self.emit(Opcode::SetAdd, depth + 1, elt_loc)?,
            ComprehensionKind::Dict => {
                let value = element
                    .value
                    .ok_or_else(|| CompileError::internal("dict comprehension without a value"))?;
                self.compile_expression(value)?;
                let end = value.location;
                elt_loc = Location::new(elt_loc.line, elt_loc.col, end.end_line, end.end_col);
                self.emit(Opcode::MapAdd, depth + 1, elt_loc)?;
            }
        }
        Ok(elt_loc)
    }
}
