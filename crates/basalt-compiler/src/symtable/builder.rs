// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Symbol collection and scope analysis.

use rustc_hash::{FxHashMap, FxHashSet};

use super::{
    Scope, ScopeId, ScopeKind, Symbol, SymbolFlags, SymbolScope, SymbolTable, mangle, node_key,
};
use crate::ast::*;
use crate::error::{CompileError, Result};

pub(super) fn build(module: &Module, filename: &str) -> Result<SymbolTable> {
    let mut builder = Builder {
        scopes: vec![Scope::new("top", ScopeKind::Module, Location::NONE, None)],
        by_node: FxHashMap::default(),
        current: 0,
        private: None,
        filename,
    };
    for stmt in &module.body {
        builder.visit_stmt(stmt)?;
    }
    let mut table = SymbolTable {
        scopes: builder.scopes,
        by_node: builder.by_node,
    };
    analyze_scope(
        &mut table,
        0,
        &FxHashSet::default(),
        &FxHashSet::default(),
        filename,
    )?;
    Ok(table)
}

struct Builder<'a> {
    scopes: Vec<Scope>,
    by_node: FxHashMap<usize, ScopeId>,
    current: ScopeId,
    private: Option<String>,
    filename: &'a str,
}

impl Builder<'_> {
    fn error(&self, message: String, location: Location) -> CompileError {
        CompileError::syntax(message, self.filename, location)
    }

    fn scope(&mut self) -> &mut Scope {
        &mut self.scopes[self.current]
    }

    fn enter(&mut self, name: &str, kind: ScopeKind, location: Location, key: usize) {
        let parent = self.current;
        let id = self.scopes.len();
        let mut scope = Scope::new(name, kind, location, Some(parent));
        let outer = &self.scopes[parent];
        scope.is_nested = outer.is_nested || outer.kind == ScopeKind::Function;
        self.scopes.push(scope);
        self.scopes[parent].children.push(id);
        self.by_node.insert(key, id);
        self.current = id;
    }

    fn exit(&mut self) {
        if let Some(parent) = self.scopes[self.current].parent {
            self.current = parent;
        }
    }

    fn add_def(&mut self, name: &str, flag: SymbolFlags, location: Location) -> Result<()> {
        self.add_def_in(self.current, name, flag, location)
    }

    fn add_def_in(
        &mut self,
        id: ScopeId,
        name: &str,
        flag: SymbolFlags,
        location: Location,
    ) -> Result<()> {
        let mangled = mangle(self.private.as_deref(), name).into_owned();
        let scope = &mut self.scopes[id];
        let symbol = scope
            .symbols
            .entry(mangled.clone())
            .or_insert_with(|| Symbol {
                name: mangled.clone(),
                scope: SymbolScope::GlobalImplicit,
                flags: SymbolFlags::empty(),
                location,
            });
        if flag.contains(SymbolFlags::DEF_PARAM) && symbol.flags.contains(SymbolFlags::DEF_PARAM) {
            return Err(CompileError::syntax(
                format!("duplicate argument '{name}' in function definition"),
                self.filename,
                location,
            ));
        }
        symbol.flags |= flag;
        if flag.contains(SymbolFlags::DEF_PARAM) {
            scope.params.push(mangled);
        }
        Ok(())
    }

    fn visit_body(&mut self, body: &[Stmt]) -> Result<()> {
        body.iter().try_for_each(|stmt| self.visit_stmt(stmt))
    }

    fn visit_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let loc = stmt.location;
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                self.add_def(&def.name, SymbolFlags::DEF_LOCAL, loc)?;
                self.visit_arguments_outer(&def.args)?;
                if let Some(returns) = &def.returns {
                    self.visit_expr(returns)?;
                }
                for decorator in &def.decorators {
                    self.visit_expr(decorator)?;
                }
                self.enter(&def.name, ScopeKind::Function, loc, node_key(def));
                self.scope().is_coroutine = def.is_async;
                self.visit_params(&def.args)?;
                self.visit_body(&def.body)?;
                self.exit();
            }
            StmtKind::ClassDef(class) => {
                self.add_def(&class.name, SymbolFlags::DEF_LOCAL, loc)?;
                for base in &class.bases {
                    self.visit_expr(base)?;
                }
                for keyword in &class.keywords {
                    self.visit_expr(&keyword.value)?;
                }
                for decorator in &class.decorators {
                    self.visit_expr(decorator)?;
                }
                self.enter(&class.name, ScopeKind::Class, loc, node_key(class));
                let saved = self.private.replace(class.name.clone());
                self.visit_body(&class.body)?;
                self.private = saved;
                self.exit();
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.visit_target(target)?;
                }
            }
            StmtKind::Assign { targets, value } => {
                self.visit_expr(value)?;
                for target in targets {
                    self.visit_target(target)?;
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                if let ExprKind::Name(id) = &target.kind {
                    self.add_def(id, SymbolFlags::USE | SymbolFlags::DEF_LOCAL, target.location)?;
                } else {
                    self.visit_target(target)?;
                }
                self.visit_expr(value)?;
            }
            StmtKind::AnnAssign {
                target,
                annotation,
                value,
                simple,
            } => {
                if let ExprKind::Name(id) = &target.kind {
                    if *simple {
                        let mangled = mangle(self.private.as_deref(), id).into_owned();
                        if let Some(symbol) = self.scope().symbols.get(&mangled) {
                            if symbol
                                .flags
                                .intersects(SymbolFlags::DEF_GLOBAL | SymbolFlags::DEF_NONLOCAL)
                            {
                                let kind = if symbol.flags.contains(SymbolFlags::DEF_GLOBAL) {
                                    "global"
                                } else {
                                    "nonlocal"
                                };
                                return Err(self.error(
                                    format!("annotated name '{id}' can't be {kind}"),
                                    target.location,
                                ));
                            }
                        }
                        self.add_def(
                            id,
                            SymbolFlags::DEF_ANNOT | SymbolFlags::DEF_LOCAL,
                            target.location,
                        )?;
                    } else if value.is_some() {
                        self.add_def(id, SymbolFlags::DEF_LOCAL, target.location)?;
                    }
                } else {
                    self.visit_target(target)?;
                }
                self.visit_expr(annotation)?;
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
                ..
            } => {
                self.visit_target(target)?;
                self.visit_expr(iter)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }
            StmtKind::While { test, body, orelse } | StmtKind::If { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }
            StmtKind::With { items, body, .. } => {
                for item in items {
                    self.visit_expr(&item.context_expr)?;
                    if let Some(vars) = &item.optional_vars {
                        self.visit_target(vars)?;
                    }
                }
                self.visit_body(body)?;
            }
            StmtKind::Match { subject, cases } => {
                self.visit_expr(subject)?;
                for case in cases {
                    self.visit_pattern(&case.pattern)?;
                    if let Some(guard) = &case.guard {
                        self.visit_expr(guard)?;
                    }
                    self.visit_body(&case.body)?;
                }
            }
            StmtKind::Raise { exc, cause } => {
                if let Some(exc) = exc {
                    self.visit_expr(exc)?;
                }
                if let Some(cause) = cause {
                    self.visit_expr(cause)?;
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.visit_body(body)?;
                for handler in handlers {
                    if let Some(typ) = &handler.typ {
                        self.visit_expr(typ)?;
                    }
                    if let Some(name) = &handler.name {
                        self.add_def(name, SymbolFlags::DEF_LOCAL, handler.location)?;
                    }
                    self.visit_body(&handler.body)?;
                }
                self.visit_body(orelse)?;
                self.visit_body(finalbody)?;
            }
            StmtKind::Assert { test, msg } => {
                self.visit_expr(test)?;
                if let Some(msg) = msg {
                    self.visit_expr(msg)?;
                }
            }
            StmtKind::Import(names) => {
                for alias in names {
                    let bound = alias
                        .asname
                        .as_deref()
                        .unwrap_or_else(|| alias.name.split('.').next().unwrap_or(&alias.name));
                    self.add_def(bound, SymbolFlags::DEF_IMPORT, alias.location)?;
                }
            }
            StmtKind::ImportFrom { names, .. } => {
                for alias in names {
                    if alias.name == "*" {
                        if self.scopes[self.current].kind != ScopeKind::Module {
                            return Err(self.error(
                                "import * only allowed at module level".to_string(),
                                alias.location,
                            ));
                        }
                        continue;
                    }
                    let bound = alias.asname.as_deref().unwrap_or(&alias.name);
                    self.add_def(bound, SymbolFlags::DEF_IMPORT, alias.location)?;
                }
            }
            StmtKind::Global(names) => {
                for name in names {
                    self.check_declaration(name, "global", loc)?;
                    self.add_def(name, SymbolFlags::DEF_GLOBAL, loc)?;
                }
            }
            StmtKind::Nonlocal(names) => {
                if self.scopes[self.current].kind == ScopeKind::Module {
                    return Err(self.error(
                        "nonlocal declaration not allowed at module level".to_string(),
                        loc,
                    ));
                }
                for name in names {
                    self.check_declaration(name, "nonlocal", loc)?;
                    self.add_def(name, SymbolFlags::DEF_NONLOCAL, loc)?;
                }
            }
            StmtKind::Expr(value) => self.visit_expr(value)?,
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
        }
        Ok(())
    }

    fn check_declaration(&mut self, name: &str, kind: &str, location: Location) -> Result<()> {
        let mangled = mangle(self.private.as_deref(), name).into_owned();
        let Some(symbol) = self.scopes[self.current].symbols.get(&mangled) else {
            return Ok(());
        };
        let flags = symbol.flags;
        let message = if flags.contains(SymbolFlags::DEF_PARAM) {
            format!("name '{name}' is parameter and {kind}")
        } else if flags.contains(SymbolFlags::USE) {
            format!("name '{name}' is used prior to {kind} declaration")
        } else if flags.contains(SymbolFlags::DEF_ANNOT) {
            format!("annotated name '{name}' can't be {kind}")
        } else if flags.intersects(SymbolFlags::DEF_LOCAL | SymbolFlags::DEF_IMPORT) {
            format!("name '{name}' is assigned to before {kind} declaration")
        } else {
            return Ok(());
        };
        Err(self.error(message, location))
    }

    /// Defaults and annotations, evaluated in the defining scope.
    fn visit_arguments_outer(&mut self, args: &Arguments) -> Result<()> {
        for default in &args.defaults {
            self.visit_expr(default)?;
        }
        for default in args.kw_defaults.iter().flatten() {
            self.visit_expr(default)?;
        }
        for arg in args.all() {
            if let Some(annotation) = &arg.annotation {
                self.visit_expr(annotation)?;
            }
        }
        Ok(())
    }

    fn visit_params(&mut self, args: &Arguments) -> Result<()> {
        for arg in args.all() {
            self.add_def(&arg.name, SymbolFlags::DEF_PARAM, arg.location)?;
        }
        Ok(())
    }

    fn visit_target(&mut self, target: &Expr) -> Result<()> {
        match &target.kind {
            ExprKind::Name(id) => self.add_def(id, SymbolFlags::DEF_LOCAL, target.location),
            ExprKind::Tuple(elts) | ExprKind::List(elts) => {
                elts.iter().try_for_each(|elt| self.visit_target(elt))
            }
            ExprKind::Starred(value) => self.visit_target(value),
            _ => self.visit_expr(target),
        }
    }

    fn visit_pattern(&mut self, pattern: &Pattern) -> Result<()> {
        let loc = pattern.location;
        match &pattern.kind {
            PatternKind::MatchValue(value) => self.visit_expr(value)?,
            PatternKind::MatchSingleton(_) => {}
            PatternKind::MatchSequence(patterns) | PatternKind::MatchOr(patterns) => {
                for p in patterns {
                    self.visit_pattern(p)?;
                }
            }
            PatternKind::MatchMapping {
                keys,
                patterns,
                rest,
            } => {
                for key in keys {
                    self.visit_expr(key)?;
                }
                for p in patterns {
                    self.visit_pattern(p)?;
                }
                if let Some(rest) = rest {
                    self.add_def(rest, SymbolFlags::DEF_LOCAL, loc)?;
                }
            }
            PatternKind::MatchClass {
                cls,
                patterns,
                kwd_patterns,
                ..
            } => {
                self.visit_expr(cls)?;
                for p in patterns.iter().chain(kwd_patterns) {
                    self.visit_pattern(p)?;
                }
            }
            PatternKind::MatchStar(name) => {
                if let Some(name) = name {
                    self.add_def(name, SymbolFlags::DEF_LOCAL, loc)?;
                }
            }
            PatternKind::MatchAs { pattern, name } => {
                if let Some(pattern) = pattern {
                    self.visit_pattern(pattern)?;
                }
                if let Some(name) = name {
                    self.add_def(name, SymbolFlags::DEF_LOCAL, loc)?;
                }
            }
        }
        Ok(())
    }

    fn visit_exprs(&mut self, exprs: &[Expr]) -> Result<()> {
        exprs.iter().try_for_each(|e| self.visit_expr(e))
    }

    fn visit_expr(&mut self, expr: &Expr) -> Result<()> {
        let loc = expr.location;
        match &expr.kind {
            ExprKind::Name(id) => {
                self.add_def(id, SymbolFlags::USE, loc)?;
                if id == "super" && self.scopes[self.current].kind == ScopeKind::Function {
                    self.add_def("__class__", SymbolFlags::USE, loc)?;
                }
            }
            ExprKind::BoolOp { values, .. } => self.visit_exprs(values)?,
            ExprKind::NamedExpr { target, value } => {
                self.visit_expr(value)?;
                let ExprKind::Name(id) = &target.kind else {
                    return Err(self.error(
                        "cannot use assignment expressions with this target".to_string(),
                        target.location,
                    ));
                };
                self.visit_named_target(id, target.location)?;
            }
            ExprKind::BinOp { left, right, .. } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
            }
            ExprKind::UnaryOp { operand, .. } => self.visit_expr(operand)?,
            ExprKind::Lambda { args, body } => {
                self.visit_arguments_outer(args)?;
                self.enter("<lambda>", ScopeKind::Function, loc, node_key(expr));
                self.visit_params(args)?;
                self.visit_expr(body)?;
                self.exit();
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_expr(body)?;
                self.visit_expr(orelse)?;
            }
            ExprKind::Dict { keys, values } => {
                for key in keys.iter().flatten() {
                    self.visit_expr(key)?;
                }
                self.visit_exprs(values)?;
            }
            ExprKind::Set(elts) | ExprKind::List(elts) | ExprKind::Tuple(elts) => {
                self.visit_exprs(elts)?
            }
            ExprKind::ListComp { elt, generators } => {
                self.visit_comprehension(expr, "<listcomp>", generators, &[elt], false)?
            }
            ExprKind::SetComp { elt, generators } => {
                self.visit_comprehension(expr, "<setcomp>", generators, &[elt], false)?
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => self.visit_comprehension(expr, "<dictcomp>", generators, &[key, value], false)?,
            ExprKind::GeneratorExp { elt, generators } => {
                self.visit_comprehension(expr, "<genexpr>", generators, &[elt], true)?
            }
            ExprKind::Await(value) => {
                self.visit_expr(value)?;
                let scope = self.scope();
                if scope.is_comprehension {
                    scope.is_coroutine = true;
                }
            }
            ExprKind::Yield(value) => {
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
                self.mark_generator(loc)?;
            }
            ExprKind::YieldFrom(value) => {
                self.visit_expr(value)?;
                self.mark_generator(loc)?;
            }
            ExprKind::Compare {
                left, comparators, ..
            } => {
                self.visit_expr(left)?;
                self.visit_exprs(comparators)?;
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                self.visit_expr(func)?;
                self.visit_exprs(args)?;
                for keyword in keywords {
                    self.visit_expr(&keyword.value)?;
                }
            }
            ExprKind::FormattedValue {
                value, format_spec, ..
            } => {
                self.visit_expr(value)?;
                if let Some(spec) = format_spec {
                    self.visit_expr(spec)?;
                }
            }
            ExprKind::JoinedStr(values) => self.visit_exprs(values)?,
            ExprKind::Constant(_) => {}
            ExprKind::Attribute { value, .. } | ExprKind::Starred(value) => self.visit_expr(value)?,
            ExprKind::Subscript { value, slice } => {
                self.visit_expr(value)?;
                self.visit_expr(slice)?;
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.visit_expr(part)?;
                }
            }
        }
        Ok(())
    }

    fn mark_generator(&mut self, location: Location) -> Result<()> {
        let scope = &self.scopes[self.current];
        if scope.is_comprehension {
            let what = if scope.is_generator {
                "generator expression"
            } else {
                "comprehension"
            };
            return Err(self.error(format!("'yield' inside {what}"), location));
        }
        if scope.kind == ScopeKind::Function {
            self.scope().is_generator = true;
        }
        Ok(())
    }

    /// Binds the target of `:=`, which escapes enclosing comprehensions.
    fn visit_named_target(&mut self, name: &str, location: Location) -> Result<()> {
        if !self.scopes[self.current].is_comprehension {
            return self.add_def(name, SymbolFlags::DEF_LOCAL, location);
        }
        let mut owner = self.current;
        while self.scopes[owner].is_comprehension {
            match self.scopes[owner].parent {
                Some(parent) => owner = parent,
                None => break,
            }
        }
        match self.scopes[owner].kind {
            ScopeKind::Class => Err(self.error(
                "assignment expression within a comprehension cannot be used in a class body"
                    .to_string(),
                location,
            )),
            ScopeKind::Function => {
                self.add_def(name, SymbolFlags::DEF_NONLOCAL, location)?;
                self.add_def_in(owner, name, SymbolFlags::DEF_LOCAL, location)
            }
            ScopeKind::Module => {
                self.add_def(name, SymbolFlags::DEF_GLOBAL, location)?;
                self.add_def_in(owner, name, SymbolFlags::DEF_GLOBAL, location)
            }
        }
    }

    fn visit_comprehension(
        &mut self,
        expr: &Expr,
        name: &str,
        generators: &[Comprehension],
        elements: &[&Expr],
        is_generator: bool,
    ) -> Result<()> {
        let Some(first) = generators.first() else {
            return Err(CompileError::internal("comprehension without generators"));
        };
        self.visit_expr(&first.iter)?;
        self.enter(name, ScopeKind::Function, expr.location, node_key(expr));
        {
            let scope = self.scope();
            scope.is_comprehension = true;
            scope.is_generator = is_generator;
            scope.is_coroutine = generators.iter().any(|g| g.is_async);
        }
        self.add_def(".0", SymbolFlags::DEF_PARAM, expr.location)?;
        self.visit_target(&first.target)?;
        self.visit_exprs(&first.ifs)?;
        for generator in &generators[1..] {
            self.visit_expr(&generator.iter)?;
            self.visit_target(&generator.target)?;
            self.visit_exprs(&generator.ifs)?;
        }
        for element in elements {
            self.visit_expr(element)?;
        }
        self.exit();
        Ok(())
    }
}

/// Resolves every symbol of `id` and its children; returns the names the
/// scope needs from its enclosing scopes.
fn analyze_scope(
    table: &mut SymbolTable,
    id: ScopeId,
    bound: &FxHashSet<String>,
    global: &FxHashSet<String>,
    filename: &str,
) -> Result<FxHashSet<String>> {
    let kind = table.scopes[id].kind;
    let mut local = FxHashSet::default();
    let mut free = FxHashSet::default();
    let mut new_global = global.clone();

    for symbol in table.scopes[id].symbols.values_mut() {
        let flags = symbol.flags;
        let name = symbol.name.clone();
        symbol.scope = if flags.contains(SymbolFlags::DEF_GLOBAL) {
            if flags.contains(SymbolFlags::DEF_NONLOCAL) {
                return Err(CompileError::syntax(
                    format!("name '{name}' is nonlocal and global"),
                    filename,
                    symbol.location,
                ));
            }
            new_global.insert(name);
            SymbolScope::GlobalExplicit
        } else if flags.contains(SymbolFlags::DEF_NONLOCAL) {
            if !bound.contains(&name) {
                return Err(CompileError::syntax(
                    format!("no binding for nonlocal '{name}' found"),
                    filename,
                    symbol.location,
                ));
            }
            free.insert(name);
            SymbolScope::Free
        } else if flags.intersects(SymbolFlags::DEF_BOUND) {
            new_global.remove(&name);
            local.insert(name);
            SymbolScope::Local
        } else if bound.contains(&name) {
            free.insert(name);
            SymbolScope::Free
        } else {
            SymbolScope::GlobalImplicit
        };
    }

    let mut child_bound: FxHashSet<String> = bound.clone();
    let child_global = match kind {
        ScopeKind::Class => {
            child_bound.insert("__class__".to_string());
            global.clone()
        }
        ScopeKind::Function => {
            child_bound.extend(local.iter().cloned());
            new_global
        }
        ScopeKind::Module => new_global,
    };

    let mut child_free = FxHashSet::default();
    let children = table.scopes[id].children.clone();
    for child in children {
        child_free.extend(analyze_scope(table, child, &child_bound, &child_global, filename)?);
    }

    let scope = &mut table.scopes[id];
    match kind {
        ScopeKind::Function => {
            for name in &local {
                if child_free.remove(name) {
                    if let Some(symbol) = scope.symbols.get_mut(name) {
                        symbol.scope = SymbolScope::Cell;
                    }
                }
            }
        }
        ScopeKind::Class => {
            if child_free.remove("__class__") {
                scope.needs_class_closure = true;
            }
        }
        ScopeKind::Module => {}
    }

    for name in &child_free {
        if let Some(symbol) = scope.symbols.get_mut(name) {
            if kind == ScopeKind::Class
                && symbol
                    .flags
                    .intersects(SymbolFlags::DEF_BOUND | SymbolFlags::DEF_GLOBAL)
            {
                symbol.flags |= SymbolFlags::DEF_FREE_CLASS;
            }
            continue;
        }
        if !bound.contains(name) {
            continue;
        }
        scope.symbols.insert(
            name.clone(),
            Symbol {
                name: name.clone(),
                scope: SymbolScope::Free,
                flags: SymbolFlags::empty(),
                location: scope.location,
            },
        );
    }
    free.extend(child_free);
    Ok(free)
}
