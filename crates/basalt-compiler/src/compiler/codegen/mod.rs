// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Code generator: lowers a scope-resolved AST into control-flow graphs.
//!
//! Each lexical scope becomes a [`CompilationUnit`] with its own graph and
//! tables. Nested scopes are compiled depth-first; a finished child is run
//! through the optimizer and assembler and embedded in its parent as a code
//! constant before the parent resumes.
//!
//! # Module Structure
//!
//! - `unit`: per-scope state (graph, constant and name tables)
//! - `fblock`: frame-block stack and unwind synthesis
//! - `statements`: statement lowering
//! - `expressions`: expression lowering, calls and the send loop
//! - `functions`: functions, lambdas, classes and comprehensions
//! - `patterns`: structural pattern matching

mod expressions;
mod fblock;
mod functions;
mod patterns;
mod statements;
mod unit;


pub use unit::UnitKind;

use tracing::{debug, warn};

use crate::ast::{Location, Module, Stmt, StmtKind};
use crate::compiler::assemble::{UnitMetadata, assemble};
use crate::compiler::cfg::{Cfg, Instr, Label};
use crate::compiler::code::{CodeFlags, CodeObject};
use crate::compiler::flowgraph::{PassConfig, UnitShape, optimize_code_unit};
use crate::compiler::opcode::{AnyOp, Intrinsic1, Opcode, PseudoOp};
use crate::config::{CompileOptions, FeatureFlags};
use crate::constant::{ConstCache, Constant};
use crate::error::{CompileError, CompileWarning, Result};
use crate::symtable::{Scope, ScopeId, SymbolFlags, SymbolScope, SymbolTable, mangle};

use unit::CompilationUnit;

/// Deepest static nesting of loops and protected regions.
pub(super) const MAX_FRAME_BLOCKS: usize = 20;

/// Above this many operands, literal displays and calls are built
/// incrementally instead of in one instruction.
pub(super) const STACK_USE_GUIDELINE: usize = 30;

/// How a name or target expression is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ExprContext {
    Load,
    Store,
    Delete,
}

/// The result of compiling a module.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// The module's code object; nested scopes hang off its constants
    pub code: CodeObject,
    /// Diagnostics that did not abort compilation
    pub warnings: Vec<CompileWarning>,
}

/// Where a name lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameAccess {
    Fast,
    Global,
    Deref,
    Name,
}

/// The code generator.
///
/// Holds the unit being compiled plus the stack of suspended parents.
pub struct Compiler<'a> {
    table: &'a SymbolTable,
    options: &'a CompileOptions,
    passes: PassConfig,
    unit: CompilationUnit<'a>,
    stack: Vec<CompilationUnit<'a>>,
    cache: ConstCache,
    warnings: Vec<CompileWarning>,
}

impl<'a> Compiler<'a> {
    /// Creates a compiler positioned at the module scope of `table`.
    pub fn new(table: &'a SymbolTable, options: &'a CompileOptions) -> Self {
        let mut unit = CompilationUnit::new(table.root(), UnitKind::Module, "<module>", 1);
        unit.flags = options.flags.code_flags();
        Self {
            table,
            options,
            passes: PassConfig::from_options(options),
            unit,
            stack: Vec::new(),
            cache: ConstCache::new(),
            warnings: Vec::new(),
        }
    }

    /// Compiles a module into its code object.
    ///
    /// `module` must be the tree the symbol table was built from.
    pub fn compile_module(mut self, module: &'a Module) -> Result<CompileOutput> {
        debug!(
            "compiling module {} ({} statements)",
            self.options.filename,
            module.body.len()
        );
        self.lower_module(module)?;

        let Compiler {
            unit,
            mut cache,
            passes,
            options,
            warnings,
            ..
        } = self;
        let code = assemble_unit(unit, &mut cache, &passes, &options.filename)?;
        debug!(
            "module {} done: {} constants cached, {} warnings",
            options.filename,
            cache.len(),
            warnings.len()
        );
        Ok(CompileOutput { code, warnings })
    }

    /// Emits the module body into the module unit.
    fn lower_module(&mut self, module: &'a Module) -> Result<()> {
        self.emit(Opcode::Resume, 0, Location::line_only(0))?;
        self.compile_body(&module.body)?;
        self.emit_const(Constant::None, Location::NONE)?;
        self.emit(Opcode::ReturnValue, 0, Location::NONE)
    }

    // ========================================================================
    // Emission helpers
    // ========================================================================

    pub(super) fn emit(&mut self, op: impl Into<AnyOp>, arg: u32, loc: Location) -> Result<()> {
        self.unit.cfg.addop(op, arg, loc)
    }

    pub(super) fn emit_op(&mut self, op: impl Into<AnyOp>, loc: Location) -> Result<()> {
        self.emit(op, 0, loc)
    }

    pub(super) fn emit_jump(
        &mut self,
        op: impl Into<AnyOp>,
        label: Label,
        loc: Location,
    ) -> Result<()> {
        self.unit.cfg.add_jump(op, label, loc)
    }

    pub(super) fn new_label(&mut self) -> Label {
        self.unit.cfg.new_label()
    }

    pub(super) fn use_label(&mut self, label: Label) -> Result<()> {
        self.unit.cfg.use_label(label)
    }

    /// `LOAD_CONST value`, sharing the value through the constant cache.
    pub(super) fn emit_const(&mut self, value: Constant, loc: Location) -> Result<()> {
        let value = self.cache.merge(value);
        let index = self.unit.const_index(value)?;
        self.emit(Opcode::LoadConst, index, loc)
    }

    /// An instruction whose operand indexes the names table.
    pub(super) fn emit_name_op(&mut self, op: Opcode, name: &str, loc: Location) -> Result<()> {
        let index = self.unit.name_index(name)?;
        self.emit(op, index, loc)
    }

    /// Like [`Compiler::emit_name_op`], after private-name mangling.
    pub(super) fn emit_mangled_name_op(
        &mut self,
        op: Opcode,
        name: &str,
        loc: Location,
    ) -> Result<()> {
        let mangled = mangle(self.unit.private.as_deref(), name).into_owned();
        self.emit_name_op(op, &mangled, loc)
    }

    // ========================================================================
    // Scopes
    // ========================================================================

    pub(super) fn symbols(&self) -> &'a Scope {
        let table = self.table;
        table.scope(self.unit.scope)
    }

    fn qualname_for(&self, name: &str, kind: UnitKind) -> String {
        let parent = &self.unit;
        if parent.kind == UnitKind::Module {
            return name.to_string();
        }
        if matches!(
            kind,
            UnitKind::Function | UnitKind::AsyncFunction | UnitKind::Class
        ) {
            let mangled = mangle(parent.private.as_deref(), name);
            let declared_global = self
                .symbols()
                .lookup(&mangled)
                .is_some_and(|s| s.scope == SymbolScope::GlobalExplicit);
            if declared_global {
                return name.to_string();
            }
        }
        match parent.kind {
            UnitKind::Function | UnitKind::AsyncFunction | UnitKind::Lambda => {
                format!("{}.<locals>.{}", parent.qualname, name)
            }
            _ => format!("{}.{}", parent.qualname, name),
        }
    }

    fn unit_flags(&self, scope: &Scope, kind: UnitKind) -> CodeFlags {
        let mut flags = self.options.flags.code_flags();
        if !kind.is_function_like() {
            return flags;
        }
        flags |= CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS;
        if scope.is_nested {
            flags |= CodeFlags::NESTED;
        }
        flags |= match (scope.is_generator, scope.is_coroutine) {
            (true, true) => CodeFlags::ASYNC_GENERATOR,
            (true, false) => CodeFlags::GENERATOR,
            (false, true) => CodeFlags::COROUTINE,
            (false, false) => CodeFlags::empty(),
        };
        flags
    }

    /// Suspends the current unit and starts a child for `scope`.
    pub(super) fn enter_scope(
        &mut self,
        name: &str,
        kind: UnitKind,
        scope: ScopeId,
        firstlineno: i32,
    ) -> Result<()> {
        let table = self.table;
        let symbols = table.scope(scope);
        let mut unit = CompilationUnit::new(scope, kind, name, firstlineno);
        for param in &symbols.params {
            unit.varnames.insert(param.clone());
        }
        if symbols.needs_class_closure {
            unit.cellvars.insert("__class__".to_string());
        }
        unit.cellvars.extend(symbols.names_with_scope(SymbolScope::Cell));
        unit.freevars.extend(symbols.free_vars());
        unit.private = if kind == UnitKind::Class {
            Some(name.to_string())
        } else {
            self.unit.private.clone()
        };
        unit.qualname = self.qualname_for(name, kind);
        unit.flags = self.unit_flags(symbols, kind);

        debug!("entering {} scope {}", kind, unit.qualname);
        let parent = std::mem::replace(&mut self.unit, unit);
        self.stack.push(parent);
        self.emit(
            Opcode::Resume,
            0,
            Location::new(firstlineno, 0, firstlineno, 0),
        )
    }

    fn needs_stop_iteration_handler(&self) -> bool {
        match self.unit.kind {
            UnitKind::Function | UnitKind::AsyncFunction => self.unit.is_generator_like(),
            UnitKind::Comprehension => self
                .unit
                .flags
                .intersects(CodeFlags::GENERATOR | CodeFlags::ASYNC_GENERATOR),
            _ => false,
        }
    }

    /// Converts a `StopIteration` escaping a generator body into a
    /// `RuntimeError`: the whole body runs under a cleanup handler.
    fn wrap_in_stop_iteration_handler(&mut self) -> Result<()> {
        let handler = self.new_label();
        let entry = self.unit.cfg.entry;
        self.unit.cfg.block_mut(entry).instrs.insert(
            0,
            Instr::new(PseudoOp::SetupCleanup, handler.0, Location::NONE),
        );
        self.emit_const(Constant::None, Location::NONE)?;
        self.emit(Opcode::ReturnValue, 0, Location::NONE)?;
        self.use_label(handler)?;
        self.emit(
            Opcode::CallIntrinsic1,
            Intrinsic1::StopIterationError as u32,
            Location::NONE,
        )?;
        self.emit(Opcode::Reraise, 1, Location::NONE)
    }

    /// Finishes the current unit and returns its assembled code object.
    pub(super) fn exit_scope(&mut self) -> Result<CodeObject> {
        if self.needs_stop_iteration_handler() {
            self.wrap_in_stop_iteration_handler()?;
        }
        self.emit_const(Constant::None, Location::NONE)?;
        self.emit(Opcode::ReturnValue, 0, Location::NONE)?;
        let parent = self
            .stack
            .pop()
            .ok_or_else(|| CompileError::internal("exit from the module scope"))?;
        let unit = std::mem::replace(&mut self.unit, parent);
        debug!("leaving {} scope {}", unit.kind, unit.qualname);
        assemble_unit(unit, &mut self.cache, &self.passes, &self.options.filename)
    }

    /// Statements of a module or class body.
    ///
    /// Bodies with annotated assignments start with `SETUP_ANNOTATIONS`; a
    /// leading string literal is stored into `__doc__`.
    pub(super) fn compile_body(&mut self, body: &'a [Stmt]) -> Result<()> {
        let loc = match (self.unit.kind, body.first()) {
            (UnitKind::Module, Some(first)) => first.location,
            _ => Location::NONE,
        };
        if find_annotations(body) && !self.defers_annotations() {
            self.emit_op(Opcode::SetupAnnotations, loc)?;
        }
        let mut rest = body;
        if !self.options.optimize.strips_asserts() {
            if let (Some(first), Some(doc)) = (body.first(), docstring(body)) {
                let loc = first.location;
                self.emit_const(doc.clone(), loc)?;
                self.compile_name("__doc__", ExprContext::Store, loc)?;
                rest = &body[1..];
            }
        }
        self.compile_statements(rest)
    }

    pub(super) fn compile_statements(&mut self, body: &'a [Stmt]) -> Result<()> {
        body.iter().try_for_each(|stmt| self.compile_statement(stmt))
    }

    pub(super) fn defers_annotations(&self) -> bool {
        self.options.flags.contains(FeatureFlags::ANNOTATIONS)
    }

    // ========================================================================
    // Names
    // ========================================================================

    fn name_access(&self, mangled: &str) -> NameAccess {
        let function_like = self.unit.kind.is_function_like();
        match self.symbols().lookup(mangled).map(|s| s.scope) {
            Some(SymbolScope::Free | SymbolScope::Cell) => NameAccess::Deref,
            Some(SymbolScope::Local) if function_like => NameAccess::Fast,
            Some(SymbolScope::GlobalImplicit) if function_like => NameAccess::Global,
            Some(SymbolScope::GlobalExplicit) => NameAccess::Global,
            _ => NameAccess::Name,
        }
    }

    /// Loads, stores or deletes a plain name.
    pub(super) fn compile_name(
        &mut self,
        name: &str,
        ctx: ExprContext,
        loc: Location,
    ) -> Result<()> {
        if name == "__debug__" {
            return match ctx {
                ExprContext::Load => {
                    let value = !self.options.optimize.strips_asserts();
                    self.emit_const(Constant::Bool(value), loc)
                }
                ExprContext::Store => Err(self.error("cannot assign to __debug__", loc)),
                ExprContext::Delete => Err(self.error("cannot delete __debug__", loc)),
            };
        }
        let mangled = mangle(self.unit.private.as_deref(), name).into_owned();
        match self.name_access(&mangled) {
            NameAccess::Fast => {
                let index = self.unit.varname_index(&mangled)?;
                let op = match ctx {
                    ExprContext::Load => Opcode::LoadFast,
                    ExprContext::Store => Opcode::StoreFast,
                    ExprContext::Delete => Opcode::DeleteFast,
                };
                self.emit(op, index, loc)
            }
            NameAccess::Global => {
                let index = self.unit.name_index(&mangled)?;
                match ctx {
                    ExprContext::Load => self.emit(Opcode::LoadGlobal, index << 1, loc),
                    ExprContext::Store => self.emit(Opcode::StoreGlobal, index, loc),
                    ExprContext::Delete => self.emit(Opcode::DeleteGlobal, index, loc),
                }
            }
            NameAccess::Deref => {
                let index = self.unit.deref_index(&mangled)?;
                let op = match ctx {
                    ExprContext::Load if self.unit.kind == UnitKind::Class => {
                        Opcode::LoadClassderef
                    }
                    ExprContext::Load => Opcode::LoadDeref,
                    ExprContext::Store => Opcode::StoreDeref,
                    ExprContext::Delete => Opcode::DeleteDeref,
                };
                self.emit(op, index, loc)
            }
            NameAccess::Name => {
                let op = match ctx {
                    ExprContext::Load => Opcode::LoadName,
                    ExprContext::Store => Opcode::StoreName,
                    ExprContext::Delete => Opcode::DeleteName,
                };
                self.emit_name_op(op, &mangled, loc)
            }
        }
    }

    /// Whether a module-level name was bound by an import.
    pub(super) fn is_import_originated(&self, name: &str) -> bool {
        self.table
            .scope(self.table.root())
            .lookup(name)
            .is_some_and(|s| s.flags.contains(SymbolFlags::DEF_IMPORT))
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub(super) fn error(&self, message: impl Into<String>, loc: Location) -> CompileError {
        CompileError::syntax(message, &self.options.filename, loc)
    }

    /// Records a warning, or fails when warnings are errors.
    pub(super) fn warn(&mut self, message: impl Into<String>, loc: Location) -> Result<()> {
        let warning = CompileWarning {
            message: message.into(),
            filename: self.options.filename.clone(),
            location: loc,
        };
        if self.options.warnings_as_errors {
            return Err(warning.into_error());
        }
        warn!("{}", warning);
        self.warnings.push(warning);
        Ok(())
    }
}

/// The docstring constant of a body, if it starts with a string literal.
pub(super) fn docstring(body: &[Stmt]) -> Option<&Constant> {
    match &body.first()?.kind {
        StmtKind::Expr(expr) => match expr.as_constant()? {
            value @ Constant::Str(_) => Some(value),
            _ => None,
        },
        _ => None,
    }
}

/// Whether any statement of the body, outside nested scopes, is an
/// annotated assignment.
fn find_annotations(body: &[Stmt]) -> bool {
    body.iter().any(|stmt| match &stmt.kind {
        StmtKind::AnnAssign { .. } => true,
        StmtKind::For { body, orelse, .. }
        | StmtKind::While { body, orelse, .. }
        | StmtKind::If { body, orelse, .. } => find_annotations(body) || find_annotations(orelse),
        StmtKind::With { body, .. } => find_annotations(body),
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            find_annotations(body)
                || handlers.iter().any(|h| find_annotations(&h.body))
                || find_annotations(orelse)
                || find_annotations(finalbody)
        }
        StmtKind::Match { cases, .. } => cases.iter().any(|c| find_annotations(&c.body)),
        _ => false,
    })
}

/// Optimizes and assembles a finished unit.
fn assemble_unit(
    unit: CompilationUnit<'_>,
    cache: &mut ConstCache,
    passes: &PassConfig,
    filename: &str,
) -> Result<CodeObject> {
    let (cfg, consts, meta) = optimize_unit(unit, cache, passes, filename)?;
    assemble(cfg, consts, &meta)
}

/// Runs the optimizer over a finished unit, leaving it ready to assemble.
fn optimize_unit(
    unit: CompilationUnit<'_>,
    cache: &mut ConstCache,
    passes: &PassConfig,
    filename: &str,
) -> Result<(Cfg, Vec<Constant>, UnitMetadata)> {
    let mut flags = unit.flags;
    if unit.cellvars.is_empty() && unit.freevars.is_empty() {
        flags |= CodeFlags::NOFREE;
    }
    let meta = UnitMetadata {
        name: unit.name,
        qualname: unit.qualname,
        filename: filename.to_string(),
        firstlineno: unit.firstlineno,
        argcount: unit.argcount,
        posonlyargcount: unit.posonlyargcount,
        kwonlyargcount: unit.kwonlyargcount,
        flags,
        names: unit.names.into_iter().collect(),
        varnames: unit.varnames.into_iter().collect(),
        cellvars: unit.cellvars.into_iter().collect(),
        freevars: unit.freevars.into_iter().collect(),
    };
    let mut cfg = unit.cfg;
    let mut consts: Vec<Constant> = unit.consts.into_iter().collect();
    let shape = UnitShape {
        nlocals: meta.varnames.len(),
        nparams: meta.nparams(),
        firstlineno: meta.firstlineno,
    };
    optimize_code_unit(&mut cfg, &mut consts, cache, shape, passes)?;
    Ok((cfg, consts, meta))
}
