// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Scope-resolved symbol tables.
//!
//! The code generator treats a [`SymbolTable`] as a read-only service: each
//! lexical scope is looked up by the address of the AST node that introduces
//! it, and each name in it has been classified as local, cell, free, or
//! global before any code is emitted.
//!
//! [`SymbolTable::build`] is a reference builder. It runs in two passes: a
//! visitor records how every name is used, then an analysis pass walks the
//! scope tree top-down with the set of names bound in enclosing function
//! scopes and bottom-up with the set of names children need as free variables.

mod builder;

use std::borrow::Cow;

use bitflags::bitflags;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::ast::{Location, Module};
use crate::error::{CompileError, Result};

/// Index of a scope inside a [`SymbolTable`].
pub type ScopeId = usize;

/// The kind of block a scope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// The module body
    Module,
    /// A class body
    Class,
    /// A function, lambda, or comprehension
    Function,
}

/// How a name resolves inside one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    /// Bound in this scope
    Local,
    /// Bound here and captured by a nested scope
    Cell,
    /// Bound in an enclosing function scope
    Free,
    /// Declared `global`
    GlobalExplicit,
    /// Not bound anywhere visible; looked up in globals
    GlobalImplicit,
}

bitflags! {
    /// How a name is used within one scope.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct SymbolFlags: u16 {
        /// Declared `global`
        const DEF_GLOBAL = 1;
        /// Assigned in this scope
        const DEF_LOCAL = 1 << 1;
        /// A parameter
        const DEF_PARAM = 1 << 2;
        /// Declared `nonlocal`
        const DEF_NONLOCAL = 1 << 3;
        /// Read in this scope
        const USE = 1 << 4;
        /// Free in a nested scope while bound in this class body
        const DEF_FREE_CLASS = 1 << 5;
        /// Bound by an import
        const DEF_IMPORT = 1 << 6;
        /// Has an annotation
        const DEF_ANNOT = 1 << 7;
        /// Any binding
        const DEF_BOUND = Self::DEF_LOCAL.bits() | Self::DEF_PARAM.bits() | Self::DEF_IMPORT.bits();
    }
}

/// One name in one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// The (mangled) name
    pub name: String,
    /// Resolution after analysis
    pub scope: SymbolScope,
    /// Usage flags
    pub flags: SymbolFlags,
    /// First place the name was seen
    pub location: Location,
}

/// One lexical scope.
#[derive(Debug, Clone)]
pub struct Scope {
    /// Scope name (`top`, function or class name, `<lambda>`, `<listcomp>`...)
    pub name: String,
    /// Block kind
    pub kind: ScopeKind,
    /// Where the scope starts
    pub location: Location,
    /// Symbols in first-seen order
    pub symbols: IndexMap<String, Symbol>,
    /// Parameter names in slot order
    pub params: Vec<String>,
    /// Child scopes in visit order
    pub children: Vec<ScopeId>,
    /// Enclosing scope
    pub parent: Option<ScopeId>,
    /// Contains `yield` (or is a generator expression)
    pub is_generator: bool,
    /// `async def` or an asynchronous comprehension
    pub is_coroutine: bool,
    /// A comprehension or generator expression
    pub is_comprehension: bool,
    /// Nested inside a function
    pub is_nested: bool,
    /// A class body that must provide a `__class__` cell
    pub needs_class_closure: bool,
}

impl Scope {
    fn new(name: &str, kind: ScopeKind, location: Location, parent: Option<ScopeId>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            location,
            symbols: IndexMap::new(),
            params: Vec::new(),
            children: Vec::new(),
            parent,
            is_generator: false,
            is_coroutine: false,
            is_comprehension: false,
            is_nested: false,
            needs_class_closure: false,
        }
    }

    /// Looks a symbol up by its (already mangled) name.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Whether locals live in fast slots.
    pub fn is_function_like(&self) -> bool {
        self.kind == ScopeKind::Function
    }

    /// Names of the given resolution, sorted.
    pub fn names_with_scope(&self, scope: SymbolScope) -> Vec<String> {
        let mut names: Vec<String> = self
            .symbols
            .values()
            .filter(|s| s.scope == scope)
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Free variables, including class-body names captured through the class.
    pub fn free_vars(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .symbols
            .values()
            .filter(|s| {
                s.scope == SymbolScope::Free || s.flags.contains(SymbolFlags::DEF_FREE_CLASS)
            })
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }
}

/// All scopes of one module.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    by_node: FxHashMap<usize, ScopeId>,
}

impl SymbolTable {
    /// Builds and analyzes the table for a module.
    ///
    /// The AST must not move between this call and code generation; scopes
    /// are keyed by node address.
    pub fn build(module: &Module, filename: &str) -> Result<Self> {
        builder::build(module, filename)
    }

    /// The module scope.
    pub fn root(&self) -> ScopeId {
        0
    }

    /// Access a scope by id.
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    /// Number of scopes.
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Whether the table is empty (never true for a built table).
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// The scope introduced by `node`.
    pub fn scope_for<T>(&self, node: &T) -> Result<ScopeId> {
        self.by_node
            .get(&node_key(node))
            .copied()
            .ok_or_else(|| CompileError::internal("no symbol table entry for scope node"))
    }
}

pub(crate) fn node_key<T>(node: &T) -> usize {
    node as *const T as usize
}

/// Applies private-name mangling (`__x` inside class `C` becomes `_C__x`).
pub fn mangle<'a>(private: Option<&str>, name: &'a str) -> Cow<'a, str> {
    let Some(class_name) = private else {
        return Cow::Borrowed(name);
    };
    if !name.starts_with("__") || name.ends_with("__") || name.contains('.') {
        return Cow::Borrowed(name);
    }
    let stripped = class_name.trim_start_matches('_');
    if stripped.is_empty() {
        return Cow::Borrowed(name);
    }
    Cow::Owned(format!("_{stripped}{name}"))
}

#[cfg(test)]
mod tests;
