// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Per-scope compilation state.

use std::fmt;
use std::hash::Hash;

use indexmap::IndexSet;

use crate::compiler::cfg::Cfg;
use crate::compiler::code::CodeFlags;
use crate::constant::Constant;
use crate::error::{CompileError, Result};
use crate::symtable::ScopeId;

use super::fblock::FrameBlock;

/// The kind of scope a compilation unit produces code for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// The module body
    Module,
    /// A class body
    Class,
    /// A `def`
    Function,
    /// An `async def`
    AsyncFunction,
    /// A `lambda`
    Lambda,
    /// A comprehension or generator expression
    Comprehension,
}

impl UnitKind {
    /// Whether locals of this unit live in fast slots.
    pub fn is_function_like(self) -> bool {
        !matches!(self, UnitKind::Module | UnitKind::Class)
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitKind::Module => "module",
            UnitKind::Class => "class",
            UnitKind::Function => "function",
            UnitKind::AsyncFunction => "async function",
            UnitKind::Lambda => "lambda",
            UnitKind::Comprehension => "comprehension",
        };
        f.write_str(name)
    }
}

/// Everything the code generator tracks while one scope is being lowered.
pub(super) struct CompilationUnit<'a> {
    pub scope: ScopeId,
    pub kind: UnitKind,
    pub name: String,
    pub qualname: String,
    /// Enclosing class name, for private-name mangling
    pub private: Option<String>,
    pub firstlineno: i32,
    pub cfg: Cfg,
    pub consts: IndexSet<Constant>,
    pub names: IndexSet<String>,
    /// Parameters first, then locals in first-use order
    pub varnames: IndexSet<String>,
    pub cellvars: IndexSet<String>,
    pub freevars: IndexSet<String>,
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    pub flags: CodeFlags,
    pub fblocks: Vec<FrameBlock<'a>>,
}

fn slot<T: Hash + Eq>(set: &mut IndexSet<T>, value: T, what: &str) -> Result<u32> {
    let (index, _) = set.insert_full(value);
    u32::try_from(index).map_err(|_| CompileError::overflow(format!("too many {what}")))
}

impl<'a> CompilationUnit<'a> {
    pub fn new(scope: ScopeId, kind: UnitKind, name: &str, firstlineno: i32) -> Self {
        Self {
            scope,
            kind,
            name: name.to_string(),
            qualname: name.to_string(),
            private: None,
            firstlineno,
            cfg: Cfg::new(),
            consts: IndexSet::new(),
            names: IndexSet::new(),
            varnames: IndexSet::new(),
            cellvars: IndexSet::new(),
            freevars: IndexSet::new(),
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            flags: CodeFlags::empty(),
            fblocks: Vec::new(),
        }
    }

    /// Index of a constant, appending it on first use.
    pub fn const_index(&mut self, value: Constant) -> Result<u32> {
        slot(&mut self.consts, value, "constants")
    }

    /// Index of a global, attribute or import name.
    pub fn name_index(&mut self, name: &str) -> Result<u32> {
        slot(&mut self.names, name.to_string(), "names")
    }

    /// Index of a fast local.
    pub fn varname_index(&mut self, name: &str) -> Result<u32> {
        slot(&mut self.varnames, name.to_string(), "local variables")
    }

    /// Deref operand of a cell or free variable: cells first, then frees.
    pub fn deref_index(&self, name: &str) -> Result<u32> {
        let index = match self.cellvars.get_index_of(name) {
            Some(i) => i,
            None => self
                .freevars
                .get_index_of(name)
                .map(|i| i + self.cellvars.len())
                .ok_or_else(|| {
                    CompileError::internal(format!(
                        "'{name}' is neither a cell nor a free variable of {}",
                        self.qualname
                    ))
                })?,
        };
        u32::try_from(index).map_err(|_| CompileError::overflow("too many closure variables"))
    }

    /// Whether the unit runs as a generator, coroutine or async generator.
    pub fn is_generator_like(&self) -> bool {
        self.flags
            .intersects(CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR)
    }

    /// Whether `yield` values need async-generator wrapping.
    pub fn is_async_generator(&self) -> bool {
        self.flags.contains(CodeFlags::ASYNC_GENERATOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_stable() {
        let mut unit = CompilationUnit::new(0, UnitKind::Module, "<module>", 1);
        assert_eq!(unit.name_index("a").unwrap(), 0);
        assert_eq!(unit.name_index("b").unwrap(), 1);
        assert_eq!(unit.name_index("a").unwrap(), 0);
        assert_eq!(unit.const_index(Constant::None).unwrap(), 0);
        assert_eq!(unit.const_index(Constant::from(1)).unwrap(), 1);
        assert_eq!(unit.const_index(Constant::None).unwrap(), 0);
    }

    #[test]
    fn test_deref_index_counts_cells_first() {
        let mut unit = CompilationUnit::new(0, UnitKind::Function, "f", 1);
        unit.cellvars.insert("x".to_string());
        unit.cellvars.insert("y".to_string());
        unit.freevars.insert("z".to_string());
        assert_eq!(unit.deref_index("y").unwrap(), 1);
        assert_eq!(unit.deref_index("z").unwrap(), 2);
        assert!(unit.deref_index("w").is_err());
    }

    #[test]
    fn test_function_like_kinds() {
        assert!(!UnitKind::Module.is_function_like());
        assert!(!UnitKind::Class.is_function_like());
        assert!(UnitKind::Lambda.is_function_like());
        assert!(UnitKind::Comprehension.is_function_like());
    }
}
