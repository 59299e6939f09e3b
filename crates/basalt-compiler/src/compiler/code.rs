// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The compiled artifact.

use std::sync::Arc;

use bitflags::bitflags;

use crate::constant::Constant;

bitflags! {
    /// Scope flags recorded on a code object.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct CodeFlags: u32 {
        /// Locals live in fast slots
        const OPTIMIZED = 0x0001;
        /// A fresh locals dict is created per call
        const NEWLOCALS = 0x0002;
        /// Has `*args`
        const VARARGS = 0x0004;
        /// Has `**kwargs`
        const VARKEYWORDS = 0x0008;
        /// Defined inside a function
        const NESTED = 0x0010;
        /// Generator function
        const GENERATOR = 0x0020;
        /// No free or cell variables
        const NOFREE = 0x0040;
        /// `async def`
        const COROUTINE = 0x0080;
        /// Async generator
        const ASYNC_GENERATOR = 0x0200;
        /// Compiled with generator-stop semantics
        const FUTURE_GENERATOR_STOP = 0x0080_0000;
        /// Compiled with deferred annotations
        const FUTURE_ANNOTATIONS = 0x0100_0000;
    }
}

bitflags! {
    /// Role bits of one local-plus slot.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct LocalKind: u8 {
        /// Parameter accepted positionally
        const ARG_POS = 0x02;
        /// Parameter accepted by keyword
        const ARG_KW = 0x04;
        /// `*args` or `**kwargs`
        const ARG_VAR = 0x08;
        /// A fast local
        const LOCAL = 0x20;
        /// A cell owned by this scope
        const CELL = 0x40;
        /// A free variable copied from the closure
        const FREE = 0x80;
    }
}

/// The immutable output for one lexical scope.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    /// Number of positional parameters (including positional-only)
    pub argcount: u32,
    /// Number of positional-only parameters
    pub posonlyargcount: u32,
    /// Number of keyword-only parameters
    pub kwonlyargcount: u32,
    /// Scope flags
    pub flags: CodeFlags,
    /// Required operand-stack depth
    pub stacksize: u32,
    /// Instruction bytes, two per code unit
    pub code: Vec<u8>,
    /// Constant table
    pub consts: Vec<Constant>,
    /// Names used by name, attribute, global and import operations
    pub names: Vec<String>,
    /// Local-plus slot names: locals, then cells, then free variables
    pub localsplusnames: Vec<String>,
    /// Role bits, parallel to `localsplusnames`
    pub localspluskinds: Vec<LocalKind>,
    /// Source file name
    pub filename: String,
    /// Scope name
    pub name: String,
    /// Dotted qualified name
    pub qualname: String,
    /// First source line
    pub firstlineno: i32,
    /// Encoded location table
    pub linetable: Vec<u8>,
    /// Encoded exception table
    pub exceptiontable: Vec<u8>,
}

impl CodeObject {
    /// Number of code units.
    pub fn len(&self) -> usize {
        self.code.len() / 2
    }

    /// Whether there is no code at all.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    fn names_with(&self, kind: LocalKind) -> Vec<&str> {
        self.localsplusnames
            .iter()
            .zip(&self.localspluskinds)
            .filter(|(_, k)| k.contains(kind))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Names of fast locals (parameters first).
    pub fn varnames(&self) -> Vec<&str> {
        self.names_with(LocalKind::LOCAL)
    }

    /// Names of cell variables.
    pub fn cellvars(&self) -> Vec<&str> {
        self.names_with(LocalKind::CELL)
    }

    /// Names of free variables.
    pub fn freevars(&self) -> Vec<&str> {
        self.names_with(LocalKind::FREE)
    }

    /// Code objects nested directly in the constant table.
    pub fn nested(&self) -> impl Iterator<Item = &Arc<CodeObject>> {
        self.consts.iter().filter_map(|c| match c {
            Constant::Code(code) => Some(code),
            _ => None,
        })
    }
}
