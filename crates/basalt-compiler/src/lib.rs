// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # basalt-compiler
//!
//! The backend of a bytecode compiler for a dynamically typed, Python-like
//! language.
//!
//! ## Overview
//!
//! Given a validated syntax tree and its symbol table, this crate produces
//! nested code objects:
//! - Code generation into a control-flow graph of basic blocks
//! - An iterative CFG optimizer (constant folding, jump threading, dead
//!   code removal, tail inlining)
//! - Stack-depth analysis and uninitialized-load checks
//! - Assembly into 16-bit instruction units with compact exception and
//!   location tables
//!
//! ## Quick Start
//!
//! ```rust
//! use basalt_compiler::ast::{Expr, Location, Module, Stmt};
//! use basalt_compiler::{CompileOptions, compile};
//!
//! let at = Location::new(1, 0, 1, 5);
//! let module = Module {
//!     body: vec![Stmt::assign(Expr::name("x", at), Expr::constant(1i64, at), at)],
//! };
//! let output = compile(&module, &CompileOptions::default()).unwrap();
//! assert_eq!(output.code.names, vec!["x".to_string()]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ast;
pub mod compiler;
pub mod config;
pub mod constant;
pub mod error;
pub mod symtable;

// Re-exports for convenience
pub use compiler::codegen::CompileOutput;
pub use compiler::{CodeFlags, CodeObject, Compiler, Opcode, PseudoOp};
pub use config::{CompileOptions, FeatureFlags, OptimizeLevel};
pub use constant::Constant;
pub use error::{CompileError, CompileWarning, Result};
pub use symtable::SymbolTable;

use tracing::debug;

/// Compiles a module: builds its symbol table, then lowers, optimizes and
/// assembles every scope.
///
/// # Errors
///
/// Returns the first source error found, a warning escalated by
/// [`CompileOptions::warnings_as_errors`], or an overflow of one of the
/// bytecode's hard limits.
pub fn compile(module: &ast::Module, options: &CompileOptions) -> Result<CompileOutput> {
    debug!("building symbol table for {}", options.filename);
    let table = SymbolTable::build(module, &options.filename)?;
    Compiler::new(&table, options).compile_module(module)
}
