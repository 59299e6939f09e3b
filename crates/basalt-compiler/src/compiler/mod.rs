// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Bytecode compiler backend.
//!
//! Transforms a scope-resolved AST into code objects.
//!
//! # Module Structure
//!
//! - `opcode`: real and pseudo instruction definitions
//! - `cfg`: basic blocks, labels and the block builder
//! - `codegen`: lowering from AST to the control-flow graph
//! - `flowgraph`: optimizer passes and whole-graph analyses
//! - `assemble`: linearization and the side tables
//! - `code`: the compiled artifact
//! - `flat`: flattened instruction listings for testing
//! - `dis`: decoder and disassembler

pub mod assemble;
pub mod cfg;
pub mod code;
pub mod codegen;
pub mod dis;
pub mod flat;
pub mod flowgraph;
pub mod opcode;

pub use cfg::{BasicBlock, BlockId, Cfg, Instr, Label};
pub use code::{CodeFlags, CodeObject, LocalKind};
pub use codegen::Compiler;
pub use opcode::{AnyOp, Opcode, PseudoOp};
