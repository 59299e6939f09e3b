// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Control-flow graph of basic blocks.
//!
//! Blocks live in an arena and are referenced by [`BlockId`]. Besides the
//! jump graph, every block has a `next` link that records layout order; the
//! assembler emits blocks by following it from the entry block.
//!
//! While code is being generated, jumps name a [`Label`]. A label is bound to
//! whatever block receives the next instruction, so forward references work
//! without knowing the destination block up front. Once generation is done,
//! [`Cfg::translate_labels`] resolves every label to its block.

use crate::ast::Location;
use crate::compiler::opcode::{AnyOp, Opcode};
use crate::error::{CompileError, Result};

/// A jump destination declared before (or after) the code it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// Stable index of a block in a [`Cfg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// The arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One instruction in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    /// Real or pseudo operation
    pub op: AnyOp,
    /// Operand; for jumps this holds the label number until labels are resolved
    pub arg: u32,
    /// Destination block for jumps and handler pushes
    pub target: Option<BlockId>,
    /// Source range
    pub loc: Location,
    /// Active exception handler, filled in by exception labelling
    pub handler: Option<BlockId>,
}

impl Instr {
    /// A non-jump instruction.
    pub fn new(op: impl Into<AnyOp>, arg: u32, loc: Location) -> Self {
        Self {
            op: op.into(),
            arg,
            target: None,
            loc,
            handler: None,
        }
    }

    /// A jump with a resolved destination.
    pub fn jump(op: impl Into<AnyOp>, target: BlockId, loc: Location) -> Self {
        Self {
            op: op.into(),
            arg: 0,
            target: Some(target),
            loc,
            handler: None,
        }
    }

    /// Whether this is the given real opcode.
    pub fn is(&self, op: Opcode) -> bool {
        self.op.is(op)
    }

    /// Clears the instruction to a `NOP`, keeping its location and handler.
    pub fn set_nop(&mut self) {
        self.op = AnyOp::Real(Opcode::Nop);
        self.arg = 0;
        self.target = None;
    }

    /// Rewrites the operation and operand in place.
    pub fn set(&mut self, op: impl Into<AnyOp>, arg: u32) {
        self.op = op.into();
        self.arg = arg;
        if !self.op.has_target() {
            self.target = None;
        }
    }
}

/// A straight-line run of instructions.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Instructions in order
    pub instrs: Vec<Instr>,
    /// Layout successor (and fall-through successor when the block falls through)
    pub next: Option<BlockId>,
    /// Label bound to this block during generation
    pub label: Option<Label>,
    /// Incoming edges, recomputed by reachability analysis
    pub predecessors: u32,
    /// Target of a handler push
    pub is_handler: bool,
    /// Handler entered with `f_lasti` on the stack
    pub preserve_lasti: bool,
    /// Reachable only through exception edges
    pub cold: bool,
    /// Reachable through normal control flow
    pub warm: bool,
    /// Scratch flag for traversals
    pub visited: bool,
    /// Stack depth on entry, once known
    pub start_depth: Option<i32>,
    /// Offset in code units, assigned by the assembler
    pub offset: u32,
}

impl BasicBlock {
    /// The final instruction.
    pub fn last(&self) -> Option<&Instr> {
        self.instrs.last()
    }

    /// Mutable access to the final instruction.
    pub fn last_mut(&mut self) -> Option<&mut Instr> {
        self.instrs.last_mut()
    }

    /// Whether control can continue into `next`.
    pub fn has_fallthrough(&self) -> bool {
        self.last().is_none_or(|instr| instr.op.has_fallthrough())
    }

    /// Whether the block ends by leaving the scope.
    pub fn exits_scope(&self) -> bool {
        self.last().is_some_and(|instr| instr.op.is_scope_exit())
    }

    /// Whether no further instruction may be appended.
    pub fn is_terminated(&self) -> bool {
        self.last().is_some_and(|instr| instr.op.is_terminator())
    }

    /// Whether the block has no source location anywhere and exits the scope.
    pub fn is_exit_without_lineno(&self) -> bool {
        self.exits_scope() && self.instrs.iter().all(|instr| instr.loc.line < 0)
    }
}

/// A control-flow graph under construction or optimization.
#[derive(Debug, Clone)]
pub struct Cfg {
    /// Block arena; unlinked blocks are dead
    pub blocks: Vec<BasicBlock>,
    /// First block in layout order
    pub entry: BlockId,
    current: BlockId,
    labels: Vec<Option<BlockId>>,
}

impl Default for Cfg {
    fn default() -> Self {
        Self::new()
    }
}

impl Cfg {
    /// Creates a graph with a single empty entry block.
    pub fn new() -> Self {
        Self {
            blocks: vec![BasicBlock::default()],
            entry: BlockId(0),
            current: BlockId(0),
            labels: Vec::new(),
        }
    }

    /// Allocates an unlinked block.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::default());
        id
    }

    /// Declares a fresh, unbound label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// The block a label is bound to.
    pub fn label_block(&self, label: Label) -> Option<BlockId> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Access a block.
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    /// Mutable access to a block.
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    /// The block currently receiving instructions.
    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Blocks in layout order.
    pub fn order(&self) -> Vec<BlockId> {
        let mut order = Vec::new();
        let mut cursor = Some(self.entry);
        while let Some(id) = cursor {
            order.push(id);
            cursor = self.block(id).next;
        }
        order
    }

    /// Total instruction count over linked blocks.
    pub fn instr_count(&self) -> usize {
        self.order()
            .into_iter()
            .map(|id| self.block(id).instrs.len())
            .sum()
    }

    /// Links a fresh block after the current one and makes it current.
    fn append_block(&mut self) -> BlockId {
        let id = self.new_block();
        let current = self.current;
        self.blocks[id.index()].next = self.blocks[current.index()].next;
        self.blocks[current.index()].next = Some(id);
        self.current = id;
        id
    }

    fn maybe_start_new_block(&mut self) {
        if self.block(self.current).is_terminated() {
            self.append_block();
        }
    }

    /// Binds `label` to the block that receives the next instruction.
    ///
    /// Binding an already bound label does nothing.
    pub fn use_label(&mut self, label: Label) -> Result<()> {
        let slot = self
            .labels
            .get(label.0 as usize)
            .ok_or_else(|| CompileError::internal(format!("unknown label {}", label.0)))?;
        if slot.is_some() {
            return Ok(());
        }
        let current = self.block(self.current);
        let block = if current.instrs.is_empty() && current.label.is_none() {
            self.current
        } else {
            self.append_block()
        };
        self.blocks[block.index()].label = Some(label);
        self.labels[label.0 as usize] = Some(block);
        Ok(())
    }

    /// Appends an instruction to the current block.
    pub fn addop(&mut self, op: impl Into<AnyOp>, arg: u32, loc: Location) -> Result<()> {
        let op = op.into();
        if op.has_target() {
            return Err(CompileError::internal(format!(
                "{op} needs a jump target"
            )));
        }
        self.maybe_start_new_block();
        let current = self.current;
        self.blocks[current.index()]
            .instrs
            .push(Instr::new(op, arg, loc));
        Ok(())
    }

    /// Appends a jump (or handler push) to `label`.
    pub fn add_jump(&mut self, op: impl Into<AnyOp>, label: Label, loc: Location) -> Result<()> {
        let op = op.into();
        if !op.has_target() {
            return Err(CompileError::internal(format!("{op} is not a jump")));
        }
        if label.0 as usize >= self.labels.len() {
            return Err(CompileError::internal(format!("unknown label {}", label.0)));
        }
        self.maybe_start_new_block();
        let current = self.current;
        self.blocks[current.index()]
            .instrs
            .push(Instr::new(op, label.0, loc));
        Ok(())
    }

    /// Resolves every jump's label operand to its destination block.
    pub fn translate_labels(&mut self) -> Result<()> {
        for id in self.order() {
            for i in 0..self.block(id).instrs.len() {
                let instr = &self.blocks[id.index()].instrs[i];
                if !instr.op.has_target() || instr.target.is_some() {
                    continue;
                }
                let label = Label(instr.arg);
                let target = self.label_block(label).ok_or_else(|| {
                    CompileError::internal(format!("jump to unbound label {}", label.0))
                })?;
                let instr = &mut self.blocks[id.index()].instrs[i];
                instr.target = Some(target);
                instr.arg = 0;
            }
        }
        Ok(())
    }

    /// Allocates an unlinked copy of a block's instructions.
    pub fn copy_block(&mut self, id: BlockId) -> BlockId {
        let instrs = self.block(id).instrs.clone();
        let copy = self.new_block();
        self.blocks[copy.index()].instrs = instrs;
        copy
    }

    /// Every block referenced by a jump, handler push, or handler field.
    pub fn referenced_blocks(&self) -> Vec<bool> {
        let mut referenced = vec![false; self.blocks.len()];
        for id in self.order() {
            for instr in &self.block(id).instrs {
                if let Some(target) = instr.target {
                    referenced[target.index()] = true;
                }
                if let Some(handler) = instr.handler {
                    referenced[handler.index()] = true;
                }
            }
        }
        referenced
    }

    /// Checks the structural invariants the optimizer relies on.
    pub fn check(&self) -> Result<()> {
        for id in self.order() {
            let block = self.block(id);
            let count = block.instrs.len();
            for (i, instr) in block.instrs.iter().enumerate() {
                if instr.op.is_terminator() && i + 1 != count {
                    return Err(CompileError::internal(format!(
                        "{} is not the last instruction of block {}",
                        instr.op, id.0
                    )));
                }
                if instr.op.has_target() && instr.target.is_none() {
                    return Err(CompileError::internal(format!(
                        "{} without a resolved target",
                        instr.op
                    )));
                }
            }
        }
        Ok(())
    }

    /// Recomputes reachability and predecessor counts from the entry block.
    ///
    /// Jumps and handler pushes both count as incoming edges.
    pub fn mark_reachable(&mut self) {
        for block in &mut self.blocks {
            block.predecessors = 0;
            block.visited = false;
        }
        let entry = self.entry;
        self.blocks[entry.index()].predecessors = 1;
        self.blocks[entry.index()].visited = true;
        let mut stack = vec![entry];
        while let Some(id) = stack.pop() {
            let block = &self.blocks[id.index()];
            let mut successors: Vec<BlockId> = block
                .instrs
                .iter()
                .filter_map(|instr| instr.target)
                .collect();
            if block.has_fallthrough() {
                if let Some(next) = block.next {
                    successors.push(next);
                }
            }
            for succ in successors {
                let succ_block = &mut self.blocks[succ.index()];
                succ_block.predecessors += 1;
                if !succ_block.visited {
                    succ_block.visited = true;
                    stack.push(succ);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::opcode::PseudoOp;

    fn loc() -> Location {
        Location::line_only(1)
    }

    #[test]
    fn test_terminator_starts_new_block() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadConst, 0, loc()).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc()).unwrap();
        cfg.addop(Opcode::LoadConst, 1, loc()).unwrap();
        let order = cfg.order();
        assert_eq!(order.len(), 2);
        assert_eq!(cfg.block(order[0]).instrs.len(), 2);
        assert_eq!(cfg.block(order[1]).instrs.len(), 1);
    }

    #[test]
    fn test_label_binds_to_next_block() {
        let mut cfg = Cfg::new();
        let end = cfg.new_label();
        cfg.addop(Opcode::LoadName, 0, loc()).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfFalse, end, loc()).unwrap();
        cfg.addop(Opcode::Nop, 0, loc()).unwrap();
        cfg.use_label(end).unwrap();
        cfg.use_label(end).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc()).unwrap();
        cfg.translate_labels().unwrap();

        let order = cfg.order();
        assert_eq!(order.len(), 3);
        let jump = cfg.block(order[0]).last().unwrap();
        assert_eq!(jump.target, Some(order[2]));
        assert_eq!(cfg.label_block(end), Some(order[2]));
        cfg.check().unwrap();
    }

    #[test]
    fn test_label_on_empty_block_reuses_it() {
        let mut cfg = Cfg::new();
        let start = cfg.new_label();
        cfg.use_label(start).unwrap();
        assert_eq!(cfg.label_block(start), Some(cfg.entry));
    }

    #[test]
    fn test_unbound_label_is_internal_error() {
        let mut cfg = Cfg::new();
        let nowhere = cfg.new_label();
        cfg.add_jump(PseudoOp::Jump, nowhere, loc()).unwrap();
        assert!(matches!(
            cfg.translate_labels(),
            Err(CompileError::Internal(_))
        ));
    }

    #[test]
    fn test_addop_rejects_jump_without_label() {
        let mut cfg = Cfg::new();
        assert!(cfg.addop(PseudoOp::Jump, 0, loc()).is_err());
    }

    #[test]
    fn test_mark_reachable_counts_predecessors() {
        let mut cfg = Cfg::new();
        let target = cfg.new_label();
        cfg.addop(Opcode::LoadName, 0, loc()).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfTrue, target, loc()).unwrap();
        cfg.addop(Opcode::Nop, 0, loc()).unwrap();
        cfg.use_label(target).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc()).unwrap();
        cfg.translate_labels().unwrap();
        cfg.mark_reachable();
        let order = cfg.order();
        assert_eq!(cfg.block(order[2]).predecessors, 2);
        assert_eq!(cfg.block(order[1]).predecessors, 1);
    }
}
