// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Final lowering from an optimized graph to a [`CodeObject`].
//!
//! # Module Structure
//!
//! - `linetable`: location table encoder and decoder
//! - `exceptions`: exception table encoder and decoder
//!
//! The steps, in order: frame-setup prefix, jump direction normalization,
//! stack depth, deref operand relocation, pseudo-op lowering, offset
//! resolution with `EXTENDED_ARG` sizing, and emission of the instruction
//! bytes plus both side tables.

pub mod exceptions;
pub mod linetable;

pub use exceptions::{ExceptionTableEntry, decode_exception_table};
pub use linetable::{LineTableWriter, decode_linetable};

use tracing::debug;

use crate::ast::Location;
use crate::compiler::cfg::{BlockId, Cfg, Instr};
use crate::compiler::code::{CodeFlags, CodeObject, LocalKind};
use crate::compiler::flowgraph::MAX_CONSTS;
use crate::compiler::flowgraph::cleanup::remove_redundant_nops;
use crate::compiler::flowgraph::stackdepth::stackdepth;
use crate::compiler::opcode::{AnyOp, JumpDirection, Opcode, PseudoOp};
use crate::constant::Constant;
use crate::error::{CompileError, Result};

/// Everything about a unit besides its graph and constants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitMetadata {
    /// Scope name
    pub name: String,
    /// Dotted qualified name
    pub qualname: String,
    /// Source file name
    pub filename: String,
    /// First source line
    pub firstlineno: i32,
    /// Positional parameters, positional-only included
    pub argcount: u32,
    /// Positional-only parameters
    pub posonlyargcount: u32,
    /// Keyword-only parameters
    pub kwonlyargcount: u32,
    /// Scope flags
    pub flags: CodeFlags,
    /// Global, attribute and import names
    pub names: Vec<String>,
    /// Fast locals, parameters first
    pub varnames: Vec<String>,
    /// Cell variables
    pub cellvars: Vec<String>,
    /// Free variables
    pub freevars: Vec<String>,
}

impl UnitMetadata {
    /// Number of parameter slots, `*args` and `**kwargs` included.
    pub fn nparams(&self) -> usize {
        let mut n = (self.argcount + self.kwonlyargcount) as usize;
        if self.flags.contains(CodeFlags::VARARGS) {
            n += 1;
        }
        if self.flags.contains(CodeFlags::VARKEYWORDS) {
            n += 1;
        }
        n
    }

    fn param_kind(&self, slot: usize) -> LocalKind {
        let posonly = self.posonlyargcount as usize;
        let positional = self.argcount as usize;
        let kwonly = positional + self.kwonlyargcount as usize;
        let has_varargs = self.flags.contains(CodeFlags::VARARGS);
        if slot < posonly {
            LocalKind::ARG_POS
        } else if slot < positional {
            LocalKind::ARG_POS | LocalKind::ARG_KW
        } else if slot < kwonly {
            LocalKind::ARG_KW
        } else if slot == kwonly && has_varargs {
            LocalKind::ARG_POS | LocalKind::ARG_VAR
        } else {
            LocalKind::ARG_KW | LocalKind::ARG_VAR
        }
    }
}

/// Code units an instruction with operand `arg` occupies.
pub fn instr_size(arg: u32) -> u32 {
    match arg {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 4,
    }
}

/// Maps deref operands (cell index, then free index) to local-plus slots.
///
/// A cell that is also a parameter lives in the parameter's slot; the
/// remaining cells and the free variables follow the locals densely.
fn cell_offsets(meta: &UnitMetadata) -> Vec<u32> {
    let nlocals = meta.varnames.len() as u32;
    let mut offsets = Vec::with_capacity(meta.cellvars.len() + meta.freevars.len());
    let mut dropped = 0;
    for (i, cell) in meta.cellvars.iter().enumerate() {
        match meta.varnames.iter().position(|v| v == cell) {
            Some(slot) => {
                offsets.push(slot as u32);
                dropped += 1;
            }
            None => offsets.push(nlocals + i as u32 - dropped),
        }
    }
    let ncells = meta.cellvars.len() as u32;
    for j in 0..meta.freevars.len() as u32 {
        offsets.push(nlocals + ncells + j - dropped);
    }
    offsets
}

fn insert_prefix(cfg: &mut Cfg, meta: &UnitMetadata, offsets: &[u32]) {
    let mut prefix = Vec::new();
    if !meta.freevars.is_empty() {
        prefix.push(Instr::new(
            Opcode::CopyFreeVars,
            meta.freevars.len() as u32,
            Location::NONE,
        ));
    }
    let mut cells: Vec<u32> = (0..meta.cellvars.len() as u32).collect();
    cells.sort_by_key(|&i| offsets[i as usize]);
    for cell in cells {
        prefix.push(Instr::new(Opcode::MakeCell, cell, Location::NONE));
    }
    if meta
        .flags
        .intersects(CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR)
    {
        prefix.push(Instr::new(
            Opcode::ReturnGenerator,
            0,
            Location::line_only(meta.firstlineno),
        ));
        prefix.push(Instr::new(Opcode::PopTop, 0, Location::NONE));
    }
    if prefix.is_empty() {
        return;
    }
    let entry = cfg.entry;
    let block = cfg.block_mut(entry);
    block.instrs.splice(0..0, prefix);
}

fn directed(op: AnyOp, forward: bool) -> Option<Opcode> {
    use Opcode::*;
    let pick = |f: Opcode, b: Opcode| Some(if forward { f } else { b });
    match op {
        AnyOp::Pseudo(PseudoOp::Jump) | AnyOp::Real(JumpForward | JumpBackward) => {
            pick(JumpForward, JumpBackward)
        }
        AnyOp::Pseudo(PseudoOp::JumpNoInterrupt) | AnyOp::Real(JumpBackwardNoInterrupt) => {
            pick(JumpForward, JumpBackwardNoInterrupt)
        }
        AnyOp::Pseudo(PseudoOp::PopJumpIfFalse)
        | AnyOp::Real(PopJumpForwardIfFalse | PopJumpBackwardIfFalse) => {
            pick(PopJumpForwardIfFalse, PopJumpBackwardIfFalse)
        }
        AnyOp::Pseudo(PseudoOp::PopJumpIfTrue)
        | AnyOp::Real(PopJumpForwardIfTrue | PopJumpBackwardIfTrue) => {
            pick(PopJumpForwardIfTrue, PopJumpBackwardIfTrue)
        }
        AnyOp::Pseudo(PseudoOp::PopJumpIfNone)
        | AnyOp::Real(PopJumpForwardIfNone | PopJumpBackwardIfNone) => {
            pick(PopJumpForwardIfNone, PopJumpBackwardIfNone)
        }
        AnyOp::Pseudo(PseudoOp::PopJumpIfNotNone)
        | AnyOp::Real(PopJumpForwardIfNotNone | PopJumpBackwardIfNotNone) => {
            pick(PopJumpForwardIfNotNone, PopJumpBackwardIfNotNone)
        }
        _ => None,
    }
}

/// Picks the direction-specific form of every jump from the final layout.
fn normalize_jumps(cfg: &mut Cfg) -> Result<()> {
    for block in &mut cfg.blocks {
        block.visited = false;
    }
    for id in cfg.order() {
        cfg.block_mut(id).visited = true;
        let mut i = 0;
        while i < cfg.block(id).instrs.len() {
            let instr = &cfg.block(id).instrs[i];
            let (op, target) = (instr.op, instr.target);
            let Some(target) = target.filter(|_| op.is_jump()) else {
                i += 1;
                continue;
            };
            let forward = !cfg.block(target).visited;
            if let Some(real) = directed(op, forward) {
                cfg.block_mut(id).instrs[i].op = AnyOp::Real(real);
                i += 1;
                continue;
            }
            match op {
                AnyOp::Real(_) if forward => i += 1,
                AnyOp::Real(or_pop @ (Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop)) => {
                    let pop_jump = if or_pop == Opcode::JumpIfFalseOrPop {
                        Opcode::PopJumpBackwardIfFalse
                    } else {
                        Opcode::PopJumpBackwardIfTrue
                    };
                    let original = cfg.block(id).instrs[i].clone();
                    let mut copy = Instr::new(Opcode::Copy, 1, original.loc);
                    copy.handler = original.handler;
                    let mut jump = Instr::jump(pop_jump, target, original.loc);
                    jump.handler = original.handler;
                    let mut pop = Instr::new(Opcode::PopTop, 0, original.loc);
                    pop.handler = original.handler;
                    cfg.block_mut(id).instrs.splice(i..=i, [copy, jump, pop]);
                    i += 3;
                }
                _ => {
                    return Err(CompileError::internal(format!(
                        "{op} cannot jump backward"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn fix_cell_offsets(cfg: &mut Cfg, offsets: &[u32]) -> Result<()> {
    for id in cfg.order() {
        for instr in &mut cfg.block_mut(id).instrs {
            let is_deref = matches!(
                instr.op,
                AnyOp::Real(
                    Opcode::MakeCell
                        | Opcode::LoadDeref
                        | Opcode::StoreDeref
                        | Opcode::DeleteDeref
                        | Opcode::LoadClassderef
                ) | AnyOp::Pseudo(PseudoOp::LoadClosure)
            );
            if !is_deref {
                continue;
            }
            instr.arg = *offsets.get(instr.arg as usize).ok_or_else(|| {
                CompileError::internal(format!(
                    "{} operand {} names no cell or free variable",
                    instr.op, instr.arg
                ))
            })?;
        }
    }
    Ok(())
}

/// Lowers the pseudo operations that survive until assembly.
fn convert_pseudo_ops(cfg: &mut Cfg) -> Result<()> {
    for id in cfg.order() {
        for instr in &mut cfg.block_mut(id).instrs {
            match instr.op {
                AnyOp::Pseudo(
                    PseudoOp::SetupFinally
                    | PseudoOp::SetupCleanup
                    | PseudoOp::SetupWith
                    | PseudoOp::PopBlock,
                ) => instr.set_nop(),
                AnyOp::Pseudo(PseudoOp::LoadClosure) => instr.op = AnyOp::Real(Opcode::LoadFast),
                AnyOp::Pseudo(op) => {
                    return Err(CompileError::internal(format!(
                        "{} survived jump normalization",
                        op.name()
                    )));
                }
                AnyOp::Real(_) => {}
            }
        }
        remove_redundant_nops(cfg, id);
    }
    Ok(())
}

/// Assigns block offsets and relative jump operands until sizes settle.
fn resolve_offsets(cfg: &mut Cfg, order: &[BlockId]) -> Result<u32> {
    loop {
        let mut offset = 0u32;
        for &id in order {
            let block = cfg.block_mut(id);
            block.offset = offset;
            for instr in &block.instrs {
                offset += instr_size(instr.arg);
            }
        }
        let total = offset;

        let mut resized = false;
        for &id in order {
            let mut offset = cfg.block(id).offset;
            for i in 0..cfg.block(id).instrs.len() {
                let instr = &cfg.block(id).instrs[i];
                let size = instr_size(instr.arg);
                let end = offset + size;
                offset = end;
                let (Some(target), Some(op)) = (instr.target, instr.op.real()) else {
                    continue;
                };
                let Some(direction) = op.jump_direction() else {
                    continue;
                };
                let target_offset = cfg.block(target).offset;
                let arg = match direction {
                    JumpDirection::Forward => target_offset.checked_sub(end),
                    JumpDirection::Backward => end.checked_sub(target_offset),
                }
                .ok_or_else(|| {
                    CompileError::internal(format!("{op} points the wrong way"))
                })?;
                if instr_size(arg) != size {
                    resized = true;
                }
                cfg.block_mut(id).instrs[i].arg = arg;
            }
        }
        if !resized {
            return Ok(total);
        }
    }
}

fn emit_code(cfg: &Cfg, order: &[BlockId]) -> Result<Vec<u8>> {
    let mut code = Vec::new();
    for &id in order {
        for instr in &cfg.block(id).instrs {
            let op = instr.op.real().ok_or_else(|| {
                CompileError::internal(format!("{} reached the emitter", instr.op))
            })?;
            let size = instr_size(instr.arg);
            for shift in (1..size).rev() {
                code.push(Opcode::ExtendedArg as u8);
                code.push((instr.arg >> (8 * shift)) as u8);
            }
            code.push(op as u8);
            code.push(instr.arg as u8);
        }
    }
    Ok(code)
}

fn emit_linetable(cfg: &Cfg, order: &[BlockId], firstlineno: i32) -> Result<Vec<u8>> {
    let mut writer = LineTableWriter::new(firstlineno);
    let mut run: Option<(Location, u32)> = None;
    for &id in order {
        for instr in &cfg.block(id).instrs {
            let size = instr_size(instr.arg);
            run = match run {
                Some((loc, units)) if loc == instr.loc => Some((loc, units + size)),
                Some((loc, units)) => {
                    writer.push(loc, units)?;
                    Some((instr.loc, size))
                }
                None => Some((instr.loc, size)),
            };
        }
    }
    if let Some((loc, units)) = run {
        writer.push(loc, units)?;
    }
    Ok(writer.finish())
}

fn handler_entry(cfg: &Cfg, handler: BlockId, start: u32, end: u32) -> Result<ExceptionTableEntry> {
    let block = cfg.block(handler);
    let start_depth = block.start_depth.ok_or_else(|| {
        CompileError::internal(format!("handler block {} was never reached", handler.0))
    })?;
    let depth = start_depth - 1 - i32::from(block.preserve_lasti);
    let depth = u32::try_from(depth).map_err(|_| {
        CompileError::internal(format!("handler block {} entered below its frame", handler.0))
    })?;
    Ok(ExceptionTableEntry {
        start,
        end,
        target: block.offset,
        depth,
        lasti: block.preserve_lasti,
    })
}

/// Groups consecutive instructions sharing a handler into table entries.
fn exception_entries(cfg: &Cfg, order: &[BlockId]) -> Result<Vec<ExceptionTableEntry>> {
    let mut in_layout = vec![false; cfg.blocks.len()];
    for &id in order {
        in_layout[id.index()] = true;
    }
    let mut entries = Vec::new();
    let mut current: Option<(BlockId, u32)> = None;
    let mut offset = 0;
    for &id in order {
        for instr in &cfg.block(id).instrs {
            if current.map(|(h, _)| h) != instr.handler {
                if let Some((handler, start)) = current {
                    entries.push(handler_entry(cfg, handler, start, offset)?);
                }
                current = match instr.handler {
                    Some(handler) if !in_layout[handler.index()] => {
                        return Err(CompileError::internal(format!(
                            "handler block {} is not part of the layout",
                            handler.0
                        )));
                    }
                    Some(handler) => Some((handler, offset)),
                    None => None,
                };
            }
            offset += instr_size(instr.arg);
        }
    }
    if let Some((handler, start)) = current {
        entries.push(handler_entry(cfg, handler, start, offset)?);
    }
    Ok(entries)
}

fn localsplus(meta: &UnitMetadata) -> (Vec<String>, Vec<LocalKind>) {
    let nparams = meta.nparams();
    let mut names = Vec::new();
    let mut kinds = Vec::new();
    for (slot, name) in meta.varnames.iter().enumerate() {
        let mut kind = LocalKind::LOCAL;
        if slot < nparams {
            kind |= meta.param_kind(slot);
        }
        if meta.cellvars.contains(name) {
            kind |= LocalKind::CELL;
        }
        names.push(name.clone());
        kinds.push(kind);
    }
    for cell in &meta.cellvars {
        if !meta.varnames.contains(cell) {
            names.push(cell.clone());
            kinds.push(LocalKind::CELL);
        }
    }
    for free in &meta.freevars {
        names.push(free.clone());
        kinds.push(LocalKind::FREE);
    }
    (names, kinds)
}

/// A graph in its final layout: prefix inserted, pseudo ops lowered,
/// offsets and jump operands settled.
#[derive(Debug)]
pub(crate) struct Layout {
    pub cfg: Cfg,
    pub order: Vec<BlockId>,
    pub stacksize: u32,
    /// Length of the code in code units
    pub units: u32,
}

pub(crate) fn lay_out(mut cfg: Cfg, meta: &UnitMetadata) -> Result<Layout> {
    let offsets = cell_offsets(meta);

    insert_prefix(&mut cfg, meta, &offsets);
    normalize_jumps(&mut cfg)?;
    let stacksize = stackdepth(&mut cfg, meta.flags)?;
    fix_cell_offsets(&mut cfg, &offsets)?;
    convert_pseudo_ops(&mut cfg)?;

    let order = cfg.order();
    let units = resolve_offsets(&mut cfg, &order)?;
    Ok(Layout {
        cfg,
        order,
        stacksize,
        units,
    })
}

/// Serializes a laid-out graph: code bytes and both side tables.
pub(crate) fn encode(layout: &Layout, consts: Vec<Constant>, meta: &UnitMetadata) -> Result<CodeObject> {
    let Layout {
        cfg,
        order,
        stacksize,
        units,
    } = layout;
    let code = emit_code(cfg, order)?;
    let linetable = emit_linetable(cfg, order, meta.firstlineno)?;
    let mut exceptiontable = Vec::new();
    for entry in exception_entries(cfg, order)? {
        exceptions::write_entry(&mut exceptiontable, &entry)?;
    }
    let (localsplusnames, localspluskinds) = localsplus(meta);

    debug!(
        "assembled {}: {} code units, stack {}, {} table bytes",
        meta.qualname,
        units,
        stacksize,
        linetable.len() + exceptiontable.len()
    );

    Ok(CodeObject {
        argcount: meta.argcount,
        posonlyargcount: meta.posonlyargcount,
        kwonlyargcount: meta.kwonlyargcount,
        flags: meta.flags,
        stacksize: *stacksize,
        code,
        consts,
        names: meta.names.clone(),
        localsplusnames,
        localspluskinds,
        filename: meta.filename.clone(),
        name: meta.name.clone(),
        qualname: meta.qualname.clone(),
        firstlineno: meta.firstlineno,
        linetable,
        exceptiontable,
    })
}

/// Linearizes an optimized graph into its final code object.
pub fn assemble(cfg: Cfg, consts: Vec<Constant>, meta: &UnitMetadata) -> Result<CodeObject> {
    if consts.len() > MAX_CONSTS {
        return Err(CompileError::overflow("too many constants"));
    }
    if meta.names.len() > MAX_CONSTS {
        return Err(CompileError::overflow("too many names"));
    }
    let layout = lay_out(cfg, meta)?;
    encode(&layout, consts, meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(line: i32) -> Location {
        Location::new(line, 0, line, 1)
    }

    fn meta() -> UnitMetadata {
        UnitMetadata {
            name: "<module>".into(),
            qualname: "<module>".into(),
            filename: "test.py".into(),
            firstlineno: 1,
            ..UnitMetadata::default()
        }
    }

    #[test]
    fn test_instr_size() {
        assert_eq!(instr_size(0), 1);
        assert_eq!(instr_size(255), 1);
        assert_eq!(instr_size(256), 2);
        assert_eq!(instr_size(0x1_0000), 3);
        assert_eq!(instr_size(u32::MAX), 4);
    }

    #[test]
    fn test_straight_line_bytes() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::Resume, 0, loc(1)).unwrap();
        cfg.addop(Opcode::LoadConst, 0, loc(1)).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc(1)).unwrap();
        let code = assemble(cfg, vec![Constant::None], &meta()).unwrap();
        assert_eq!(code.code, vec![151, 0, 100, 0, 83, 0]);
        assert_eq!(code.stacksize, 1);
        assert!(code.exceptiontable.is_empty());
        let lines = decode_linetable(&code.linetable, 1).unwrap();
        assert_eq!(lines, vec![loc(1); 3]);
    }

    #[test]
    fn test_backward_jump_operand() {
        // while x: pass
        let mut cfg = Cfg::new();
        let head = cfg.new_label();
        let exit = cfg.new_label();
        cfg.addop(Opcode::Resume, 0, loc(1)).unwrap();
        cfg.use_label(head).unwrap();
        cfg.addop(Opcode::LoadName, 0, loc(1)).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfFalse, exit, loc(1)).unwrap();
        cfg.add_jump(PseudoOp::Jump, head, loc(2)).unwrap();
        cfg.use_label(exit).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(2)).unwrap();
        cfg.translate_labels().unwrap();
        let meta = UnitMetadata {
            names: vec!["x".into()],
            ..meta()
        };
        let code = assemble(cfg, vec![Constant::None], &meta).unwrap();
        assert_eq!(
            code.code,
            vec![
                151, 0, // RESUME
                101, 0, // LOAD_NAME x
                114, 1, // POP_JUMP_FORWARD_IF_FALSE +1
                140, 3, // JUMP_BACKWARD -3
                121, 0, // RETURN_CONST None
            ]
        );
    }

    #[test]
    fn test_extended_arg_prefix() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::LoadConst, 300, loc(1)).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc(1)).unwrap();
        let consts = vec![Constant::None; 301];
        let code = assemble(cfg, consts, &meta()).unwrap();
        assert_eq!(code.code, vec![144, 1, 100, 44, 83, 0]);
        assert_eq!(decode_linetable(&code.linetable, 1).unwrap().len(), 3);
    }

    #[test]
    fn test_exception_table_for_try() {
        // try: f() except: pass
        let mut cfg = Cfg::new();
        let handler = cfg.new_label();
        let exit = cfg.new_label();
        cfg.addop(Opcode::Resume, 0, loc(1)).unwrap();
        cfg.add_jump(PseudoOp::SetupFinally, handler, loc(1)).unwrap();
        cfg.addop(Opcode::PushNull, 0, loc(2)).unwrap();
        cfg.addop(Opcode::LoadName, 0, loc(2)).unwrap();
        cfg.addop(Opcode::Call, 0, loc(2)).unwrap();
        cfg.addop(Opcode::PopTop, 0, loc(2)).unwrap();
        cfg.addop(PseudoOp::PopBlock, 0, loc(2)).unwrap();
        cfg.add_jump(PseudoOp::Jump, exit, loc(2)).unwrap();
        cfg.use_label(handler).unwrap();
        cfg.addop(Opcode::PushExcInfo, 0, loc(3)).unwrap();
        cfg.addop(Opcode::PopTop, 0, loc(4)).unwrap();
        cfg.addop(Opcode::PopExcept, 0, loc(4)).unwrap();
        cfg.use_label(exit).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(4)).unwrap();
        cfg.translate_labels().unwrap();
        crate::compiler::flowgraph::except::mark_except_handlers(&mut cfg);
        crate::compiler::flowgraph::except::label_exception_targets(&mut cfg).unwrap();

        let meta = UnitMetadata {
            names: vec!["f".into()],
            ..meta()
        };
        let code = assemble(cfg, vec![Constant::None], &meta).unwrap();
        let entries = decode_exception_table(&code.exceptiontable).unwrap();
        // Both lowered block markers share a line with their neighbour and
        // vanish: RESUME, PUSH_NULL, LOAD_NAME, CALL, POP_TOP, JUMP_FORWARD,
        // then the handler at offset 6.
        assert_eq!(
            entries,
            vec![ExceptionTableEntry {
                start: 1,
                end: 5,
                target: 6,
                depth: 0,
                lasti: false,
            }]
        );
    }

    #[test]
    fn test_cells_and_free_vars_get_prefix() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::Resume, 0, loc(1)).unwrap();
        cfg.addop(Opcode::LoadDeref, 1, loc(1)).unwrap();
        cfg.addop(Opcode::ReturnValue, 0, loc(1)).unwrap();
        let meta = UnitMetadata {
            argcount: 1,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            varnames: vec!["a".into(), "b".into()],
            cellvars: vec!["c".into(), "a".into()],
            freevars: vec!["z".into()],
            ..meta()
        };
        let code = assemble(cfg, vec![Constant::None], &meta).unwrap();
        assert_eq!(code.localsplusnames, vec!["a", "b", "c", "z"]);
        assert_eq!(
            code.localspluskinds,
            vec![
                LocalKind::LOCAL | LocalKind::CELL | LocalKind::ARG_POS | LocalKind::ARG_KW,
                LocalKind::LOCAL,
                LocalKind::CELL,
                LocalKind::FREE,
            ]
        );
        assert_eq!(
            code.code,
            vec![
                149, 1, // COPY_FREE_VARS 1
                135, 0, // MAKE_CELL a
                135, 2, // MAKE_CELL c
                151, 0, // RESUME
                137, 0, // LOAD_DEREF a
                83, 0,
            ]
        );
    }

    #[test]
    fn test_generator_prefix() {
        let mut cfg = Cfg::new();
        cfg.addop(Opcode::Resume, 0, loc(1)).unwrap();
        cfg.addop(Opcode::ReturnConst, 0, loc(1)).unwrap();
        let meta = UnitMetadata {
            flags: CodeFlags::GENERATOR,
            ..meta()
        };
        let code = assemble(cfg, vec![Constant::None], &meta).unwrap();
        assert_eq!(code.code[..4], [75, 0, 1, 0]);
        assert_eq!(code.stacksize, 1);
    }
}
