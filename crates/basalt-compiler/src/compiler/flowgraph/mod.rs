// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Whole-graph passes run between code generation and assembly.
//!
//! # Module Structure
//!
//! - `except`: handler marking and per-instruction handler labelling
//! - `peephole`: per-block rewrites and tail inlining
//! - `swaps`: stack-shuffle fusion
//! - `cleanup`: no-op, empty-block, unreachable-code and jump cleanup
//! - `cold`: moving exception-only code out of line
//! - `locals`: checked loads for possibly unbound locals
//! - `lines`: line numbers for synthetic instructions
//! - `stackdepth`: maximum operand-stack depth

pub(crate) mod cleanup;
pub(crate) mod cold;
pub(crate) mod except;
pub(crate) mod lines;
pub(crate) mod locals;
pub(crate) mod peephole;
pub(crate) mod stackdepth;
pub(crate) mod swaps;

pub use peephole::MAX_CONSTS;
pub use stackdepth::MAX_STACK_DEPTH;

use tracing::{debug, trace};

use crate::compiler::cfg::{Cfg, Instr};
use crate::config::CompileOptions;
use crate::constant::{ConstCache, Constant};
use crate::error::Result;

/// Upper bound on optimizer iterations per run.
const MAX_OPTIMIZE_ITERATIONS: usize = 8;

/// Which optional passes run and how far tail inlining may go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassConfig {
    /// Run the CFG optimizer
    pub optimize: bool,
    /// Largest exit block copied into a jumping predecessor
    pub max_inline_size: usize,
    /// Tail-inlining sweeps per optimizer iteration
    pub max_inline_passes: usize,
}

impl PassConfig {
    /// Derives the pass configuration from compiler options.
    pub fn from_options(options: &CompileOptions) -> Self {
        Self {
            optimize: options.optimize.optimizes_cfg(),
            max_inline_size: options.max_inline_size,
            max_inline_passes: options.max_inline_passes,
        }
    }
}

impl Default for PassConfig {
    fn default() -> Self {
        Self::from_options(&CompileOptions::default())
    }
}

/// Facts about the unit the passes need beyond the graph itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitShape {
    /// Number of fast locals, parameters included
    pub nlocals: usize,
    /// Number of parameters
    pub nparams: usize,
    /// First line of the scope
    pub firstlineno: i32,
}

fn snapshot(cfg: &Cfg) -> Vec<Vec<Instr>> {
    cfg.order()
        .into_iter()
        .map(|id| cfg.block(id).instrs.clone())
        .collect()
}

fn inline_sweeps(cfg: &mut Cfg, config: &PassConfig) {
    for _ in 0..config.max_inline_passes {
        let mut changed = false;
        for id in cfg.order() {
            changed |= peephole::inline_small_exit_block(cfg, id, config.max_inline_size);
        }
        if !changed {
            break;
        }
    }
}

/// One round of the optimizer.
fn optimize_cfg_once(
    cfg: &mut Cfg,
    consts: &mut Vec<Constant>,
    cache: &mut ConstCache,
    config: &PassConfig,
) -> Result<()> {
    cfg.check()?;
    cleanup::eliminate_empty_blocks(cfg)?;
    inline_sweeps(cfg, config);
    for id in cfg.order() {
        peephole::optimize_basic_block(cfg, id, consts, cache)?;
    }
    cleanup::remove_redundant_nops_and_pairs(cfg);
    inline_sweeps(cfg, config);
    cleanup::remove_unreachable_blocks(cfg)?;
    loop {
        for id in cfg.order() {
            cleanup::remove_redundant_nops(cfg, id);
        }
        cleanup::eliminate_empty_blocks(cfg)?;
        if !cleanup::remove_redundant_jumps(cfg) {
            break;
        }
    }
    cleanup::merge_fallthrough_chains(cfg);
    Ok(())
}

/// Runs the optimizer until the graph stops changing.
pub fn optimize_cfg(
    cfg: &mut Cfg,
    consts: &mut Vec<Constant>,
    cache: &mut ConstCache,
    config: &PassConfig,
) -> Result<()> {
    let mut before = snapshot(cfg);
    for iteration in 0..MAX_OPTIMIZE_ITERATIONS {
        optimize_cfg_once(cfg, consts, cache, config)?;
        let after = snapshot(cfg);
        if after == before {
            trace!("optimizer settled after {} iterations", iteration + 1);
            break;
        }
        before = after;
    }
    Ok(())
}

/// Runs every pass between code generation and assembly on one unit.
///
/// Labels are resolved first. On return the graph has no empty or
/// unreachable blocks, every instruction knows its active handler, cold
/// code sits at the end of the layout, and `consts` holds only the
/// constants still referenced.
pub fn optimize_code_unit(
    cfg: &mut Cfg,
    consts: &mut Vec<Constant>,
    cache: &mut ConstCache,
    shape: UnitShape,
    config: &PassConfig,
) -> Result<()> {
    let blocks_before = cfg.order().len();
    let instrs_before = cfg.instr_count();

    cfg.translate_labels()?;
    except::mark_except_handlers(cfg);
    except::label_exception_targets(cfg)?;
    if config.optimize {
        optimize_cfg(cfg, consts, cache, config)?;
    } else {
        cleanup::eliminate_empty_blocks(cfg)?;
        cleanup::remove_unreachable_blocks(cfg)?;
    }
    locals::add_checks_for_loads_of_uninitialized_variables(cfg, shape.nlocals, shape.nparams);
    cold::push_cold_blocks_to_end(cfg);
    if config.optimize {
        optimize_cfg(cfg, consts, cache, config)?;
    }
    let consts_before = consts.len();
    cleanup::remove_unused_consts(cfg, consts)?;
    lines::resolve_line_numbers(cfg, shape.firstlineno);

    debug!(
        "optimized unit: {} -> {} blocks, {} -> {} instructions, {} -> {} constants",
        blocks_before,
        cfg.order().len(),
        instrs_before,
        cfg.instr_count(),
        consts_before,
        consts.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Location;
    use crate::compiler::opcode::{AnyOp, Opcode, PseudoOp};

    fn loc(line: i32) -> Location {
        Location::line_only(line)
    }

    fn all_ops(cfg: &Cfg) -> Vec<AnyOp> {
        cfg.order()
            .into_iter()
            .flat_map(|id| cfg.block(id).instrs.iter().map(|i| i.op))
            .collect()
    }

    /// `if True: x = 1 else: x = 2` at module level.
    fn constant_if() -> (Cfg, Vec<Constant>) {
        let mut cfg = Cfg::new();
        let orelse = cfg.new_label();
        let end = cfg.new_label();
        cfg.addop(Opcode::Resume, 0, loc(0)).unwrap();
        cfg.addop(Opcode::LoadConst, 0, loc(1)).unwrap();
        cfg.add_jump(PseudoOp::PopJumpIfFalse, orelse, loc(1)).unwrap();
        cfg.addop(Opcode::LoadConst, 1, loc(2)).unwrap();
        cfg.addop(Opcode::StoreName, 0, loc(2)).unwrap();
        cfg.add_jump(PseudoOp::Jump, end, loc(2)).unwrap();
        cfg.use_label(orelse).unwrap();
        cfg.addop(Opcode::LoadConst, 2, loc(4)).unwrap();
        cfg.addop(Opcode::StoreName, 0, loc(4)).unwrap();
        cfg.use_label(end).unwrap();
        cfg.addop(Opcode::ReturnConst, 3, loc(4)).unwrap();
        let consts = vec![
            Constant::Bool(true),
            Constant::from(1),
            Constant::from(2),
            Constant::None,
        ];
        (cfg, consts)
    }

    #[test]
    fn test_constant_condition_folds_to_one_block() {
        let (mut cfg, mut consts) = constant_if();
        let mut cache = ConstCache::new();
        optimize_code_unit(
            &mut cfg,
            &mut consts,
            &mut cache,
            UnitShape::default(),
            &PassConfig::default(),
        )
        .unwrap();
        assert_eq!(cfg.order().len(), 1);
        assert_eq!(
            all_ops(&cfg),
            vec![
                AnyOp::Real(Opcode::Resume),
                AnyOp::Real(Opcode::Nop),
                AnyOp::Real(Opcode::LoadConst),
                AnyOp::Real(Opcode::StoreName),
                AnyOp::Real(Opcode::ReturnConst),
            ]
        );
        assert_eq!(consts, vec![Constant::Bool(true), Constant::from(1), Constant::None]);
    }

    #[test]
    fn test_optimizing_twice_changes_nothing() {
        let (mut cfg, mut consts) = constant_if();
        let mut cache = ConstCache::new();
        let config = PassConfig::default();
        optimize_code_unit(&mut cfg, &mut consts, &mut cache, UnitShape::default(), &config)
            .unwrap();
        let once = snapshot(&cfg);
        let consts_once = consts.clone();
        optimize_code_unit(&mut cfg, &mut consts, &mut cache, UnitShape::default(), &config)
            .unwrap();
        assert_eq!(snapshot(&cfg), once);
        assert_eq!(consts, consts_once);
    }

    #[test]
    fn test_level_zero_keeps_branches() {
        let (mut cfg, mut consts) = constant_if();
        let mut cache = ConstCache::new();
        let config = PassConfig {
            optimize: false,
            ..PassConfig::default()
        };
        optimize_code_unit(&mut cfg, &mut consts, &mut cache, UnitShape::default(), &config)
            .unwrap();
        assert!(all_ops(&cfg).contains(&AnyOp::Pseudo(PseudoOp::PopJumpIfFalse)));
        assert_eq!(consts.len(), 4);
    }

    #[test]
    fn test_no_empty_blocks_and_terminators_last() {
        let (mut cfg, mut consts) = constant_if();
        let mut cache = ConstCache::new();
        optimize_code_unit(
            &mut cfg,
            &mut consts,
            &mut cache,
            UnitShape::default(),
            &PassConfig::default(),
        )
        .unwrap();
        for id in cfg.order() {
            assert!(!cfg.block(id).instrs.is_empty());
        }
        cfg.check().unwrap();
    }
}
