// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Flattened instruction listings.
//!
//! A listing is a sequence of label markers and instructions, where a jump's
//! operand is the number of the label it targets. It lets the graph builder,
//! the optimizer and the assembler be driven without an AST.
//!
//! The text form has one item per line:
//!
//! ```text
//! .const None
//! .name x
//! LOAD_NAME 0 @ 1:0-1
//! POP_JUMP_IF_FALSE 0 @ 1
//! label 0:
//! RETURN_CONST 0 @ 2
//! ```
//!
//! Locations are written `line[-end_line][:col[-end_col]]`; an instruction
//! without `@` has no location. `.const`, `.name` and `.local` lines fill the
//! constant, name and local tables in order. Lines starting with `#` are
//! comments.

use std::fmt::Write;
use std::str::FromStr;

use num_bigint::BigInt;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::ast::Location;
use crate::compiler::assemble::{UnitMetadata, assemble as assemble_cfg};
use crate::compiler::cfg::{BlockId, Cfg, Label};
use crate::compiler::code::CodeObject;
use crate::compiler::flowgraph::{PassConfig, UnitShape, optimize_code_unit};
use crate::compiler::opcode::AnyOp;
use crate::constant::{ConstCache, Constant};
use crate::error::Result;

/// One element of a flattened listing.
#[derive(Debug, Clone, PartialEq)]
pub enum FlatItem {
    /// Binds label `n` to the next instruction
    Label(u32),
    /// An instruction; for jumps `arg` is a label number
    Instr {
        /// Operation
        op: AnyOp,
        /// Operand or label number
        arg: u32,
        /// Source range
        loc: Location,
    },
}

impl FlatItem {
    /// Shorthand for an instruction item.
    pub fn instr(op: impl Into<AnyOp>, arg: u32, loc: Location) -> Self {
        FlatItem::Instr {
            op: op.into(),
            arg,
            loc,
        }
    }
}

/// A listing together with the tables its operands index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatListing {
    /// Labels and instructions
    pub items: Vec<FlatItem>,
    /// Constant table
    pub consts: Vec<Constant>,
    /// Name table
    pub names: Vec<String>,
    /// Fast locals
    pub varnames: Vec<String>,
}

/// A malformed line in a text listing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct FlatParseError {
    /// 1-based line number
    pub line: usize,
    /// What was wrong with it
    pub message: String,
}

impl FlatParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl Cfg {
    /// Builds a graph from a listing, resolving every label.
    pub fn from_flat(items: &[FlatItem]) -> Result<Cfg> {
        let mut cfg = Cfg::new();
        let mut labels: FxHashMap<u32, Label> = FxHashMap::default();
        let mut label_for = |cfg: &mut Cfg, n: u32| *labels.entry(n).or_insert_with(|| cfg.new_label());
        for item in items {
            match *item {
                FlatItem::Label(n) => {
                    let label = label_for(&mut cfg, n);
                    cfg.use_label(label)?;
                }
                FlatItem::Instr { op, arg, loc } if op.has_target() => {
                    let label = label_for(&mut cfg, arg);
                    cfg.add_jump(op, label, loc)?;
                }
                FlatItem::Instr { op, arg, loc } => cfg.addop(op, arg, loc)?,
            }
        }
        cfg.translate_labels()?;
        Ok(cfg)
    }

    /// Flattens the graph in layout order.
    ///
    /// A block gets a label when something jumps to it or when its layout
    /// predecessor does not end in a terminator (otherwise the boundary
    /// would be lost). Labels are numbered in block order.
    pub fn to_flat(&self) -> Vec<FlatItem> {
        let order = self.order();
        let referenced = self.referenced_blocks();
        let mut numbers: FxHashMap<BlockId, u32> = FxHashMap::default();
        let mut prev_terminated = true;
        for &id in &order {
            if referenced[id.index()] || !prev_terminated {
                let n = numbers.len() as u32;
                numbers.insert(id, n);
            }
            let block = self.block(id);
            if !block.instrs.is_empty() {
                prev_terminated = block.is_terminated();
            }
        }

        let mut items = Vec::with_capacity(self.instr_count() + numbers.len());
        for &id in &order {
            if let Some(&n) = numbers.get(&id) {
                items.push(FlatItem::Label(n));
            }
            for instr in &self.block(id).instrs {
                let arg = instr
                    .target
                    .and_then(|target| numbers.get(&target).copied())
                    .unwrap_or(instr.arg);
                items.push(FlatItem::Instr {
                    op: instr.op,
                    arg,
                    loc: instr.loc,
                });
            }
        }
        items
    }
}

fn first_line(items: &[FlatItem]) -> i32 {
    items
        .iter()
        .find_map(|item| match item {
            FlatItem::Instr { loc, .. } if loc.line > 0 => Some(loc.line),
            _ => None,
        })
        .unwrap_or(1)
}

/// Runs the optimizer pipeline on a listing with the given pass settings.
///
/// Returns the optimized listing and the compacted constant table.
pub fn optimize_with(
    items: &[FlatItem],
    mut consts: Vec<Constant>,
    nlocals: usize,
    config: &PassConfig,
) -> Result<(Vec<FlatItem>, Vec<Constant>)> {
    let mut cfg = Cfg::from_flat(items)?;
    let mut cache = ConstCache::new();
    let shape = UnitShape {
        nlocals,
        nparams: 0,
        firstlineno: first_line(items),
    };
    optimize_code_unit(&mut cfg, &mut consts, &mut cache, shape, config)?;
    Ok((cfg.to_flat(), consts))
}

/// Runs the optimizer pipeline on a listing with default settings.
pub fn optimize(
    items: &[FlatItem],
    consts: Vec<Constant>,
    nlocals: usize,
) -> Result<(Vec<FlatItem>, Vec<Constant>)> {
    optimize_with(items, consts, nlocals, &PassConfig::default())
}

/// Optimizes and assembles a listing into a code object.
pub fn assemble(listing: &FlatListing, config: &PassConfig) -> Result<CodeObject> {
    let mut cfg = Cfg::from_flat(&listing.items)?;
    let mut consts = listing.consts.clone();
    let mut cache = ConstCache::new();
    let firstlineno = first_line(&listing.items);
    let shape = UnitShape {
        nlocals: listing.varnames.len(),
        nparams: 0,
        firstlineno,
    };
    optimize_code_unit(&mut cfg, &mut consts, &mut cache, shape, config)?;
    let meta = UnitMetadata {
        name: "<listing>".into(),
        qualname: "<listing>".into(),
        filename: "<listing>".into(),
        firstlineno,
        names: listing.names.clone(),
        varnames: listing.varnames.clone(),
        ..UnitMetadata::default()
    };
    assemble_cfg(cfg, consts, &meta)
}

fn parse_num<T: FromStr>(text: &str, line: usize, what: &str) -> std::result::Result<T, FlatParseError> {
    text.trim()
        .parse()
        .map_err(|_| FlatParseError::new(line, format!("invalid {what} {text:?}")))
}

fn parse_location(text: &str, line: usize) -> std::result::Result<Location, FlatParseError> {
    let (lines, cols) = match text.split_once(':') {
        Some((lines, cols)) => (lines, Some(cols)),
        None => (text, None),
    };
    let (start, end) = match lines.split_once('-') {
        Some((start, end)) => {
            let start: i32 = parse_num(start, line, "line")?;
            let end: i32 = parse_num(end, line, "end line")?;
            if end < start {
                return Err(FlatParseError::new(
                    line,
                    format!("end line {end} precedes line {start}"),
                ));
            }
            (start, end)
        }
        None => {
            let start = parse_num(lines, line, "line")?;
            (start, start)
        }
    };
    let (col, end_col) = match cols.map(|c| c.split_once('-').unwrap_or((c, ""))) {
        Some((col, "")) => (parse_num(col, line, "column")?, -1),
        Some((col, end)) => (
            parse_num(col, line, "column")?,
            parse_num(end, line, "end column")?,
        ),
        None => (-1, -1),
    };
    Ok(Location::new(start, col, end, end_col))
}

fn parse_constant(text: &str, line: usize) -> std::result::Result<Constant, FlatParseError> {
    let text = text.trim();
    match text {
        "None" => return Ok(Constant::None),
        "True" => return Ok(Constant::Bool(true)),
        "False" => return Ok(Constant::Bool(false)),
        "Ellipsis" | "..." => return Ok(Constant::Ellipsis),
        _ => {}
    }
    if let Some(body) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        let mut value = String::with_capacity(body.len());
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                value.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('r') => value.push('\r'),
                Some(other) => value.push(other),
                None => return Err(FlatParseError::new(line, "dangling escape in string")),
            }
        }
        return Ok(Constant::str(&value));
    }
    if let Ok(int) = text.parse::<BigInt>() {
        return Ok(Constant::Int(int));
    }
    if let Ok(float) = text.parse::<f64>() {
        return Ok(Constant::Float(float));
    }
    Err(FlatParseError::new(line, format!("unsupported constant {text:?}")))
}

/// Parses the text form of a listing.
pub fn parse_listing(text: &str) -> std::result::Result<FlatListing, FlatParseError> {
    let mut listing = FlatListing::default();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let content = raw.trim();
        if content.is_empty() || content.starts_with('#') {
            continue;
        }
        if let Some(rest) = content.strip_prefix(".const") {
            listing.consts.push(parse_constant(rest, line)?);
            continue;
        }
        if let Some(rest) = content.strip_prefix(".name") {
            listing.names.push(rest.trim().to_string());
            continue;
        }
        if let Some(rest) = content.strip_prefix(".local") {
            listing.varnames.push(rest.trim().to_string());
            continue;
        }
        if let Some(rest) = content.strip_prefix("label") {
            let number = rest
                .trim()
                .strip_suffix(':')
                .ok_or_else(|| FlatParseError::new(line, "label must end with ':'"))?;
            listing
                .items
                .push(FlatItem::Label(parse_num(number, line, "label")?));
            continue;
        }

        let (code, loc) = match content.split_once('@') {
            Some((code, loc)) => (code, parse_location(loc.trim(), line)?),
            None => (content, Location::NONE),
        };
        let mut words = code.split_whitespace();
        let name = words
            .next()
            .ok_or_else(|| FlatParseError::new(line, "missing opcode"))?;
        let op = AnyOp::from_name(name)
            .ok_or_else(|| FlatParseError::new(line, format!("unknown opcode {name}")))?;
        let arg = match words.next() {
            Some(word) => parse_num(word, line, "operand")?,
            None if op.has_target() => {
                return Err(FlatParseError::new(line, format!("{name} needs a label")));
            }
            None => 0,
        };
        if let Some(extra) = words.next() {
            return Err(FlatParseError::new(line, format!("unexpected {extra:?}")));
        }
        listing.items.push(FlatItem::Instr { op, arg, loc });
    }
    Ok(listing)
}

fn format_location(loc: &Location) -> Option<String> {
    if loc.line < 0 {
        return None;
    }
    let mut text = loc.line.to_string();
    if loc.end_line != loc.line {
        let _ = write!(text, "-{}", loc.end_line);
    }
    if loc.col >= 0 {
        let _ = write!(text, ":{}", loc.col);
        if loc.end_col >= 0 {
            let _ = write!(text, "-{}", loc.end_col);
        }
    }
    Some(text)
}

/// Formats a single listing item.
pub fn format_item(item: &FlatItem) -> String {
    match item {
        FlatItem::Label(n) => format!("label {n}:"),
        FlatItem::Instr { op, arg, loc } => {
            let mut text = op.name().to_string();
            if op.has_arg() || op.has_target() || *arg != 0 {
                let _ = write!(text, " {arg}");
            }
            if let Some(loc) = format_location(loc) {
                let _ = write!(text, " @ {loc}");
            }
            text
        }
    }
}

/// Prints a listing in the form [`parse_listing`] reads.
pub fn format_listing(listing: &FlatListing) -> String {
    let mut out = String::new();
    for constant in &listing.consts {
        let _ = writeln!(out, ".const {constant}");
    }
    for name in &listing.names {
        let _ = writeln!(out, ".name {name}");
    }
    for name in &listing.varnames {
        let _ = writeln!(out, ".local {name}");
    }
    for item in &listing.items {
        out.push_str(&format_item(item));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::opcode::{Opcode, PseudoOp};

    const BRANCH: &str = "\
.const None
.name x
.name y
LOAD_NAME 0 @ 1:3-4
POP_JUMP_IF_FALSE 0 @ 1
LOAD_CONST 0 @ 2:0-5
STORE_NAME 1 @ 2-3
label 0:
RETURN_CONST 0 @ 3
";

    #[test]
    fn test_text_round_trip() {
        let listing = parse_listing(BRANCH).unwrap();
        assert_eq!(listing.items.len(), 6);
        assert_eq!(listing.names, vec!["x", "y"]);
        assert_eq!(
            listing.items[0],
            FlatItem::instr(Opcode::LoadName, 0, Location::new(1, 3, 1, 4))
        );
        assert_eq!(
            listing.items[3],
            FlatItem::instr(Opcode::StoreName, 1, Location::new(2, -1, 3, -1))
        );
        assert_eq!(format_listing(&listing), BRANCH);
    }

    #[test]
    fn test_graph_round_trip() {
        let listing = parse_listing(BRANCH).unwrap();
        let cfg = Cfg::from_flat(&listing.items).unwrap();
        assert_eq!(cfg.order().len(), 3);
        assert_eq!(cfg.to_flat(), listing.items);
    }

    #[test]
    fn test_fallthrough_boundary_gets_label() {
        let items = vec![
            FlatItem::instr(Opcode::LoadName, 0, Location::line_only(1)),
            FlatItem::Label(7),
            FlatItem::instr(Opcode::ReturnValue, 0, Location::line_only(1)),
        ];
        let cfg = Cfg::from_flat(&items).unwrap();
        assert_eq!(cfg.order().len(), 2);
        let flat = cfg.to_flat();
        assert_eq!(flat[1], FlatItem::Label(0));
    }

    #[test]
    fn test_constant_branch_optimizes_away() {
        let text = "\
.const True
.const 1
.const 2
.const None
RESUME 0 @ 0
LOAD_CONST 0 @ 1
POP_JUMP_IF_FALSE 0 @ 1
LOAD_CONST 1 @ 2
STORE_NAME 0 @ 2
JUMP 1 @ 2
label 0:
LOAD_CONST 2 @ 4
STORE_NAME 0 @ 4
label 1:
RETURN_CONST 3 @ 4
";
        let listing = parse_listing(text).unwrap();
        let (items, consts) = optimize(&listing.items, listing.consts, 0).unwrap();
        let optimized = FlatListing {
            items,
            consts,
            ..FlatListing::default()
        };
        assert_eq!(
            format_listing(&optimized),
            "\
.const True
.const 1
.const None
RESUME 0 @ 0
NOP @ 1
LOAD_CONST 1 @ 2
STORE_NAME 0 @ 2
RETURN_CONST 2 @ 4
"
        );

        let (again, consts_again) =
            optimize(&optimized.items, optimized.consts.clone(), 0).unwrap();
        assert_eq!(again, optimized.items);
        assert_eq!(consts_again, optimized.consts);
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let err = parse_listing("NOP\nFROBNICATE 1\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("FROBNICATE"));

        let err = parse_listing("JUMP @ 1\n").unwrap_err();
        assert_eq!(err.line, 1);

        let err = parse_listing("label x:\n").unwrap_err();
        assert_eq!(err.to_string(), "line 1: invalid label \"x\"");

        let err = parse_listing("NOP\nRETURN_CONST 0 @ 5-3\n").unwrap_err();
        assert_eq!(err.to_string(), "line 2: end line 3 precedes line 5");
    }

    #[test]
    fn test_jump_items_use_label_numbers() {
        let items = vec![
            FlatItem::Label(4),
            FlatItem::instr(Opcode::LoadName, 0, Location::line_only(1)),
            FlatItem::instr(PseudoOp::PopJumpIfTrue, 4, Location::line_only(1)),
            FlatItem::instr(Opcode::ReturnConst, 0, Location::line_only(2)),
        ];
        let cfg = Cfg::from_flat(&items).unwrap();
        let flat = cfg.to_flat();
        assert_eq!(flat[0], FlatItem::Label(0));
        assert_eq!(
            flat[2],
            FlatItem::instr(PseudoOp::PopJumpIfTrue, 0, Location::line_only(1))
        );
    }

    #[test]
    fn test_assemble_listing() {
        let listing = parse_listing(BRANCH).unwrap();
        let code = assemble(&listing, &PassConfig::default()).unwrap();
        assert_eq!(code.names, vec!["x", "y"]);
        assert_eq!(code.stacksize, 1);
        assert_eq!(code.code.len() % 2, 0);
        assert!(crate::compiler::dis::disassemble(&code).unwrap().contains("LOAD_NAME"));
    }
}
