// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Flattened listing tests
//!
//! Drives the optimizer and assembler through the text form, the same way
//! the command-line front end does.

use basalt_compiler::compiler::assemble::decode_exception_table;
use basalt_compiler::compiler::dis::decode;
use basalt_compiler::compiler::flat::{self, FlatItem, FlatListing};
use basalt_compiler::compiler::flowgraph::PassConfig;
use basalt_compiler::compiler::{AnyOp, PseudoOp};
use basalt_compiler::{CompileOptions, Opcode, OptimizeLevel};
use pretty_assertions::assert_eq;

const LOOP: &str = "\
.const 0
.const None
.name i
.name n
RESUME 0 @ 1
LOAD_CONST 0 @ 1
STORE_NAME 0 @ 1
label 0:
LOAD_NAME 0 @ 2
LOAD_NAME 1 @ 2
COMPARE_OP 0 @ 2
POP_JUMP_IF_FALSE 1 @ 2
JUMP 0 @ 3
label 1:
RETURN_CONST 1 @ 4
";

const PROTECTED_CALL: &str = "\
.const None
.name f
RESUME 0 @ 1
SETUP_FINALLY 0 @ 1
PUSH_NULL @ 2
LOAD_NAME 0 @ 2
CALL 0 @ 2
POP_TOP @ 2
POP_BLOCK @ 2
RETURN_CONST 0 @ 2
label 0:
PUSH_EXC_INFO @ 3
POP_TOP @ 3
POP_EXCEPT @ 3
RETURN_CONST 0 @ 3
";

fn optimize_text(text: &str) -> String {
    let listing = flat::parse_listing(text).unwrap();
    let (items, consts) =
        flat::optimize(&listing.items, listing.consts, listing.varnames.len()).unwrap();
    flat::format_listing(&FlatListing {
        items,
        consts,
        names: listing.names,
        varnames: listing.varnames,
    })
}

fn ops(items: &[FlatItem]) -> Vec<AnyOp> {
    items
        .iter()
        .filter_map(|item| match item {
            FlatItem::Instr { op, .. } => Some(*op),
            FlatItem::Label(_) => None,
        })
        .collect()
}

#[test]
fn test_optimizer_is_idempotent_on_text() {
    let once = optimize_text(LOOP);
    let twice = optimize_text(&once);
    assert_eq!(twice, once);
}

#[test]
fn test_loop_keeps_its_back_edge() {
    let once = optimize_text(LOOP);
    let listing = flat::parse_listing(&once).unwrap();
    let ops = ops(&listing.items);
    assert!(ops.contains(&AnyOp::Real(Opcode::CompareOp)));
    assert!(ops.contains(&AnyOp::Pseudo(PseudoOp::Jump)));
    assert!(listing.items.iter().any(|item| matches!(item, FlatItem::Label(_))));
}

#[test]
fn test_level_zero_leaves_branches_alone() {
    let listing = flat::parse_listing(LOOP).unwrap();
    let options = CompileOptions::new().with_optimize(OptimizeLevel::None);
    let (items, consts) = flat::optimize_with(
        &listing.items,
        listing.consts.clone(),
        0,
        &PassConfig::from_options(&options),
    )
    .unwrap();
    assert_eq!(consts, listing.consts);
    assert_eq!(ops(&items), ops(&listing.items));
}

#[test]
fn test_assembled_handler_is_in_exception_table() {
    let listing = flat::parse_listing(PROTECTED_CALL).unwrap();
    let code = flat::assemble(&listing, &PassConfig::default()).unwrap();
    assert_eq!(code.stacksize, 2);

    let instrs = decode(&code.code).unwrap();
    let handler = instrs
        .iter()
        .find(|i| i.op == Opcode::PushExcInfo)
        .expect("handler present");

    let entries = decode_exception_table(&code.exceptiontable).unwrap();
    assert!(!entries.is_empty());
    for entry in entries {
        assert_eq!(entry.target, handler.start);
        assert_eq!(entry.depth, 0);
        assert!(!entry.lasti);
    }
}

#[test]
fn test_parse_error_is_reported_with_line() {
    let err = flat::parse_listing(".const None\nRETURN_CONST zero @ 1\n").unwrap_err();
    assert_eq!(err.line, 2);
    assert_eq!(err.to_string(), "line 2: invalid operand \"zero\"");
}
