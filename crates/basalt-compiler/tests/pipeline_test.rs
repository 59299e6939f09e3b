// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! End-to-end compilation tests
//!
//! Compiles small modules through the whole pipeline and checks the
//! assembled artifacts by decoding them again: the instruction stream, the
//! exception table and the location table must agree with each other.

use basalt_compiler::ast::*;
use basalt_compiler::compiler::assemble::{decode_exception_table, decode_linetable};
use basalt_compiler::compiler::dis::{DecodedInstr, decode, disassemble, jump_target};
use basalt_compiler::{CodeFlags, CodeObject, CompileOptions, Constant, Opcode, OptimizeLevel, compile};
use pretty_assertions::assert_eq;
use std::collections::HashMap;

fn loc(line: i32) -> Location {
    Location::new(line, 0, line, 8)
}

fn name(id: &str, line: i32) -> Expr {
    Expr::name(id, loc(line))
}

fn call(func: &str, args: Vec<Expr>, line: i32) -> Expr {
    Expr::call(name(func, line), args, loc(line))
}

fn compile_module(body: Vec<Stmt>, optimize: OptimizeLevel) -> CodeObject {
    let module = Module { body };
    let options = CompileOptions::new()
        .with_filename("pipeline.py")
        .with_optimize(optimize);
    compile(&module, &options).unwrap().code
}

fn all_code_objects(code: &CodeObject) -> Vec<&CodeObject> {
    let mut out = vec![code];
    for child in code.nested() {
        out.extend(all_code_objects(child));
    }
    out
}

/// Replays the operand stack over the decoded instructions, following
/// jumps and exception handlers, and returns the deepest point reached.
fn simulate_stack(code: &CodeObject) -> u32 {
    let instrs = decode(&code.code).unwrap();
    let by_start: HashMap<u32, usize> = instrs
        .iter()
        .enumerate()
        .map(|(i, instr)| (instr.start, i))
        .collect();
    let suspends = code
        .flags
        .intersects(CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR);

    let mut depths: HashMap<usize, i32> = HashMap::new();
    let mut work = vec![(0usize, i32::from(suspends))];
    for entry in decode_exception_table(&code.exceptiontable).unwrap() {
        let handler = by_start[&entry.target];
        work.push((handler, entry.depth as i32 + 1 + i32::from(entry.lasti)));
    }

    let mut max_depth = 0;
    while let Some((start, depth)) = work.pop() {
        if let Some(&known) = depths.get(&start) {
            assert_eq!(known, depth, "{}: inconsistent depth at {start}", code.qualname);
            continue;
        }
        depths.insert(start, depth);
        max_depth = max_depth.max(depth);

        let DecodedInstr { offset, op, arg, .. } = instrs[start];
        assert!(depth >= 0, "{}: negative depth", code.qualname);
        let next = depth + op.stack_effect(arg, false).unwrap();
        assert!(next >= 0, "{}: stack underflow at {}", code.qualname, op.name());
        max_depth = max_depth.max(next);

        if let Some(target) = jump_target(offset, op, arg) {
            let jumped = depth + op.stack_effect(arg, true).unwrap();
            max_depth = max_depth.max(jumped);
            work.push((by_start[&target], jumped));
        }
        let falls_through = !op.is_scope_exit() && !op.is_unconditional_jump();
        if falls_through && start + 1 < instrs.len() {
            work.push((start + 1, next));
        }
    }
    max_depth as u32
}

fn check_artifact(code: &CodeObject) {
    let units = (code.code.len() / 2) as u32;

    assert!(
        simulate_stack(code) <= code.stacksize,
        "{}: stack exceeds declared size {}",
        code.qualname,
        code.stacksize
    );

    for entry in decode_exception_table(&code.exceptiontable).unwrap() {
        assert!(entry.start < entry.end, "{}: empty handler range", code.qualname);
        assert!(entry.end <= units);
        assert!(entry.target < units);
    }

    let locations = decode_linetable(&code.linetable, code.firstlineno).unwrap();
    assert_eq!(locations.len() as u32, units, "{}: one location per unit", code.qualname);

    let listing = disassemble(code).unwrap();
    assert!(listing.contains(&code.qualname));
}

fn sample_programs() -> Vec<Vec<Stmt>> {
    let closure = vec![Stmt::function(
        "outer",
        &["x"],
        vec![
            Stmt::function("inner", &["y"], vec![Stmt::ret(
                Some(Expr::binop(name("x", 3), Operator::Add, name("y", 3), loc(3))),
                loc(3),
            )], loc(2)),
            Stmt::ret(Some(name("inner", 4)), loc(4)),
        ],
        loc(1),
    )];

    let try_except = vec![Stmt::new(
        StmtKind::Try {
            body: vec![Stmt::expr(call("risky", vec![], 2))],
            handlers: vec![ExceptHandler {
                typ: Some(name("ValueError", 3)),
                name: Some("err".into()),
                body: vec![Stmt::expr(call("log", vec![name("err", 4)], 4))],
                location: loc(3),
            }],
            orelse: vec![Stmt::expr(call("ok", vec![], 6))],
            finalbody: vec![Stmt::expr(call("cleanup", vec![], 8))],
        },
        loc(1),
    )];

    let loop_with = vec![Stmt::for_(
        name("item", 1),
        call("items", vec![], 1),
        vec![Stmt::with(
            call("lock", vec![], 2),
            Some(name("handle", 2)),
            vec![Stmt::if_(
                name("item", 3),
                vec![Stmt::brk(loc(4))],
                vec![Stmt::cont(loc(6))],
                loc(3),
            )],
            loc(2),
        )],
        loc(1),
    )];

    let generator = vec![Stmt::function(
        "numbers",
        &["n"],
        vec![Stmt::while_(
            name("n", 2),
            vec![
                Stmt::expr(Expr::new(ExprKind::Yield(Some(Box::new(name("n", 3)))), loc(3))),
                Stmt::new(
                    StmtKind::AugAssign {
                        target: name("n", 4),
                        op: Operator::Sub,
                        value: Expr::constant(1i64, loc(4)),
                    },
                    loc(4),
                ),
            ],
            loc(2),
        )],
        loc(1),
    )];

    let mut coroutine_def = Stmt::function(
        "fetch",
        &["url"],
        vec![Stmt::ret(
            Some(Expr::new(
                ExprKind::Await(Box::new(call("get", vec![name("url", 2)], 2))),
                loc(2),
            )),
            loc(2),
        )],
        loc(1),
    );
    if let StmtKind::FunctionDef(def) = &mut coroutine_def.kind {
        def.is_async = true;
    }

    let comprehension = vec![Stmt::assign(
        name("squares", 1),
        Expr::new(
            ExprKind::DictComp {
                key: Box::new(name("k", 1)),
                value: Box::new(Expr::binop(name("k", 1), Operator::Mult, name("k", 1), loc(1))),
                generators: vec![Comprehension {
                    target: name("k", 1),
                    iter: call("range", vec![Expr::constant(10i64, loc(1))], 1),
                    ifs: vec![name("k", 1)],
                    is_async: false,
                }],
            },
            loc(1),
        ),
        loc(1),
    )];

    let matching = vec![Stmt::new(
        StmtKind::Match {
            subject: name("command", 1),
            cases: vec![
                MatchCase {
                    pattern: Pattern::new(
                        PatternKind::MatchSequence(vec![
                            Pattern::value(Expr::constant("go", loc(2))),
                            Pattern::capture("direction", loc(2)),
                        ]),
                        loc(2),
                    ),
                    guard: None,
                    body: vec![Stmt::expr(call("go", vec![name("direction", 3)], 3))],
                },
                MatchCase {
                    pattern: Pattern::new(
                        PatternKind::MatchOr(vec![
                            Pattern::value(Expr::constant("quit", loc(4))),
                            Pattern::value(Expr::constant("exit", loc(4))),
                        ]),
                        loc(4),
                    ),
                    guard: Some(name("allowed", 4)),
                    body: vec![Stmt::expr(call("stop", vec![], 5))],
                },
                MatchCase {
                    pattern: Pattern::wildcard(loc(6)),
                    guard: None,
                    body: vec![Stmt::pass(loc(7))],
                },
            ],
        },
        loc(1),
    )];

    vec![
        closure,
        try_except,
        loop_with,
        generator,
        vec![coroutine_def],
        comprehension,
        matching,
    ]
}

#[test]
fn test_artifacts_are_self_consistent() {
    for level in [OptimizeLevel::None, OptimizeLevel::Basic, OptimizeLevel::Full] {
        for body in sample_programs() {
            let module = compile_module(body, level);
            for code in all_code_objects(&module) {
                check_artifact(code);
            }
        }
    }
}

#[test]
fn test_closure_shape() {
    let module = compile_module(sample_programs().remove(0), OptimizeLevel::Basic);
    let outer = module.nested().next().unwrap();
    let inner = outer.nested().next().unwrap();

    assert_eq!(outer.cellvars(), vec!["x"]);
    assert_eq!(inner.freevars(), vec!["x"]);
    assert_eq!(inner.qualname, "outer.<locals>.inner");

    let outer_ops: Vec<Opcode> = decode(&outer.code).unwrap().into_iter().map(|i| i.op).collect();
    let make_function = decode(&outer.code)
        .unwrap()
        .into_iter()
        .find(|i| i.op == Opcode::MakeFunction)
        .unwrap();
    assert_eq!(make_function.arg & 0x08, 0x08);
    assert!(outer_ops.contains(&Opcode::BuildTuple));
    assert_eq!(decode(&inner.code).unwrap()[0].op, Opcode::CopyFreeVars);
}

#[test]
fn test_coroutine_flags() {
    let module = compile_module(sample_programs().remove(4), OptimizeLevel::Basic);
    let fetch = module.nested().next().unwrap();
    assert!(fetch.flags.contains(CodeFlags::COROUTINE));
    let ops: Vec<Opcode> = decode(&fetch.code).unwrap().into_iter().map(|i| i.op).collect();
    assert_eq!(ops[0], Opcode::ReturnGenerator);
    assert!(ops.contains(&Opcode::GetAwaitable));
    assert!(ops.contains(&Opcode::Send));
}

#[test]
fn test_constant_folding_in_module() {
    let body = vec![Stmt::assign(
        name("pair", 1),
        Expr::tuple(
            vec![Expr::constant(1i64, loc(1)), Expr::constant(2i64, loc(1))],
            loc(1),
        ),
        loc(1),
    )];
    let module = compile_module(body, OptimizeLevel::Basic);
    let pair = Constant::tuple(vec![Constant::from(1i64), Constant::from(2i64)]);
    assert!(module.consts.contains(&pair));
    let ops: Vec<Opcode> = decode(&module.code).unwrap().into_iter().map(|i| i.op).collect();
    assert!(!ops.contains(&Opcode::BuildTuple));
}

#[test]
fn test_compile_errors_report_location() {
    let module = Module {
        body: vec![Stmt::brk(Location::new(7, 4, 7, 9))],
    };
    let options = CompileOptions::new().with_filename("broken.py");
    let err = compile(&module, &options).unwrap_err();
    assert!(err.is_source_error());
    assert_eq!(err.location(), Some(Location::new(7, 4, 7, 9)));
    assert_eq!(
        err.to_string(),
        "SyntaxError: 'break' outside loop (broken.py, line 7, column 5)"
    );
}
