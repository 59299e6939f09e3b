// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! End-to-end compilation benchmarks.
//!
//! Run with: cargo bench --bench compile

use basalt_compiler::ast::{Expr, Location, Module, Operator, Stmt};
use basalt_compiler::{CompileOptions, OptimizeLevel, compile};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

fn at(line: i32) -> Location {
    Location::new(line, 0, line, 20)
}

/// `n` functions, each with a loop, a branch and a call.
fn synthetic_module(n: usize) -> Module {
    let mut body = Vec::with_capacity(n);
    for i in 0..n {
        let line = (i * 6 + 1) as i32;
        let total = || Expr::name("total", at(line + 3));
        let step = Stmt::if_(
            Expr::name("item", at(line + 2)),
            vec![Stmt::assign(
                total(),
                Expr::binop(total(), Operator::Add, Expr::name("item", at(line + 3)), at(line + 3)),
                at(line + 3),
            )],
            vec![Stmt::brk(at(line + 4))],
            at(line + 2),
        );
        body.push(Stmt::function(
            &format!("f{i}"),
            &["items"],
            vec![
                Stmt::assign(total(), Expr::constant(0i64, at(line + 1)), at(line + 1)),
                Stmt::for_(
                    Expr::name("item", at(line + 2)),
                    Expr::call(
                        Expr::name("iter", at(line + 2)),
                        vec![Expr::name("items", at(line + 2))],
                        at(line + 2),
                    ),
                    vec![step],
                    at(line + 2),
                ),
                Stmt::ret(Some(total()), at(line + 5)),
            ],
            at(line),
        ));
    }
    Module { body }
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    for size in [1usize, 16, 128] {
        let module = synthetic_module(size);
        for level in [OptimizeLevel::None, OptimizeLevel::Basic] {
            let options = CompileOptions::new().with_optimize(level);
            group.bench_with_input(
                BenchmarkId::new(format!("O{}", level.level()), size),
                &module,
                |b, module| {
                    b.iter(|| compile(black_box(module), &options).unwrap());
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
