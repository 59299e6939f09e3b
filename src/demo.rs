// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The built-in sample module compiled by `basalt demo`.
//!
//! Equivalent source:
//!
//! ```text
//! def make_adder(base):
//!     def add(x):
//!         return x + base
//!     return add
//!
//! for i in range(3):
//!     try:
//!         print(make_adder(i)(i))
//!     finally:
//!         done = True
//! ```

use basalt_compiler::ast::{Expr, Location, Module, Operator, Stmt};

fn at(line: i32, col: i32, end_col: i32) -> Location {
    Location::new(line, col, line, end_col)
}

/// Builds the sample module.
pub fn sample_module() -> Module {
    let add = Stmt::function(
        "add",
        &["x"],
        vec![Stmt::ret(
            Some(Expr::binop(
                Expr::name("x", at(3, 15, 16)),
                Operator::Add,
                Expr::name("base", at(3, 19, 23)),
                at(3, 15, 23),
            )),
            at(3, 8, 23),
        )],
        at(2, 4, 23),
    );
    let make_adder = Stmt::function(
        "make_adder",
        &["base"],
        vec![
            add,
            Stmt::ret(Some(Expr::name("add", at(4, 11, 14))), at(4, 4, 14)),
        ],
        at(1, 0, 14),
    );

    let adder = Expr::call(
        Expr::name("make_adder", at(8, 14, 24)),
        vec![Expr::name("i", at(8, 25, 26))],
        at(8, 14, 27),
    );
    let applied = Expr::call(adder, vec![Expr::name("i", at(8, 28, 29))], at(8, 14, 30));
    let print = Expr::call(Expr::name("print", at(8, 8, 13)), vec![applied], at(8, 8, 31));
    let guarded = Stmt::try_finally(
        vec![Stmt::expr(print)],
        vec![Stmt::assign(
            Expr::name("done", at(10, 8, 12)),
            Expr::constant(true, at(10, 15, 19)),
            at(10, 8, 19),
        )],
        at(7, 4, 19),
    );
    let range = Expr::call(
        Expr::name("range", at(6, 9, 14)),
        vec![Expr::constant(3i64, at(6, 15, 16))],
        at(6, 9, 17),
    );
    let loop_ = Stmt::for_(Expr::name("i", at(6, 4, 5)), range, vec![guarded], at(6, 0, 17));

    Module {
        body: vec![make_adder, loop_],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_compiler::{CompileOptions, compile};

    #[test]
    fn test_sample_module_compiles() {
        let output = compile(&sample_module(), &CompileOptions::default()).unwrap();
        assert!(output.warnings.is_empty());
        assert_eq!(output.code.nested().count(), 1);
    }
}
