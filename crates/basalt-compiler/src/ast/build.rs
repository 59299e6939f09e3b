// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Shorthand constructors for building trees by hand.

use super::*;

impl Expr {
    /// Creates an expression.
    pub fn new(kind: ExprKind, location: Location) -> Self {
        Self { kind, location }
    }

    /// A name reference.
    pub fn name(id: &str, location: Location) -> Self {
        Self::new(ExprKind::Name(id.to_string()), location)
    }

    /// A literal.
    pub fn constant(value: impl Into<Constant>, location: Location) -> Self {
        Self::new(ExprKind::Constant(value.into()), location)
    }

    /// `func(args...)`
    pub fn call(func: Expr, args: Vec<Expr>, location: Location) -> Self {
        Self::new(
            ExprKind::Call {
                func: Box::new(func),
                args,
                keywords: Vec::new(),
            },
            location,
        )
    }

    /// `value.attr`
    pub fn attribute(value: Expr, attr: &str, location: Location) -> Self {
        Self::new(
            ExprKind::Attribute {
                value: Box::new(value),
                attr: attr.to_string(),
            },
            location,
        )
    }

    /// `left op right`
    pub fn binop(left: Expr, op: Operator, right: Expr, location: Location) -> Self {
        Self::new(
            ExprKind::BinOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            location,
        )
    }

    /// A single comparison.
    pub fn compare(left: Expr, op: CmpOperator, right: Expr, location: Location) -> Self {
        Self::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops: vec![op],
                comparators: vec![right],
            },
            location,
        )
    }

    /// `a and b ...` / `a or b ...`
    pub fn bool_op(op: BoolOperator, values: Vec<Expr>, location: Location) -> Self {
        Self::new(ExprKind::BoolOp { op, values }, location)
    }

    /// `not operand`
    pub fn not(operand: Expr, location: Location) -> Self {
        Self::new(
            ExprKind::UnaryOp {
                op: UnaryOperator::Not,
                operand: Box::new(operand),
            },
            location,
        )
    }

    /// `(a, b, ...)`
    pub fn tuple(elts: Vec<Expr>, location: Location) -> Self {
        Self::new(ExprKind::Tuple(elts), location)
    }

    /// `[a, b, ...]`
    pub fn list(elts: Vec<Expr>, location: Location) -> Self {
        Self::new(ExprKind::List(elts), location)
    }

    /// `value[index]`
    pub fn subscript(value: Expr, index: Expr, location: Location) -> Self {
        Self::new(
            ExprKind::Subscript {
                value: Box::new(value),
                slice: Box::new(index),
            },
            location,
        )
    }
}

impl Stmt {
    /// Creates a statement.
    pub fn new(kind: StmtKind, location: Location) -> Self {
        Self { kind, location }
    }

    /// An expression statement spanning the expression.
    pub fn expr(value: Expr) -> Self {
        let location = value.location;
        Self::new(StmtKind::Expr(value), location)
    }

    /// `target = value`
    pub fn assign(target: Expr, value: Expr, location: Location) -> Self {
        Self::new(
            StmtKind::Assign {
                targets: vec![target],
                value,
            },
            location,
        )
    }

    /// `return [value]`
    pub fn ret(value: Option<Expr>, location: Location) -> Self {
        Self::new(StmtKind::Return(value), location)
    }

    /// `if test: body else: orelse`
    pub fn if_(test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt>, location: Location) -> Self {
        Self::new(StmtKind::If { test, body, orelse }, location)
    }

    /// `while test: body`
    pub fn while_(test: Expr, body: Vec<Stmt>, location: Location) -> Self {
        Self::new(
            StmtKind::While {
                test,
                body,
                orelse: Vec::new(),
            },
            location,
        )
    }

    /// `for target in iter: body`
    pub fn for_(target: Expr, iter: Expr, body: Vec<Stmt>, location: Location) -> Self {
        Self::new(
            StmtKind::For {
                target,
                iter,
                body,
                orelse: Vec::new(),
                is_async: false,
            },
            location,
        )
    }

    /// `try: body finally: finalbody`
    pub fn try_finally(body: Vec<Stmt>, finalbody: Vec<Stmt>, location: Location) -> Self {
        Self::new(
            StmtKind::Try {
                body,
                handlers: Vec::new(),
                orelse: Vec::new(),
                finalbody,
            },
            location,
        )
    }

    /// `with context_expr [as target]: body`
    pub fn with(
        context_expr: Expr,
        target: Option<Expr>,
        body: Vec<Stmt>,
        location: Location,
    ) -> Self {
        Self::new(
            StmtKind::With {
                items: vec![WithItem {
                    context_expr,
                    optional_vars: target,
                }],
                body,
                is_async: false,
            },
            location,
        )
    }

    /// `def name(params): body` with plain positional parameters.
    pub fn function(name: &str, params: &[&str], body: Vec<Stmt>, location: Location) -> Self {
        let args = Arguments {
            args: params
                .iter()
                .map(|p| Arg {
                    name: p.to_string(),
                    annotation: None,
                    location,
                })
                .collect(),
            ..Arguments::default()
        };
        Self::new(
            StmtKind::FunctionDef(FunctionDef {
                name: name.to_string(),
                args,
                body,
                decorators: Vec::new(),
                returns: None,
                is_async: false,
            }),
            location,
        )
    }

    /// `pass`
    pub fn pass(location: Location) -> Self {
        Self::new(StmtKind::Pass, location)
    }

    /// `break`
    pub fn brk(location: Location) -> Self {
        Self::new(StmtKind::Break, location)
    }

    /// `continue`
    pub fn cont(location: Location) -> Self {
        Self::new(StmtKind::Continue, location)
    }
}

impl Pattern {
    /// Creates a pattern.
    pub fn new(kind: PatternKind, location: Location) -> Self {
        Self { kind, location }
    }

    /// `_`
    pub fn wildcard(location: Location) -> Self {
        Self::new(
            PatternKind::MatchAs {
                pattern: None,
                name: None,
            },
            location,
        )
    }

    /// A bare capture.
    pub fn capture(name: &str, location: Location) -> Self {
        Self::new(
            PatternKind::MatchAs {
                pattern: None,
                name: Some(name.to_string()),
            },
            location,
        )
    }

    /// A literal value pattern.
    pub fn value(value: Expr) -> Self {
        let location = value.location;
        Self::new(PatternKind::MatchValue(value), location)
    }
}
