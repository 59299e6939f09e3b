// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Abstract Syntax Tree definitions.
//!
//! The tree is produced by an external front end and arrives validated. Every
//! node carries a [`Location`]; lines are 1-based and columns 0-based.

mod build;

use crate::constant::Constant;

/// A source range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// First line (1-based), negative when unknown
    pub line: i32,
    /// Last line, negative when unknown
    pub end_line: i32,
    /// First column (0-based), negative when unknown
    pub col: i32,
    /// Column just past the end, negative when unknown
    pub end_col: i32,
}

impl Location {
    /// No location at all; used for synthetic instructions.
    pub const NONE: Location = Location {
        line: -1,
        end_line: -1,
        col: -1,
        end_col: -1,
    };

    /// Creates a range `line:col .. end_line:end_col`.
    pub const fn new(line: i32, col: i32, end_line: i32, end_col: i32) -> Self {
        Self {
            line,
            end_line,
            col,
            end_col,
        }
    }

    /// A location that only knows its line.
    pub const fn line_only(line: i32) -> Self {
        Self {
            line,
            end_line: line,
            col: -1,
            end_col: -1,
        }
    }

    /// Whether the location is [`Location::NONE`].
    pub fn is_none(&self) -> bool {
        self.line < 0
    }
}

impl Default for Location {
    fn default() -> Self {
        Location::NONE
    }
}

/// A complete module.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    /// Top-level statements
    pub body: Vec<Stmt>,
}

/// A statement node.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// What kind of statement
    pub kind: StmtKind,
    /// Source range
    pub location: Location,
}

/// The statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `def` / `async def`
    FunctionDef(FunctionDef),
    /// `class`
    ClassDef(ClassDef),
    /// `return [value]`
    Return(Option<Expr>),
    /// `del a, b`
    Delete(Vec<Expr>),
    /// `a = b = value`
    Assign {
        /// Assignment targets, left to right
        targets: Vec<Expr>,
        /// Assigned value
        value: Expr,
    },
    /// `a += value`
    AugAssign {
        /// Target
        target: Expr,
        /// Operator
        op: Operator,
        /// Right-hand side
        value: Expr,
    },
    /// `target: annotation [= value]`
    AnnAssign {
        /// Target
        target: Expr,
        /// Annotation expression
        annotation: Expr,
        /// Optional value
        value: Option<Expr>,
        /// Whether the target is a bare name not in parentheses
        simple: bool,
    },
    /// `for` / `async for`
    For {
        /// Loop target
        target: Expr,
        /// Iterable
        iter: Expr,
        /// Loop body
        body: Vec<Stmt>,
        /// `else` clause
        orelse: Vec<Stmt>,
        /// Whether this is `async for`
        is_async: bool,
    },
    /// `while`
    While {
        /// Loop condition
        test: Expr,
        /// Loop body
        body: Vec<Stmt>,
        /// `else` clause
        orelse: Vec<Stmt>,
    },
    /// `if`
    If {
        /// Condition
        test: Expr,
        /// Then branch
        body: Vec<Stmt>,
        /// Else branch
        orelse: Vec<Stmt>,
    },
    /// `with` / `async with`
    With {
        /// Context managers, outermost first
        items: Vec<WithItem>,
        /// Body
        body: Vec<Stmt>,
        /// Whether this is `async with`
        is_async: bool,
    },
    /// `match`
    Match {
        /// Subject expression
        subject: Expr,
        /// Cases in order
        cases: Vec<MatchCase>,
    },
    /// `raise [exc [from cause]]`
    Raise {
        /// Exception
        exc: Option<Expr>,
        /// Explicit cause
        cause: Option<Expr>,
    },
    /// `try` with handlers, `else` and `finally`
    Try {
        /// Protected body
        body: Vec<Stmt>,
        /// `except` clauses
        handlers: Vec<ExceptHandler>,
        /// `else` clause
        orelse: Vec<Stmt>,
        /// `finally` clause
        finalbody: Vec<Stmt>,
    },
    /// `assert test[, msg]`
    Assert {
        /// Asserted condition
        test: Expr,
        /// Message
        msg: Option<Expr>,
    },
    /// `import a.b as c`
    Import(Vec<Alias>),
    /// `from .mod import a`
    ImportFrom {
        /// Module, absent for `from . import x`
        module: Option<String>,
        /// Imported names (`*` for star imports)
        names: Vec<Alias>,
        /// Number of leading dots
        level: u32,
    },
    /// `global a, b`
    Global(Vec<String>),
    /// `nonlocal a, b`
    Nonlocal(Vec<String>),
    /// Expression statement
    Expr(Expr),
    /// `pass`
    Pass,
    /// `break`
    Break,
    /// `continue`
    Continue,
}

/// A function definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    /// Function name
    pub name: String,
    /// Parameters
    pub args: Arguments,
    /// Body
    pub body: Vec<Stmt>,
    /// Decorators, outermost first
    pub decorators: Vec<Expr>,
    /// Return annotation
    pub returns: Option<Box<Expr>>,
    /// Whether this is `async def`
    pub is_async: bool,
}

/// A class definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    /// Class name
    pub name: String,
    /// Base classes
    pub bases: Vec<Expr>,
    /// Keyword arguments (e.g. `metaclass=`)
    pub keywords: Vec<Keyword>,
    /// Class body
    pub body: Vec<Stmt>,
    /// Decorators, outermost first
    pub decorators: Vec<Expr>,
}

/// A parameter list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Arguments {
    /// Positional-only parameters
    pub posonly: Vec<Arg>,
    /// Regular positional parameters
    pub args: Vec<Arg>,
    /// `*args`
    pub vararg: Option<Arg>,
    /// Keyword-only parameters
    pub kwonly: Vec<Arg>,
    /// Defaults for keyword-only parameters, parallel to `kwonly`
    pub kw_defaults: Vec<Option<Expr>>,
    /// `**kwargs`
    pub kwarg: Option<Arg>,
    /// Defaults for the trailing positional parameters
    pub defaults: Vec<Expr>,
}

impl Arguments {
    /// All parameters in slot order.
    pub fn all(&self) -> impl Iterator<Item = &Arg> {
        self.posonly
            .iter()
            .chain(&self.args)
            .chain(&self.kwonly)
            .chain(self.vararg.as_ref())
            .chain(self.kwarg.as_ref())
    }
}

/// One parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    /// Parameter name
    pub name: String,
    /// Annotation
    pub annotation: Option<Box<Expr>>,
    /// Source range
    pub location: Location,
}

/// A keyword argument in a call or class definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    /// Name, or `None` for `**mapping`
    pub arg: Option<String>,
    /// Value
    pub value: Expr,
    /// Source range
    pub location: Location,
}

/// One `with` item.
#[derive(Debug, Clone, PartialEq)]
pub struct WithItem {
    /// The context manager expression
    pub context_expr: Expr,
    /// The `as` target
    pub optional_vars: Option<Expr>,
}

/// An `except` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    /// Exception type to match, `None` for a bare `except:`
    pub typ: Option<Expr>,
    /// Name bound to the exception
    pub name: Option<String>,
    /// Handler body
    pub body: Vec<Stmt>,
    /// Source range
    pub location: Location,
}

/// An import alias.
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    /// Dotted name
    pub name: String,
    /// `as` name
    pub asname: Option<String>,
    /// Source range
    pub location: Location,
}

/// One `for ... in ... if ...` clause of a comprehension.
#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    /// Loop target
    pub target: Expr,
    /// Iterable
    pub iter: Expr,
    /// Filter conditions
    pub ifs: Vec<Expr>,
    /// Whether this is `async for`
    pub is_async: bool,
}

/// One `case` of a `match` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    /// The pattern
    pub pattern: Pattern,
    /// Optional guard
    pub guard: Option<Expr>,
    /// Case body
    pub body: Vec<Stmt>,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// What kind of expression
    pub kind: ExprKind,
    /// Source range
    pub location: Location,
}

/// The expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// `a and b`, `a or b`
    BoolOp {
        /// Operator
        op: BoolOperator,
        /// Two or more operands
        values: Vec<Expr>,
    },
    /// `target := value`
    NamedExpr {
        /// Name target
        target: Box<Expr>,
        /// Value
        value: Box<Expr>,
    },
    /// `left op right`
    BinOp {
        /// Left operand
        left: Box<Expr>,
        /// Operator
        op: Operator,
        /// Right operand
        right: Box<Expr>,
    },
    /// `op operand`
    UnaryOp {
        /// Operator
        op: UnaryOperator,
        /// Operand
        operand: Box<Expr>,
    },
    /// `lambda args: body`
    Lambda {
        /// Parameters
        args: Box<Arguments>,
        /// Body expression
        body: Box<Expr>,
    },
    /// `body if test else orelse`
    IfExp {
        /// Condition
        test: Box<Expr>,
        /// Value when true
        body: Box<Expr>,
        /// Value when false
        orelse: Box<Expr>,
    },
    /// `{k: v, **m}`
    Dict {
        /// Keys; `None` marks a `**` unpacking
        keys: Vec<Option<Expr>>,
        /// Values
        values: Vec<Expr>,
    },
    /// `{a, b}`
    Set(Vec<Expr>),
    /// `[elt for ...]`
    ListComp {
        /// Element
        elt: Box<Expr>,
        /// Clauses
        generators: Vec<Comprehension>,
    },
    /// `{elt for ...}`
    SetComp {
        /// Element
        elt: Box<Expr>,
        /// Clauses
        generators: Vec<Comprehension>,
    },
    /// `{k: v for ...}`
    DictComp {
        /// Key
        key: Box<Expr>,
        /// Value
        value: Box<Expr>,
        /// Clauses
        generators: Vec<Comprehension>,
    },
    /// `(elt for ...)`
    GeneratorExp {
        /// Element
        elt: Box<Expr>,
        /// Clauses
        generators: Vec<Comprehension>,
    },
    /// `await value`
    Await(Box<Expr>),
    /// `yield [value]`
    Yield(Option<Box<Expr>>),
    /// `yield from value`
    YieldFrom(Box<Expr>),
    /// `a < b <= c`
    Compare {
        /// Leftmost operand
        left: Box<Expr>,
        /// Operators
        ops: Vec<CmpOperator>,
        /// Remaining operands
        comparators: Vec<Expr>,
    },
    /// `func(args, kw=value)`
    Call {
        /// Callee
        func: Box<Expr>,
        /// Positional arguments (possibly starred)
        args: Vec<Expr>,
        /// Keyword arguments
        keywords: Vec<Keyword>,
    },
    /// `{value!r:spec}` inside an f-string
    FormattedValue {
        /// Formatted value
        value: Box<Expr>,
        /// Conversion
        conversion: Conversion,
        /// Format spec (a joined string)
        format_spec: Option<Box<Expr>>,
    },
    /// An f-string
    JoinedStr(Vec<Expr>),
    /// A literal
    Constant(Constant),
    /// `value.attr`
    Attribute {
        /// Object
        value: Box<Expr>,
        /// Attribute name
        attr: String,
    },
    /// `value[slice]`
    Subscript {
        /// Object
        value: Box<Expr>,
        /// Index or slice
        slice: Box<Expr>,
    },
    /// `*value`
    Starred(Box<Expr>),
    /// A name
    Name(String),
    /// `[a, b]`
    List(Vec<Expr>),
    /// `(a, b)`
    Tuple(Vec<Expr>),
    /// `lower:upper:step`
    Slice {
        /// Lower bound
        lower: Option<Box<Expr>>,
        /// Upper bound
        upper: Option<Box<Expr>>,
        /// Step
        step: Option<Box<Expr>>,
    },
}

impl Expr {
    /// The literal value, if this is a constant.
    pub fn as_constant(&self) -> Option<&Constant> {
        match &self.kind {
            ExprKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    /// Whether this is a `*value` expression.
    pub fn is_starred(&self) -> bool {
        matches!(self.kind, ExprKind::Starred(_))
    }
}

/// `and` / `or`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOperator {
    /// `and`
    And,
    /// `or`
    Or,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mult,
    /// `@`
    MatMult,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `**`
    Pow,
    /// `<<`
    LShift,
    /// `>>`
    RShift,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `&`
    BitAnd,
    /// `//`
    FloorDiv,
}

impl Operator {
    /// The `BINARY_OP` operand; in-place variants are offset by 13.
    pub fn oparg(self, inplace: bool) -> u32 {
        let base = match self {
            Operator::Add => 0,
            Operator::BitAnd => 1,
            Operator::FloorDiv => 2,
            Operator::LShift => 3,
            Operator::MatMult => 4,
            Operator::Mult => 5,
            Operator::Mod => 6,
            Operator::BitOr => 7,
            Operator::Pow => 8,
            Operator::RShift => 9,
            Operator::Sub => 10,
            Operator::Div => 11,
            Operator::BitXor => 12,
        };
        if inplace { base + 13 } else { base }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    /// `~`
    Invert,
    /// `not`
    Not,
    /// `+`
    UAdd,
    /// `-`
    USub,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOperator {
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtE,
    /// `>`
    Gt,
    /// `>=`
    GtE,
    /// `is`
    Is,
    /// `is not`
    IsNot,
    /// `in`
    In,
    /// `not in`
    NotIn,
}

/// Conversion applied by a formatted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// No conversion
    None,
    /// `!s`
    Str,
    /// `!r`
    Repr,
    /// `!a`
    Ascii,
}

/// A pattern node.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    /// What kind of pattern
    pub kind: PatternKind,
    /// Source range
    pub location: Location,
}

/// The pattern variants.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternKind {
    /// A literal or dotted-name value compared with `==`
    MatchValue(Expr),
    /// `None`, `True`, `False`, compared with `is`
    MatchSingleton(Constant),
    /// `[p1, p2, *rest]`
    MatchSequence(Vec<Pattern>),
    /// `{k1: p1, **rest}`
    MatchMapping {
        /// Keys (literals or attribute lookups)
        keys: Vec<Expr>,
        /// Sub-patterns, parallel to `keys`
        patterns: Vec<Pattern>,
        /// `**rest` capture
        rest: Option<String>,
    },
    /// `Cls(p1, attr=p2)`
    MatchClass {
        /// Class expression
        cls: Expr,
        /// Positional sub-patterns
        patterns: Vec<Pattern>,
        /// Keyword attribute names
        kwd_attrs: Vec<String>,
        /// Keyword sub-patterns, parallel to `kwd_attrs`
        kwd_patterns: Vec<Pattern>,
    },
    /// `*name` or `*_` inside a sequence pattern
    MatchStar(Option<String>),
    /// `pattern as name`, a bare capture, or `_`
    MatchAs {
        /// Inner pattern; `None` for a capture or wildcard
        pattern: Option<Box<Pattern>>,
        /// Captured name; `None` for `_`
        name: Option<String>,
    },
    /// `p1 | p2`
    MatchOr(Vec<Pattern>),
}

impl Pattern {
    /// Whether this pattern is the irrefutable `_`.
    pub fn is_wildcard(&self) -> bool {
        matches!(
            self.kind,
            PatternKind::MatchAs {
                pattern: None,
                name: None
            }
        )
    }

    /// Whether this pattern is `*_`.
    pub fn is_star_wildcard(&self) -> bool {
        matches!(self.kind, PatternKind::MatchStar(None))
    }
}
