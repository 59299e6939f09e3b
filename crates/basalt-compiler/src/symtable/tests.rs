// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Tests for symbol table construction.

use super::*;
use crate::ast::*;

fn loc(line: i32) -> Location {
    Location::new(line, 0, line, 10)
}

fn name(id: &str) -> Expr {
    Expr::name(id, loc(1))
}

fn build(body: Vec<Stmt>) -> (Module, SymbolTable) {
    let module = Module { body };
    let table = SymbolTable::build(&module, "test.py").expect("symbol table should build");
    (module, table)
}

fn function_scope<'a>(table: &'a SymbolTable, module: &Module, index: usize) -> &'a Scope {
    match &module.body[index].kind {
        StmtKind::FunctionDef(def) => table.scope(table.scope_for(def).expect("scope")),
        other => panic!("expected function, got {other:?}"),
    }
}

fn scope_of(scope: &Scope, name: &str) -> SymbolScope {
    scope.lookup(name).expect("symbol").scope
}

#[test]
fn test_module_names_are_implicit_globals() {
    let (_, table) = build(vec![Stmt::assign(name("x"), name("y"), loc(1))]);
    let root = table.scope(table.root());
    assert_eq!(root.kind, ScopeKind::Module);
    assert_eq!(scope_of(root, "x"), SymbolScope::Local);
    assert_eq!(scope_of(root, "y"), SymbolScope::GlobalImplicit);
}

#[test]
fn test_function_parameters_and_locals() {
    let (module, table) = build(vec![Stmt::function(
        "f",
        &["a", "b"],
        vec![
            Stmt::assign(name("c"), name("a"), loc(2)),
            Stmt::ret(Some(name("print")), loc(3)),
        ],
        loc(1),
    )]);
    let scope = function_scope(&table, &module, 0);
    assert_eq!(scope.params, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(scope_of(scope, "a"), SymbolScope::Local);
    assert_eq!(scope_of(scope, "c"), SymbolScope::Local);
    assert_eq!(scope_of(scope, "print"), SymbolScope::GlobalImplicit);
}

#[test]
fn test_closure_creates_cell_and_free() {
    let inner = Stmt::function("g", &[], vec![Stmt::ret(Some(name("x")), loc(3))], loc(2));
    let (module, table) = build(vec![Stmt::function(
        "f",
        &["x"],
        vec![inner, Stmt::ret(Some(name("g")), loc(4))],
        loc(1),
    )]);
    let outer = function_scope(&table, &module, 0);
    assert_eq!(scope_of(outer, "x"), SymbolScope::Cell);
    let child = table.scope(outer.children[0]);
    assert_eq!(scope_of(child, "x"), SymbolScope::Free);
    assert!(child.is_nested);
    assert_eq!(child.free_vars(), vec!["x".to_string()]);
}

#[test]
fn test_global_declaration() {
    let (module, table) = build(vec![Stmt::function(
        "f",
        &[],
        vec![
            Stmt::new(StmtKind::Global(vec!["counter".into()]), loc(2)),
            Stmt::assign(name("counter"), Expr::constant(1, loc(3)), loc(3)),
        ],
        loc(1),
    )]);
    let scope = function_scope(&table, &module, 0);
    assert_eq!(scope_of(scope, "counter"), SymbolScope::GlobalExplicit);
}

#[test]
fn test_nonlocal_without_binding_is_error() {
    let module = Module {
        body: vec![Stmt::function(
            "f",
            &[],
            vec![Stmt::new(StmtKind::Nonlocal(vec!["x".into()]), loc(2))],
            loc(1),
        )],
    };
    let err = SymbolTable::build(&module, "test.py").unwrap_err();
    assert!(err.to_string().contains("no binding for nonlocal 'x' found"));
}

#[test]
fn test_nonlocal_at_module_level_is_error() {
    let module = Module {
        body: vec![Stmt::new(StmtKind::Nonlocal(vec!["x".into()]), loc(1))],
    };
    let err = SymbolTable::build(&module, "test.py").unwrap_err();
    assert!(err.is_source_error());
}

#[test]
fn test_duplicate_parameter_is_error() {
    let module = Module {
        body: vec![Stmt::function("f", &["a", "a"], vec![Stmt::pass(loc(2))], loc(1))],
    };
    let err = SymbolTable::build(&module, "test.py").unwrap_err();
    assert!(
        err.to_string()
            .contains("duplicate argument 'a' in function definition")
    );
}

#[test]
fn test_super_in_method_needs_class_cell() {
    let method = Stmt::function(
        "m",
        &["self"],
        vec![Stmt::expr(Expr::call(name("super"), vec![], loc(3)))],
        loc(2),
    );
    let class = ClassDef {
        name: "C".into(),
        bases: vec![],
        keywords: vec![],
        body: vec![method],
        decorators: vec![],
    };
    let (module, table) = build(vec![Stmt::new(StmtKind::ClassDef(class), loc(1))]);
    let StmtKind::ClassDef(class) = &module.body[0].kind else {
        unreachable!()
    };
    let class_scope = table.scope(table.scope_for(class).unwrap());
    assert!(class_scope.needs_class_closure);
    let method_scope = table.scope(class_scope.children[0]);
    assert_eq!(scope_of(method_scope, "__class__"), SymbolScope::Free);
}

#[test]
fn test_class_body_names_skip_to_enclosing_function() {
    // def f(): x = 1; class C: y = x; def g(): return x
    let g = Stmt::function("g", &[], vec![Stmt::ret(Some(name("x")), loc(5))], loc(4));
    let class = ClassDef {
        name: "C".into(),
        bases: vec![],
        keywords: vec![],
        body: vec![Stmt::assign(name("y"), name("x"), loc(3)), g],
        decorators: vec![],
    };
    let (module, table) = build(vec![Stmt::function(
        "f",
        &[],
        vec![
            Stmt::assign(name("x"), Expr::constant(1, loc(2)), loc(2)),
            Stmt::new(StmtKind::ClassDef(class), loc(3)),
        ],
        loc(1),
    )]);
    let f = function_scope(&table, &module, 0);
    assert_eq!(scope_of(f, "x"), SymbolScope::Cell);
    let class_scope = table.scope(f.children[0]);
    assert_eq!(scope_of(class_scope, "x"), SymbolScope::Free);
    let g_scope = table.scope(class_scope.children[0]);
    assert_eq!(scope_of(g_scope, "x"), SymbolScope::Free);
}

#[test]
fn test_comprehension_scope_and_named_expression() {
    // def f(xs): return [(y := x) for x in xs]
    let named = Expr::new(
        ExprKind::NamedExpr {
            target: Box::new(name("y")),
            value: Box::new(name("x")),
        },
        loc(2),
    );
    let comp = Expr::new(
        ExprKind::ListComp {
            elt: Box::new(named),
            generators: vec![Comprehension {
                target: name("x"),
                iter: name("xs"),
                ifs: vec![],
                is_async: false,
            }],
        },
        loc(2),
    );
    let (module, table) = build(vec![Stmt::function(
        "f",
        &["xs"],
        vec![Stmt::ret(Some(comp), loc(2))],
        loc(1),
    )]);
    let f = function_scope(&table, &module, 0);
    assert_eq!(scope_of(f, "y"), SymbolScope::Cell);
    let comp_scope = table.scope(f.children[0]);
    assert!(comp_scope.is_comprehension);
    assert_eq!(comp_scope.params, vec![".0".to_string()]);
    assert_eq!(scope_of(comp_scope, "x"), SymbolScope::Local);
    assert_eq!(scope_of(comp_scope, "y"), SymbolScope::Free);
    // The outermost iterable is evaluated in the enclosing scope.
    assert_eq!(scope_of(f, "xs"), SymbolScope::Local);
    assert!(comp_scope.lookup("xs").is_none());
}

#[test]
fn test_yield_marks_generator() {
    let (module, table) = build(vec![Stmt::function(
        "gen",
        &[],
        vec![Stmt::expr(Expr::new(ExprKind::Yield(None), loc(2)))],
        loc(1),
    )]);
    assert!(function_scope(&table, &module, 0).is_generator);
}

#[test]
fn test_private_name_mangling() {
    assert_eq!(mangle(Some("Foo"), "__x"), "_Foo__x");
    assert_eq!(mangle(Some("_Foo"), "__x"), "_Foo__x");
    assert_eq!(mangle(Some("Foo"), "__init__"), "__init__");
    assert_eq!(mangle(Some("Foo"), "_x"), "_x");
    assert_eq!(mangle(Some("__"), "__x"), "__x");
    assert_eq!(mangle(None, "__x"), "__x");
}
