use super::*;
use crate::tree::{parse_program, Node, NodeKind, Value};

fn parse(src: &str) -> Node {
    parse_program(src).unwrap()
}

fn analyze(src: &str) -> (Node, Analysis) {
    let tree = parse(src);
    let analysis = Analysis::run(&tree);
    (tree, analysis)
}

#[test]
fn test_module_bindings_and_kinds() {
    let (_, a) = analyze(
        "(block (assign x 1) (for i (call range 3) (block)) (defn f (p) (block (return p))))",
    );
    let m = a.scopes.module();
    assert_eq!(m.binding("x").unwrap().kind, BindingKind::Assigned);
    assert_eq!(m.binding("i").unwrap().kind, BindingKind::LoopVar);
    assert_eq!(m.binding("f").unwrap().kind, BindingKind::Function);
    assert!(m.binding("p").is_none());
}

#[test]
fn test_function_scope_has_params_and_locals() {
    let (tree, a) = analyze("(block (defn f (p) (block (assign t p) (return t))))");
    let def_id = match &tree.kind {
        NodeKind::Block(items) => items[0].id,
        _ => unreachable!(),
    };
    let scope = a.scopes.scope_of_def(def_id).unwrap();
    let info = a.scopes.get(scope);
    assert_eq!(info.binding("p").unwrap().kind, BindingKind::Param);
    assert_eq!(info.binding("t").unwrap().kind, BindingKind::Assigned);
}

#[test]
fn test_assign_counts() {
    let (_, a) = analyze("(block (assign x 1) (assign x 2) (assign y 3))");
    let m = a.scopes.module();
    assert_eq!(m.binding("x").unwrap().assigns, 2);
    assert_eq!(m.binding("y").unwrap().assigns, 1);
}

#[test]
fn test_reads_resolve_to_module_from_functions() {
    let (_, a) = analyze("(block (assign g 1) (defn f () (block (return (binop + g g)))))");
    assert_eq!(a.scopes.module().binding("g").unwrap().reads, 2);
}

#[test]
fn test_local_shadows_module_for_reads() {
    let (_, a) = analyze("(block (assign g 1) (defn f () (block (assign g 2) (return g))))");
    assert_eq!(a.scopes.module().binding("g").unwrap().reads, 0);
}

#[test]
fn test_introspection_flag() {
    let (_, a) = analyze("(block (assign x 1))");
    assert!(!a.scopes.uses_introspection);
    let (_, a) = analyze("(block (assign env (call globals)))");
    assert!(a.scopes.uses_introspection);
    let (_, a) = analyze(r#"(block (assign v (call getattr (call object) "x" 0)))"#);
    assert!(a.scopes.uses_introspection);
}

#[test]
fn test_shadowed_introspection_name_does_not_flag() {
    let (_, a) = analyze("(block (assign globals 1) (assign y globals))");
    assert!(!a.scopes.uses_introspection);
}

#[test]
fn test_def_stmt_only_for_direct_single_assign() {
    let (_, a) = analyze(
        "(block (assign a 1) (if true (block (assign b 2))) (assign c 3) (assign c 4))",
    );
    let m = a.scopes.module();
    assert_eq!(m.binding("a").unwrap().def_stmt, Some(0));
    assert_eq!(m.binding("b").unwrap().def_stmt, None);
    assert_eq!(m.binding("c").unwrap().def_stmt, None);
}

#[test]
fn test_def_stmt_covers_direct_function_definitions() {
    let (_, a) = analyze(
        "(block (defn f (x) (block (return x))) (if true (block (defn g () (block)))))",
    );
    let m = a.scopes.module();
    assert_eq!(m.binding("f").unwrap().def_stmt, Some(0));
    assert_eq!(m.binding("g").unwrap().def_stmt, None);
}

#[test]
fn test_module_effect_boundary() {
    let (_, a) = analyze("(block (assign a 1) (assign b 2) (call print a) (assign c 3))");
    assert_eq!(a.scopes.module_effect_boundary, Some(2));
    let (_, a) = analyze("(block (assign a 1))");
    assert_eq!(a.scopes.module_effect_boundary, None);
    let (_, a) = analyze("(block (if true (block (assign a 1))) (assign b 2))");
    assert_eq!(a.scopes.module_effect_boundary, Some(0));
}

#[test]
fn test_constant_facts_for_single_assignments() {
    let (_, a) = analyze("(block (assign n 10) (assign m 1) (assign m 2))");
    let c = a.facts.constant_of(MODULE_SCOPE, "n");
    assert!(matches!(c, Some((_, Value::Int(10)))));
    assert!(a.facts.constant_of(MODULE_SCOPE, "m").is_none());
}

#[test]
fn test_no_constant_for_nested_assignment() {
    let (_, a) = analyze("(block (if true (block (assign n 10))))");
    assert!(a.facts.constant_of(MODULE_SCOPE, "n").is_none());
}

#[test]
fn test_constant_at_requires_definition_first() {
    let (_, a) = analyze("(block (assign n 10) (assign u n))");
    assert!(a.constant_at(MODULE_SCOPE, "n", 1).is_some());
    assert!(a.constant_at(MODULE_SCOPE, "n", 0).is_none());
}

#[test]
fn test_type_known_from_constant() {
    let (_, a) = analyze(r#"(block (assign v "python2.7"))"#);
    let (_, t) = a.facts.type_of(MODULE_SCOPE, "v").unwrap();
    assert_eq!(t, "str");
}

#[test]
fn test_pure_builtin_call_gets_fact() {
    let (tree, a) = analyze("(block (assign r (call range 10)))");
    let mut call_id = None;
    tree.visit(&mut |n| {
        if matches!(n.kind, NodeKind::Call { .. }) {
            call_id = Some(n.id);
        }
    });
    assert!(a.facts.pure_fact(call_id.unwrap()).is_some());
}

#[test]
fn test_print_call_gets_no_fact() {
    let (tree, a) = analyze("(block (call print 1))");
    let mut call_id = None;
    tree.visit(&mut |n| {
        if matches!(n.kind, NodeKind::Call { .. }) {
            call_id = Some(n.id);
        }
    });
    assert!(a.facts.pure_fact(call_id.unwrap()).is_none());
}

#[test]
fn test_pure_user_function_promotes() {
    let src = "(block \
        (defn sq (x) (block (return (binop * x x)))) \
        (assign r (call sq 3)))";
    let (tree, a) = analyze(src);
    let mut sq_call = None;
    tree.visit(&mut |n| {
        if let NodeKind::Call { callee, .. } = &n.kind {
            if matches!(&callee.kind, NodeKind::Name(name) if name == "sq") {
                sq_call = Some(n.id);
            }
        }
    });
    assert!(a.facts.pure_fact(sq_call.unwrap()).is_some());
}

#[test]
fn test_function_calling_print_stays_impure() {
    let src = "(block \
        (defn noisy (x) (block (call print x) (return x))) \
        (assign r (call noisy 3)))";
    let (tree, a) = analyze(src);
    let mut noisy_call = None;
    tree.visit(&mut |n| {
        if let NodeKind::Call { callee, .. } = &n.kind {
            if matches!(&callee.kind, NodeKind::Name(name) if name == "noisy") {
                noisy_call = Some(n.id);
            }
        }
    });
    assert!(a.facts.pure_fact(noisy_call.unwrap()).is_none());
}

#[test]
fn test_recursive_function_stays_impure() {
    let src = "(block \
        (defn f (n) (block (return (call f n)))) \
        (assign r (call f 1)))";
    let (tree, a) = analyze(src);
    let mut f_calls = Vec::new();
    tree.visit(&mut |n| {
        if let NodeKind::Call { callee, .. } = &n.kind {
            if matches!(&callee.kind, NodeKind::Name(name) if name == "f") {
                f_calls.push(n.id);
            }
        }
    });
    for id in f_calls {
        assert!(a.facts.pure_fact(id).is_none());
    }
}

#[test]
fn test_transitively_pure_functions() {
    let src = "(block \
        (defn inner (x) (block (return (binop + x 1)))) \
        (defn outer (x) (block (return (call inner (call inner x))))) \
        (assign r (call outer 1)))";
    let (tree, a) = analyze(src);
    let mut outer_call = None;
    tree.visit(&mut |n| {
        if let NodeKind::Call { callee, .. } = &n.kind {
            if matches!(&callee.kind, NodeKind::Name(name) if name == "outer") {
                outer_call = Some(n.id);
            }
        }
    });
    assert!(a.facts.pure_fact(outer_call.unwrap()).is_some());
}

#[test]
fn test_attribute_reads_are_pure() {
    let (tree, a) = analyze(r#"(block (assign v "x") (assign m (attr v upper)))"#);
    let mut attr_id = None;
    tree.visit(&mut |n| {
        if matches!(n.kind, NodeKind::Attribute { .. }) {
            attr_id = Some(n.id);
        }
    });
    assert!(a.facts.pure_fact(attr_id.unwrap()).is_some());
}

#[test]
fn test_str_method_call_is_pure() {
    let (tree, a) = analyze(r#"(block (assign v "abc") (assign r (call (attr v upper))))"#);
    let mut call_id = None;
    tree.visit(&mut |n| {
        if matches!(n.kind, NodeKind::Call { .. }) {
            call_id = Some(n.id);
        }
    });
    assert!(a.facts.pure_fact(call_id.unwrap()).is_some());
}

#[test]
fn test_loop_variable_bounds() {
    let (_, a) = analyze("(block (for i (call range 10) (block)))");
    let (_, lo, hi) = a.facts.range_of(MODULE_SCOPE, "i").unwrap();
    assert_eq!((lo, hi), (0, 9));
}

#[test]
fn test_stepped_and_negative_ranges() {
    let (_, a) = analyze("(block (for i (call range 0 10 3) (block)))");
    let (_, lo, hi) = a.facts.range_of(MODULE_SCOPE, "i").unwrap();
    assert_eq!((lo, hi), (0, 9));

    let (_, a) = analyze("(block (for i (call range 10 0 -2) (block)))");
    let (_, lo, hi) = a.facts.range_of(MODULE_SCOPE, "i").unwrap();
    assert_eq!((lo, hi), (2, 10));
}

#[test]
fn test_empty_range_produces_no_bounds() {
    let (_, a) = analyze("(block (for i (call range 0) (block)))");
    assert!(a.facts.range_of(MODULE_SCOPE, "i").is_none());
}

#[test]
fn test_reassigned_loop_variable_loses_bounds() {
    let (_, a) = analyze("(block (for i (call range 10) (block)) (assign i 100))");
    assert!(a.facts.range_of(MODULE_SCOPE, "i").is_none());
}

#[test]
fn test_range_through_constant_argument() {
    let (_, a) = analyze("(block (assign n 5) (for i (call range n) (block)))");
    let (_, lo, hi) = a.facts.range_of(MODULE_SCOPE, "i").unwrap();
    assert_eq!((lo, hi), (0, 4));
}

#[test]
fn test_range_argument_defined_after_loop_is_unknown() {
    let (_, a) = analyze("(block (for i (call range n) (block)) (assign n 5))");
    assert!(a.facts.range_of(MODULE_SCOPE, "i").is_none());
}

#[test]
fn test_shadowed_range_is_not_the_builtin() {
    let (_, a) = analyze(
        "(block (defn range (x) (block (call print x) (return x))) (for i (call range 10) (block)))",
    );
    assert!(a.facts.range_of(MODULE_SCOPE, "i").is_none());
}

#[test]
fn test_sum_of_loop_variable_and_literal_is_bounded() {
    let (_, a) = analyze("(block (for i (call range 10) (block)) (assign j (binop + i 1)))");
    let (_, lo, hi) = a.facts.range_of(MODULE_SCOPE, "j").unwrap();
    assert_eq!((lo, hi), (1, 10));
}

#[test]
fn test_sum_bounds_chain_through_earlier_sums() {
    let (_, a) = analyze(
        "(block (assign k 5) (for i (call range 10) (block)) (assign j (binop + i k)) (assign m (binop + j j)))",
    );
    let (_, lo, hi) = a.facts.range_of(MODULE_SCOPE, "j").unwrap();
    assert_eq!((lo, hi), (5, 14));
    let (_, lo, hi) = a.facts.range_of(MODULE_SCOPE, "m").unwrap();
    assert_eq!((lo, hi), (10, 28));
}

#[test]
fn test_sum_before_the_loop_is_unknown() {
    let (_, a) = analyze("(block (assign j (binop + i 1)) (for i (call range 10) (block)))");
    assert!(a.facts.range_of(MODULE_SCOPE, "j").is_none());
}

#[test]
fn test_reassigned_sum_is_unknown() {
    let (_, a) = analyze(
        "(block (for i (call range 10) (block)) (assign j (binop + i 1)) (assign j 0))",
    );
    assert!(a.facts.range_of(MODULE_SCOPE, "j").is_none());
}

#[test]
fn test_product_gets_no_bounds() {
    let (_, a) = analyze("(block (for i (call range 10) (block)) (assign j (binop * i 2)))");
    assert!(a.facts.range_of(MODULE_SCOPE, "j").is_none());
}

#[test]
fn test_expr_purity_collects_evidence() {
    let (tree, a) = analyze("(block (assign r (binop + (call len (list 1 2)) 1)))");
    let value = match &tree.kind {
        NodeKind::Block(items) => match &items[0].kind {
            NodeKind::Assign { value, .. } => value,
            _ => unreachable!(),
        },
        _ => unreachable!(),
    };
    let evidence = a.expr_purity(value).unwrap();
    assert_eq!(evidence.len(), 1);
}

#[test]
fn test_expr_purity_declines_on_effects() {
    let (tree, a) = analyze("(block (assign r (call print 1)))");
    let value = match &tree.kind {
        NodeKind::Block(items) => match &items[0].kind {
            NodeKind::Assign { value, .. } => value,
            _ => unreachable!(),
        },
        _ => unreachable!(),
    };
    assert!(a.expr_purity(value).is_none());
}

#[test]
fn test_expr_is_total_ordering() {
    let (tree, a) = analyze("(block (assign x 1) (assign u x) (assign v w))");
    let value_of = |i: usize| match &tree.kind {
        NodeKind::Block(items) => match &items[i].kind {
            NodeKind::Assign { value, .. } => value.clone(),
            _ => unreachable!(),
        },
        _ => unreachable!(),
    };
    // x is defined at statement 0, read at statement 1.
    assert!(a.expr_is_total(&value_of(1), MODULE_SCOPE, 1));
    // w is never defined.
    assert!(!a.expr_is_total(&value_of(2), MODULE_SCOPE, 2));
}

#[test]
fn test_module_constant_for_fn_use_respects_boundary() {
    let (_, a) = analyze(
        "(block (assign n 10) (defn f () (block (return n))) (call f) (assign late 1))",
    );
    assert!(a.module_constant_for_fn_use("n").is_some());

    // Assigned after the first call could already have run user code.
    let (_, a) = analyze(
        "(block (defn f () (block (return n))) (call f) (assign n 10))",
    );
    assert!(a.module_constant_for_fn_use("n").is_none());
}
