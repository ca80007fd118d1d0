// Property-based tests for rewrite and lowering invariants.
//
// Three categories:
// 1. Single-component regions: Map Fission never applies and never touches
//    the program.
// 2. Chains of k stages: one rewrite yields k maps and a valid graph.
// 3. Lowering → emission → re-parse round trips over a mix of program shapes:
//    map chains (with and without fission), structured and unstructured
//    control flow, reduced copies, library calls, consume scopes and nested
//    views.
//
// Uses proptest with explicit configuration to prevent CI flakiness.

mod common;

use common::*;
use dfc::codegen::emit_script;
use dfc::data::{DType, Data};
use dfc::graph::{MapKind, Program, State};
use dfc::id::{NodeId, StateId};
use dfc::lower::lower_program;
use dfc::map_fission::MapFission;
use dfc::pass::StageCert;
use dfc::resolve::read_script;
use dfc::symbolic::Expr;
use dfc::transformation::{apply_repeated, find_matches, Transformation};
use dfc::validate::validate_program;
use indexmap::IndexMap;
use proptest::prelude::*;

// ── Generators ──────────────────────────────────────────────────────────────

/// One tasklet inside a map, reading `inputs` arrays and writing `B`.
fn single_tasklet(n: i64, inputs: usize, kind: MapKind) -> Program {
    let mut p = Program::new("single");
    let names: Vec<String> = (0..inputs).map(|k| format!("I{k}")).collect();
    for name in &names {
        p.add_array(name, vector(n));
    }
    p.add_array("B", vector(n));
    let sid = p.add_state("s0");
    let s = p.state_mut(sid).unwrap();
    let full = format!("0:{n}");
    let (me, mx) = s.add_map("m", &["i"], range(&full), kind);
    let conns: Vec<String> = (0..inputs).map(|k| format!("x{k}")).collect();
    let conn_refs: Vec<&str> = conns.iter().map(String::as_str).collect();
    let t = s.add_tasklet("t", "b = x0", &conn_refs, &["b"]);
    for (k, name) in names.iter().enumerate() {
        let a = s.add_access(name);
        s.add_edge(a, None, me, Some(&format!("IN_{k}")), memlet(name, &full));
        s.add_edge(me, Some(&format!("OUT_{k}")), t, Some(&conns[k]), memlet(name, "i"));
    }
    let b = s.add_access("B");
    s.add_edge(t, Some("b"), mx, Some("IN_0"), memlet("B", "i"));
    s.add_edge(mx, Some("OUT_0"), b, None, memlet("B", &full));
    p
}

fn arb_kind() -> impl Strategy<Value = MapKind> {
    prop_oneof![Just(MapKind::Parallel), Just(MapKind::Pipeline)]
}

/// `dst[i] = src[i]` over `0:n`, as a map around one tasklet.
fn map_copy(s: &mut State, src: &str, dst: &str, n: i64) {
    let full = format!("0:{n}");
    let a = s.add_access(src);
    let (me, mx) = s.add_map("m", &["i"], range(&full), MapKind::Parallel);
    let t = s.add_tasklet("t", "b = a", &["a"], &["b"]);
    let b = s.add_access(dst);
    s.add_edge(a, None, me, Some("IN_0"), memlet(src, &full));
    s.add_edge(me, Some("OUT_0"), t, Some("a"), memlet(src, "i"));
    s.add_edge(t, Some("b"), mx, Some("IN_0"), memlet(dst, "i"));
    s.add_edge(mx, Some("OUT_0"), b, None, memlet(dst, &full));
}

fn vectors(name: &str, n: i64, names: &[&str]) -> Program {
    let mut p = Program::new(name);
    for a in names {
        p.add_array(a, vector(n));
    }
    p
}

fn fill(p: &mut Program, sid: StateId, src: &str, dst: &str, n: i64) {
    if let Some(s) = p.state_mut(sid) {
        map_copy(s, src, dst, n);
    }
}

/// `init -> guard -> body -> guard`, with `k` counting up to `N`.
fn for_loop(n: i64) -> Program {
    let mut p = vectors("for_loop", n, &["A"]);
    p.add_symbol("N", DType::Int64);
    p.add_symbol("k", DType::Int64);
    p.add_array("T", vector(n).transient());
    let init = p.add_state("init");
    let guard = p.add_state("guard");
    let body = p.add_state("body");
    let after = p.add_state("after");
    let s = p.state_mut(body).unwrap();
    let w = s.add_tasklet("w", "t = 1", &[], &["t"]);
    let t = s.add_access("T");
    let r = s.add_tasklet("r", "a = t", &["t"], &["a"]);
    let a = s.add_access("A");
    s.add_edge(w, Some("t"), t, None, memlet("T", "k"));
    s.add_edge(t, None, r, Some("t"), memlet("T", "k"));
    s.add_edge(r, Some("a"), a, None, memlet("A", "k"));
    p.add_transition(init, guard, "1", &[("k", "0")]);
    p.add_transition(guard, body, "k < N", &[]);
    p.add_transition(guard, after, "not (k < N)", &[]);
    p.add_transition(body, guard, "1", &[("k", "k + 1")]);
    p
}

fn while_loop(n: i64) -> Program {
    let mut p = vectors("while_loop", n, &["A", "B"]);
    let guard = p.add_state("guard");
    let body = p.add_state("body");
    let after = p.add_state("after");
    fill(&mut p, body, "A", "B", n);
    p.add_transition(guard, body, "x > 0", &[]);
    p.add_transition(guard, after, "not (x > 0)", &[]);
    p.add_transition(body, guard, "1", &[]);
    p
}

fn do_while_loop(n: i64) -> Program {
    let mut p = vectors("do_while_loop", n, &["A", "B"]);
    let body = p.add_state("body");
    let after = p.add_state("after");
    fill(&mut p, body, "A", "B", n);
    p.add_transition(body, body, "go", &[]);
    p.add_transition(body, after, "not go", &[]);
    p
}

fn if_else(n: i64) -> Program {
    let mut p = vectors("if_else", n, &["A", "B", "C"]);
    let head = p.add_state("head");
    let yes = p.add_state("yes");
    let no = p.add_state("no");
    let merge = p.add_state("merge");
    fill(&mut p, yes, "A", "B", n);
    fill(&mut p, no, "A", "C", n);
    p.add_transition(head, yes, "c", &[]);
    p.add_transition(head, no, "not (c)", &[]);
    p.add_transition(yes, merge, "1", &[]);
    p.add_transition(no, merge, "1", &[]);
    p
}

/// Two states entering each other's bodies: no structured form exists.
fn irreducible(n: i64) -> Program {
    let mut p = vectors("irreducible", n, &["A", "B"]);
    let s0 = p.add_state("s0");
    let s1 = p.add_state("s1");
    let s2 = p.add_state("s2");
    fill(&mut p, s1, "A", "B", n);
    p.add_transition(s0, s1, "a", &[]);
    p.add_transition(s0, s2, "not (a)", &[]);
    p.add_transition(s1, s2, "b", &[("x", "1")]);
    p.add_transition(s2, s1, "c", &[]);
    p
}

fn reduced_copy(n: i64) -> Program {
    let mut p = vectors("reduced_copy", n, &["A", "B"]);
    let sid = p.add_state("s0");
    let s = p.state_mut(sid).unwrap();
    let a = s.add_access("A");
    let b = s.add_access("B");
    s.add_edge(a, None, b, None, memlet("B", &format!("0:{n}")).with_wcr("sum"));
    p
}

fn library_call(n: i64) -> Program {
    let mut p = vectors("library_call", n, &["A", "B"]);
    let sid = p.add_state("s0");
    let s = p.state_mut(sid).unwrap();
    let full = format!("0:{n}");
    let properties: IndexMap<String, String> =
        [("alpha".to_string(), "1".to_string())].into_iter().collect();
    let a = s.add_access("A");
    let lib = s.add_library("scale", "Scale", properties, &["x"], &["y"]);
    let b = s.add_access("B");
    s.add_edge(a, None, lib, Some("x"), memlet("A", &full));
    s.add_edge(lib, Some("y"), b, None, memlet("B", &full));
    p
}

fn consume(n: i64, pes: i64) -> Program {
    let mut p = vectors("consume_scope", n, &["S", "B"]);
    let sid = p.add_state("s0");
    let s = p.state_mut(sid).unwrap();
    let full = format!("0:{n}");
    let src = s.add_access("S");
    let (ce, cx) = s.add_consume("c", "p", Expr::int(pes), None, "S");
    let t = s.add_tasklet("t", "y = s", &["s"], &["y"]);
    let b = s.add_access("B");
    s.add_edge(src, None, ce, Some("IN_0"), memlet("S", &full));
    s.add_edge(ce, Some("OUT_0"), t, Some("s"), memlet("S", "p"));
    s.add_edge(t, Some("y"), cx, Some("IN_0"), memlet("B", "p"));
    s.add_edge(cx, Some("OUT_0"), b, None, memlet("B", &full));
    p
}

/// A nested program reading its input through a view of the outer array.
fn nested_view(n: i64) -> Program {
    let full = format!("0:{n}");
    let mut inner = Program::new("inner");
    inner.add_symbol("M", DType::Int64);
    inner.add_array("x", vector(n));
    inner.add_array("A", vector(n).transient());
    let s = inner.add_state("s");
    let st = inner.state_mut(s).unwrap();
    let x = st.add_access("x");
    let a = st.add_access("A");
    st.add_edge(x, None, a, None, memlet("x", &full));

    let mut outer = vectors("nested_view", n, &["A"]);
    outer.add_symbol("N", DType::Int64);
    let s0 = outer.add_state("s0");
    let st = outer.state_mut(s0).unwrap();
    let src = st.add_access("A");
    let mapping: IndexMap<String, Expr> =
        [("M".to_string(), Expr::sym("N"))].into_iter().collect();
    let nn: NodeId = st.add_nested("nest", inner, mapping, &["x"], &[]);
    st.add_edge(src, None, nn, Some("x"), memlet("A", &full));
    outer
}

fn fissioned_chain(stages: usize, n: i64) -> Program {
    let mut p = chain(stages, n, MapKind::Parallel);
    apply_repeated(&mut p, &MapFission, 8).unwrap();
    p
}

fn arb_program() -> impl Strategy<Value = Program> {
    let n = 2i64..40;
    prop_oneof![
        (1usize..6, n.clone()).prop_map(|(k, n)| chain(k, n, MapKind::Parallel)),
        (1usize..6, n.clone()).prop_map(|(k, n)| fissioned_chain(k, n)),
        n.clone().prop_map(for_loop),
        n.clone().prop_map(while_loop),
        n.clone().prop_map(do_while_loop),
        n.clone().prop_map(if_else),
        n.clone().prop_map(irreducible),
        n.clone().prop_map(reduced_copy),
        n.clone().prop_map(library_call),
        (n.clone(), 1i64..9).prop_map(|(n, pes)| consume(n, pes)),
        n.prop_map(nested_view),
    ]
}

// ── Properties ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn single_component_is_never_split(
        n in 2i64..64,
        inputs in 1usize..5,
        kind in arb_kind(),
    ) {
        let mut p = single_tasklet(n, inputs, kind);
        let before = p.fingerprint();
        for m in find_matches(&p, StateId(0), &MapFission) {
            prop_assert!(!MapFission.can_be_applied(&p, &m, false));
        }
        let outcome = apply_repeated(&mut p, &MapFission, 8).unwrap();
        prop_assert_eq!(outcome.applied(), 0);
        prop_assert_eq!(p.fingerprint(), before);
    }

    #[test]
    fn chain_splits_into_one_map_per_stage(stages in 2usize..7, n in 2i64..40) {
        let mut p = chain(stages, n, MapKind::Parallel);
        let outcome = apply_repeated(&mut p, &MapFission, 8).unwrap();
        prop_assert_eq!(outcome.applied(), 1);
        prop_assert!(!outcome.bound_reached);
        prop_assert_eq!(maps(first_state(&p)).len(), stages);
        for j in 1..stages {
            let t = &p.arrays[&format!("T{j}")];
            prop_assert_eq!(&t.shape, &vec![dfc::symbolic::Expr::int(n)]);
        }
        let (cert, diags) = validate_program(&p);
        prop_assert!(cert.all_pass(), "{:?}", diags);
    }

    #[test]
    fn lowered_script_round_trips(p in arb_program()) {
        let tree = lower_program(&p).tree;
        let script = emit_script(&tree);
        let reread = read_script(&script);
        prop_assert!(!reread.has_errors(), "{:?}\n{}", reread.diagnostics, script);
        prop_assert_eq!(reread.tree.to_string(), tree.to_string());
        prop_assert_eq!(emit_script(&reread.tree), script);
    }
}

#[test]
fn non_transient_scalar_border_is_kept() {
    let mut p = chain(2, 10, MapKind::Parallel);
    p.add_array("T1", Data::scalar(DType::Float64));
    let outcome = apply_repeated(&mut p, &MapFission, 8).unwrap();
    assert_eq!(outcome.applied(), 0);
}
