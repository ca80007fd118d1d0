// Map Fission scenarios through the public API: matching, legality,
// fixpoint application, and what lowering makes of the result.

mod common;

use common::*;
use dfc::data::{DType, Data};
use dfc::graph::{Edge, MapKind, Program};
use dfc::id::{NodeId, StateId};
use dfc::map_fission::{MapFission, DIRECT};
use dfc::pass::{PassId, StageCert};
use dfc::pipeline::{run_pipeline, CompilationState, PipelineOptions};
use dfc::symbolic::Expr;
use dfc::transformation::{apply_repeated, find_matches, Transformation};
use dfc::validate::validate_program;

#[test]
fn three_stage_chain_splits_into_three_maps() {
    let mut p = chain(3, 10, MapKind::Parallel);
    let outcome = apply_repeated(&mut p, &MapFission, 16).unwrap();
    assert_eq!(outcome.applied(), 1);
    assert!(!outcome.bound_reached);

    let report = &outcome.reports[0];
    assert_eq!(report.new_scopes.len(), 3);
    assert_eq!(report.promoted, vec!["T1".to_string(), "T2".to_string()]);

    let s = first_state(&p);
    let infos = maps(s);
    assert_eq!(infos.len(), 3);
    assert!(infos.iter().all(|m| m.label == "m_fission" && m.range == range("0:10")));
    for name in ["T1", "T2"] {
        assert_eq!(p.arrays[name].shape, vec![Expr::int(10)]);
        assert!(p.arrays[name].transient);
    }

    let (cert, diags) = validate_program(&p);
    assert!(cert.all_pass(), "{:?}", diags);
}

#[test]
fn each_new_map_is_a_single_component() {
    let mut p = chain(2, 8, MapKind::Parallel);
    apply_repeated(&mut p, &MapFission, 16).unwrap();
    for m in find_matches(&p, StateId(0), &MapFission) {
        assert!(!MapFission.can_be_applied(&p, &m, false));
    }
}

#[test]
fn single_component_map_is_left_alone() {
    let mut p = chain(1, 10, MapKind::Parallel);
    let before = p.fingerprint();
    let json = p.to_json().unwrap();
    let outcome = apply_repeated(&mut p, &MapFission, 16).unwrap();
    assert_eq!(outcome.applied(), 0);
    assert_eq!(p.fingerprint(), before);
    assert_eq!(p.to_json().unwrap(), json);
}

#[test]
fn pipeline_maps_are_not_candidates() {
    let p = chain(2, 10, MapKind::Pipeline);
    let direct: Vec<_> = find_matches(&p, StateId(0), &MapFission)
        .into_iter()
        .filter(|m| m.expr_index == DIRECT)
        .collect();
    assert!(direct.is_empty());
}

#[test]
fn border_array_gains_a_leading_dimension() {
    let mut p = border_array();
    let outcome = apply_repeated(&mut p, &MapFission, 16).unwrap();
    assert_eq!(outcome.applied(), 1);
    assert_eq!(outcome.reports[0].augmented, vec!["T".to_string()]);
    let t = &p.arrays["T"];
    assert_eq!(t.shape, vec![Expr::int(10), Expr::int(3)]);
    assert_eq!(t.total_size, Expr::int(30));
}

#[test]
fn promoted_scalar_is_declared_where_both_maps_see_it() {
    let mut p = chain(2, 10, MapKind::Parallel);
    apply_repeated(&mut p, &MapFission, 16).unwrap();
    let tree = dfc::lower::lower_program(&p).tree;
    assert_eq!(
        tree.to_string(),
        "map i in [0:10]:\n  T1[i] = tasklet(A[i])\nmap i in [0:10]:\n  B[i] = tasklet(T1[i])\n"
    );
    assert_eq!(tree.declaration_site("T1"), Some(tree.root()));
}

#[test]
fn rewritten_program_survives_json() {
    let mut p = chain(3, 6, MapKind::Parallel);
    apply_repeated(&mut p, &MapFission, 16).unwrap();
    let back = Program::from_json(&p.to_json().unwrap()).unwrap();
    assert_eq!(back, p);
    assert_eq!(back.fingerprint(), p.fingerprint());
}

#[test]
fn border_used_in_a_later_state_blocks_fission() {
    let mut p = chain(2, 10, MapKind::Parallel);
    let later = p.add_state("later");
    p.add_transition(StateId(0), later, "1", &[]);
    p.add_array("C", Data::scalar(DType::Float64));
    let s = p.state_mut(later).unwrap();
    let t = s.add_access("T1");
    let c = s.add_access("C");
    s.add_edge(t, None, c, None, memlet("T1", "0"));

    let before = p.fingerprint();
    let outcome = apply_repeated(&mut p, &MapFission, 16).unwrap();
    assert_eq!(outcome.applied(), 0);
    assert_eq!(p.fingerprint(), before);
}

#[test]
fn pipeline_runs_fission_to_a_fixpoint() {
    let mut state = CompilationState::new(chain(4, 12, MapKind::Parallel));
    let options = PipelineOptions::default().with_transformation("MapFission");
    run_pipeline(&mut state, PassId::Emit, &options, false, |_, _| {}).unwrap();
    assert_eq!(state.rewrites.len(), 1);
    let script = state.script.unwrap();
    assert_eq!(script.matches("for i in map[0:12]:").count(), 4);
    assert!(state.tree_cert.unwrap().all_pass());
}

fn rendered(edges: Vec<&Edge>) -> Vec<String> {
    edges.iter().map(|e| e.memlet.to_string()).collect()
}

#[test]
fn two_parameter_map_indexes_from_each_range_start() {
    let mut p = Program::new("grid");
    let grid = || Data::array(DType::Float64, vec![Expr::int(4), Expr::int(7)]);
    p.add_array("A", grid());
    p.add_array("B", grid());
    p.add_array("T", Data::scalar(DType::Float64).transient());
    let sid = p.add_state("s0");
    let s = p.state_mut(sid).unwrap();
    let a = s.add_access("A");
    let (me, mx) = s.add_map("m", &["i", "j"], range("0:4, 2:7"), MapKind::Parallel);
    let t1 = s.add_tasklet("t1", "t = a", &["a"], &["t"]);
    let t = s.add_access("T");
    let t2 = s.add_tasklet("t2", "b = t * 2", &["t"], &["b"]);
    let b = s.add_access("B");
    s.add_edge(a, None, me, Some("IN_0"), memlet("A", "0:4, 2:7"));
    s.add_edge(me, Some("OUT_0"), t1, Some("a"), memlet("A", "i, j"));
    s.add_edge(t1, Some("t"), t, None, memlet("T", "0"));
    s.add_edge(t, None, t2, Some("t"), memlet("T", "0"));
    s.add_edge(t2, Some("b"), mx, Some("IN_0"), memlet("B", "i, j"));
    s.add_edge(mx, Some("OUT_0"), b, None, memlet("B", "0:4, 2:7"));

    let outcome = apply_repeated(&mut p, &MapFission, 16).unwrap();
    assert_eq!(outcome.applied(), 1);
    assert_eq!(outcome.reports[0].promoted, vec!["T".to_string()]);
    assert_eq!(p.arrays["T"].shape, vec![Expr::int(4), Expr::int(5)]);

    let s = first_state(&p);
    assert_eq!(rendered(s.out_edges(t1)), vec!["T[i, j - 2]"]);
    assert_eq!(rendered(s.in_edges(t2)), vec!["T[i, j - 2]"]);
    let infos = maps(s);
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|m| m.params == vec!["i".to_string(), "j".to_string()]));

    let (cert, diags) = validate_program(&p);
    assert!(cert.all_pass(), "{:?}", diags);
}

/// `A -> entry -> tmp -> t1 -> T -> t2 -> o -> exit -> B`: the body starts
/// and ends at access nodes rather than at tasklets.
fn staged_through_access_nodes() -> (Program, [NodeId; 4]) {
    let mut p = Program::new("staged");
    p.add_array("A", vector(10));
    p.add_array("B", vector(10));
    for name in ["tmp", "T", "o"] {
        p.add_array(name, Data::scalar(DType::Float64).transient());
    }
    let sid = p.add_state("s0");
    let s = p.state_mut(sid).unwrap();
    let a = s.add_access("A");
    let (me, mx) = s.add_map("m", &["i"], range("0:10"), MapKind::Parallel);
    let tmp = s.add_access("tmp");
    let t1 = s.add_tasklet("t1", "t = x", &["x"], &["t"]);
    let t = s.add_access("T");
    let t2 = s.add_tasklet("t2", "y = t + 1", &["t"], &["y"]);
    let o = s.add_access("o");
    let b = s.add_access("B");
    s.add_edge(a, None, me, Some("IN_0"), memlet("A", "0:10"));
    s.add_edge(me, Some("OUT_0"), tmp, None, memlet("A", "i"));
    s.add_edge(tmp, None, t1, Some("x"), memlet("tmp", "0"));
    s.add_edge(t1, Some("t"), t, None, memlet("T", "0"));
    s.add_edge(t, None, t2, Some("t"), memlet("T", "0"));
    s.add_edge(t2, Some("y"), o, None, memlet("o", "0"));
    s.add_edge(o, None, mx, Some("IN_0"), memlet("B", "i"));
    s.add_edge(mx, Some("OUT_0"), b, None, memlet("B", "0:10"));
    (p, [a, tmp, o, b])
}

#[test]
fn body_sources_and_sinks_connect_straight_to_outer_edges() {
    let (mut p, [a, tmp, o, b]) = staged_through_access_nodes();
    let outcome = apply_repeated(&mut p, &MapFission, 16).unwrap();
    assert_eq!(outcome.applied(), 1);

    let mut promoted = outcome.reports[0].promoted.clone();
    promoted.sort();
    assert_eq!(promoted, vec!["T".to_string(), "o".to_string(), "tmp".to_string()]);
    for name in ["tmp", "T", "o"] {
        assert_eq!(p.arrays[name].shape, vec![Expr::int(10)], "{name}");
    }

    let s = first_state(&p);
    assert_eq!(rendered(s.edges_between(a, tmp)), vec!["A[0:10] -> [0:10]"]);
    assert_eq!(rendered(s.edges_between(o, b)), vec!["B[0:10] -> [0:10]"]);
    assert_eq!(maps(s).len(), 2);

    let (cert, diags) = validate_program(&p);
    assert!(cert.all_pass(), "{:?}", diags);
}
