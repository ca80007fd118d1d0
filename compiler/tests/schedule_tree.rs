// Schedule tree scenarios: lowering, certificates, and the script round trip
// (emit → parse → resolve → emit).

mod common;

use common::*;
use dfc::codegen::emit_script;
use dfc::diag::codes;
use dfc::graph::{MapKind, Program};
use dfc::lower::lower_program;
use dfc::map_fission::MapFission;
use dfc::pass::{PassId, StageCert};
use dfc::pipeline::{run_pipeline, CompilationState, PipelineOptions};
use dfc::resolve::read_script;
use dfc::schedule::verify_tree;
use dfc::transformation::apply_repeated;

/// `s0: B = A + 1` then `s1: C = B * 2`, both as maps.
fn two_states() -> Program {
    let mut p = Program::new("two_states");
    for name in ["A", "B", "C"] {
        p.add_array(name, vector(10));
    }
    for (label, src, dst) in [("s0", "A", "B"), ("s1", "B", "C")] {
        let sid = p.add_state(label);
        let s = p.state_mut(sid).unwrap();
        let a = s.add_access(src);
        let (me, mx) = s.add_map("m", &["i"], range("0:10"), MapKind::Parallel);
        let t = s.add_tasklet("t", "b = a", &["a"], &["b"]);
        let b = s.add_access(dst);
        s.add_edge(a, None, me, Some("IN_0"), memlet(src, "0:10"));
        s.add_edge(me, Some("OUT_0"), t, Some("a"), memlet(src, "i"));
        s.add_edge(t, Some("b"), mx, Some("IN_0"), memlet(dst, "i"));
        s.add_edge(mx, Some("OUT_0"), b, None, memlet(dst, "0:10"));
    }
    p
}

#[test]
fn sequential_states_lower_in_order() {
    let mut p = two_states();
    p.add_transition(dfc::id::StateId(0), dfc::id::StateId(1), "1", &[]);
    let result = lower_program(&p);
    assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    assert_eq!(
        result.tree.to_string(),
        "map i in [0:10]:\n  B[i] = tasklet(A[i])\nmap i in [0:10]:\n  C[i] = tasklet(B[i])\n"
    );
    assert!(verify_tree(&result.tree).all_pass());
}

#[test]
fn fissioned_tree_round_trips_through_script() {
    let mut p = chain(3, 16, MapKind::Parallel);
    apply_repeated(&mut p, &MapFission, 16).unwrap();
    let tree = lower_program(&p).tree;
    assert!(verify_tree(&tree).all_pass());

    let script = emit_script(&tree);
    let reread = read_script(&script);
    assert!(!reread.has_errors(), "{:?}", reread.diagnostics);
    assert_eq!(reread.tree.to_string(), tree.to_string());
    assert_eq!(emit_script(&reread.tree), script);
}

#[test]
fn unstructured_flow_is_a_warning_not_an_error() {
    let mut p = two_states();
    p.add_symbol("k", dfc::data::DType::Int64);
    // a lone guarded exit has no structured counterpart
    p.add_transition(dfc::id::StateId(0), dfc::id::StateId(1), "k > 0", &[]);
    let mut state = CompilationState::new(p);
    run_pipeline(&mut state, PassId::Emit, &PipelineOptions::default(), false, |_, _| {})
        .unwrap();
    assert!(state
        .diagnostics
        .iter()
        .any(|d| d.code == Some(codes::W0002)));
    let script = state.script.unwrap();
    assert!(script.contains("gblock:"), "{script}");
}

#[test]
fn script_target_reports_every_pass() {
    let mut state = CompilationState::new(chain(2, 4, MapKind::Parallel));
    let mut seen = Vec::new();
    run_pipeline(
        &mut state,
        PassId::Emit,
        &PipelineOptions::default(),
        false,
        |id, _| seen.push(id),
    )
    .unwrap();
    assert_eq!(seen, dfc::pass::ALL_PASSES.to_vec());
    assert_eq!(state.program.fingerprint(), state.input_fingerprint);
}
