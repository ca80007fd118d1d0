use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use dfc::*;

use dfc::data::{DType, Data};
use dfc::graph::{MapKind, Program};
use dfc::id::NodeId;
use dfc::map_fission::MapFission;
use dfc::memlet::Memlet;
use dfc::subset::Range;
use dfc::symbolic::Expr;

// Scenarios: one map body of k stages exchanging transient scalars, which
// Map Fission splits into k maps.

fn chain_program(stages: usize) -> Program {
    let mut p = Program::new("chain");
    p.add_array("A", Data::array(DType::Float64, vec![Expr::sym("N")]));
    p.add_array("B", Data::array(DType::Float64, vec![Expr::sym("N")]));
    p.add_symbol("N", DType::Int64);
    for j in 1..stages {
        p.add_array(&format!("T{j}"), Data::scalar(DType::Float64).transient());
    }
    let sid = p.add_state("s0");
    let Some(s) = p.state_mut(sid) else {
        return p;
    };
    let m = |data: &str, subset: &str| Memlet::simple(data, subset).unwrap();
    let a = s.add_access("A");
    let range = Range::parse("0:N").unwrap();
    let (me, mx) = s.add_map("m", &["i"], range, MapKind::Parallel);
    let b = s.add_access("B");
    s.add_edge(a, None, me, Some("IN_0"), m("A", "0:N"));
    s.add_edge(mx, Some("OUT_0"), b, None, m("B", "0:N"));
    let mut prev: Option<(NodeId, String)> = None;
    for j in 1..=stages {
        let t = s.add_tasklet(&format!("s{j}"), "b = a + 1", &["a"], &["b"]);
        match prev.take() {
            None => s.add_edge(me, Some("OUT_0"), t, Some("a"), m("A", "i")),
            Some((node, name)) => s.add_edge(node, None, t, Some("a"), m(name.as_str(), "0")),
        };
        if j == stages {
            s.add_edge(t, Some("b"), mx, Some("IN_0"), m("B", "i"));
        } else {
            let name = format!("T{j}");
            let access = s.add_access(&name);
            s.add_edge(t, Some("b"), access, None, m(&name, "0"));
            prev = Some((access, name));
        }
    }
    p
}

// Fission latency vs number of stages.
fn bench_fission_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("fission/scaling");

    for stages in [2_usize, 4, 8, 16, 32] {
        let program = chain_program(stages);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}stages", stages)),
            &program,
            |b, program| {
                b.iter_batched(
                    || program.clone(),
                    |mut p| {
                        let outcome =
                            transformation::apply_repeated(&mut p, &MapFission, 64).unwrap();
                        black_box(outcome.applied());
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

// Lowering latency, before and after fission.
fn bench_lowering(c: &mut Criterion) {
    let mut group = c.benchmark_group("lower/chain16");
    let plain = chain_program(16);
    let mut split = plain.clone();
    transformation::apply_repeated(&mut split, &MapFission, 64).unwrap();

    for (name, program) in [("plain", &plain), ("fissioned", &split)] {
        group.bench_with_input(BenchmarkId::from_parameter(name), program, |b, program| {
            b.iter(|| {
                let result = lower::lower_program(black_box(program));
                black_box(codegen::emit_script(&result.tree));
            });
        });
    }

    group.finish();
}

// Full pipeline through script emission.
fn bench_pipeline(c: &mut Criterion) {
    let options = pipeline::PipelineOptions::default().with_transformation("MapFission");
    let program = chain_program(8);
    c.bench_function("pipeline/emit_with_fission", |b| {
        b.iter_batched(
            || pipeline::CompilationState::new(program.clone()),
            |mut state| {
                let r = pipeline::run_pipeline(
                    &mut state,
                    pass::PassId::Emit,
                    &options,
                    false,
                    |_, _| {},
                );
                black_box(r.is_ok());
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_fission_scaling, bench_lowering, bench_pipeline);
criterion_main!(benches);
