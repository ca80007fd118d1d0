// Shared program builders for the integration tests.
#![allow(dead_code)]

use dfc::data::{DType, Data};
use dfc::graph::{MapInfo, MapKind, Program, State};
use dfc::id::{NodeId, StateId};
use dfc::memlet::Memlet;
use dfc::subset::Range;
use dfc::symbolic::Expr;

pub fn memlet(data: &str, subset: &str) -> Memlet {
    Memlet::simple(data, subset).unwrap()
}

pub fn range(text: &str) -> Range {
    Range::parse(text).unwrap()
}

pub fn vector(n: i64) -> Data {
    Data::array(DType::Float64, vec![Expr::int(n)])
}

/// `A -> [map i in 0:n: s1 -> T1 -> s2 -> ... -> sk] -> B`, every `Tj` a
/// transient scalar exchanged between consecutive tasklets.
pub fn chain(stages: usize, n: i64, kind: MapKind) -> Program {
    let mut p = Program::new("chain");
    p.add_array("A", vector(n));
    p.add_array("B", vector(n));
    for j in 1..stages {
        p.add_array(&format!("T{j}"), Data::scalar(DType::Float64).transient());
    }
    let sid = p.add_state("s0");
    let s = p.state_mut(sid).unwrap();
    let a = s.add_access("A");
    let (me, mx) = s.add_map("m", &["i"], range(&format!("0:{n}")), kind);
    let b = s.add_access("B");
    s.add_edge(a, None, me, Some("IN_0"), memlet("A", &format!("0:{n}")));
    s.add_edge(mx, Some("OUT_0"), b, None, memlet("B", &format!("0:{n}")));

    let mut prev: Option<(NodeId, String)> = None;
    for j in 1..=stages {
        let code = format!("b = a + {j}");
        let t = s.add_tasklet(&format!("s{j}"), &code, &["a"], &["b"]);
        match prev.take() {
            None => {
                s.add_edge(me, Some("OUT_0"), t, Some("a"), memlet("A", "i"));
            }
            Some((node, name)) => {
                s.add_edge(node, None, t, Some("a"), memlet(&name, "0"));
            }
        }
        if j == stages {
            s.add_edge(t, Some("b"), mx, Some("IN_0"), memlet("B", "i"));
        } else {
            let name = format!("T{j}");
            let access = s.add_access(&name);
            s.add_edge(t, Some("b"), access, None, memlet(&name, "0"));
            prev = Some((access, name));
        }
    }
    p
}

/// Two-stage chain whose border container `T` is a transient `[10, 3]` array
/// written and read whole by each iteration.
pub fn border_array() -> Program {
    let mut p = Program::new("border");
    p.add_array("A", vector(10));
    p.add_array("B", vector(10));
    p.add_array(
        "T",
        Data::array(DType::Float64, vec![Expr::int(3)]).transient(),
    );
    let sid = p.add_state("s0");
    let s = p.state_mut(sid).unwrap();
    let a = s.add_access("A");
    let (me, mx) = s.add_map("m", &["i"], range("0:10"), MapKind::Parallel);
    let t1 = s.add_tasklet("fill", "t = a", &["a"], &["t"]);
    let t = s.add_access("T");
    let t2 = s.add_tasklet("sum", "b = t", &["t"], &["b"]);
    let b = s.add_access("B");
    s.add_edge(a, None, me, Some("IN_0"), memlet("A", "0:10"));
    s.add_edge(me, Some("OUT_0"), t1, Some("a"), memlet("A", "i"));
    s.add_edge(t1, Some("t"), t, None, memlet("T", "0:3"));
    s.add_edge(t, None, t2, Some("t"), memlet("T", "0:3"));
    s.add_edge(t2, Some("b"), mx, Some("IN_0"), memlet("B", "i"));
    s.add_edge(mx, Some("OUT_0"), b, None, memlet("B", "0:10"));
    p
}

/// Map scopes of a state, in node order.
pub fn maps(state: &State) -> Vec<MapInfo> {
    state
        .nodes()
        .filter_map(|n| n.scope_info().and_then(|i| i.as_map()).cloned())
        .collect()
}

pub fn first_state(p: &Program) -> &State {
    p.state(StateId(0)).unwrap()
}
