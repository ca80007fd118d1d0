// propagate.rs — Memlet propagation across scope boundaries
//
// Recomputes the memlet of every edge that feeds a scope entry (`IN_k`) or
// leaves a scope exit (`OUT_k`) from the memlets on the matching inner
// connector (`OUT_k` / `IN_k`): the outer subset is the bounding union of
// the inner subsets swept over the scope's iteration space. Scopes are
// processed innermost first so outer scopes see already-propagated inner
// edges.
//
// Preconditions: subsets are monotone in the scope parameters.
// Postconditions: every scope-boundary edge carries the propagated subset;
//                 reducers on inner edges carry over to the outer edge.
// Failure modes: none; a connector whose inner subsets have mismatched
//                ranks keeps its outer memlet.
// Side effects: mutates edge memlets of the given state.

use std::cmp::Reverse;

use tracing::trace;

use crate::graph::{paired_connector, NodeKind, Program, State};
use crate::id::{EdgeId, NodeId, StateId};
use crate::memlet::Memlet;
use crate::scope_index::ScopeIndex;
use crate::subset::Range;

/// Propagate memlets of one state of `program`.
pub fn propagate_memlets_state(program: &mut Program, state: StateId) {
    if let Some(st) = program.state_mut(state) {
        propagate_state(st);
    }
}

/// Propagate every state of `program`, nested programs included.
pub fn propagate_program(program: &mut Program) {
    for st in &mut program.states {
        for node in st.nodes_mut() {
            if let NodeKind::Nested { program: inner, .. } = &mut node.kind {
                propagate_program(inner);
            }
        }
        propagate_state(st);
    }
}

pub fn propagate_state(st: &mut State) {
    let index = ScopeIndex::build(st);
    let mut entries: Vec<NodeId> = st.nodes().filter(|n| n.is_entry()).map(|n| n.id).collect();
    entries.sort_by_key(|&e| (Reverse(index.depth(e)), e));

    for entry in entries {
        let Some(info) = st.node(entry).and_then(|n| n.scope_info()).cloned() else {
            continue;
        };
        let params = info.params();
        let space = info.range();

        let in_conns: Vec<String> = st
            .node(entry)
            .map(|n| n.in_connectors.clone())
            .unwrap_or_default();
        for conn in in_conns.iter().filter(|c| c.starts_with("IN_")) {
            let Some(inner_conn) = paired_connector(conn) else { continue };
            let inner: Vec<Memlet> = st
                .out_edges_by_connector(entry, &inner_conn)
                .iter()
                .map(|e| e.memlet.clone())
                .collect();
            let outer: Vec<_> = st.in_edges_by_connector(entry, conn).iter().map(|e| e.id).collect();
            update_outer(st, &outer, &inner, &params, &space, false);
        }

        let Some(exit) = st.exit_node(entry) else { continue };
        let out_conns: Vec<String> = st
            .node(exit)
            .map(|n| n.out_connectors.clone())
            .unwrap_or_default();
        for conn in out_conns.iter().filter(|c| c.starts_with("OUT_")) {
            let Some(inner_conn) = paired_connector(conn) else { continue };
            let inner: Vec<Memlet> = st
                .in_edges_by_connector(exit, &inner_conn)
                .iter()
                .map(|e| e.memlet.clone())
                .collect();
            let outer: Vec<_> = st.out_edges_by_connector(exit, conn).iter().map(|e| e.id).collect();
            update_outer(st, &outer, &inner, &params, &space, true);
        }
    }
}

fn update_outer(
    st: &mut State,
    outer: &[EdgeId],
    inner: &[Memlet],
    params: &[String],
    space: &Range,
    carry_wcr: bool,
) {
    for &eid in outer {
        let Some(edge) = st.edge_mut(eid) else { continue };
        let target = edge.memlet.data.clone();
        let Some(propagated) = propagate_for(inner, target.as_deref(), params, space) else {
            continue;
        };
        trace!(edge = %eid, memlet = %propagated, "propagated");
        if edge.memlet.data.is_none() {
            edge.memlet.data = propagated.data.clone();
        }
        edge.memlet.subset = propagated.subset;
        edge.memlet.dynamic |= propagated.dynamic;
        if carry_wcr && propagated.wcr.is_some() {
            edge.memlet.wcr = propagated.wcr;
        }
    }
}

/// Propagate the subsets of `memlets` that refer to `data` (or, when a
/// memlet refers to the other endpoint, its paired subset).
fn propagate_for(
    memlets: &[Memlet],
    data: Option<&str>,
    params: &[String],
    space: &Range,
) -> Option<Memlet> {
    let mut picked = Vec::new();
    for m in memlets.iter().filter(|m| !m.is_empty()) {
        match data {
            Some(d) if !m.refers_to(d) => {
                if let Some(other) = &m.other_subset {
                    let mut alias = m.clone();
                    alias.data = Some(d.to_string());
                    alias.subset = Some(other.clone());
                    alias.other_subset = None;
                    picked.push(alias);
                }
            }
            _ => picked.push(m.clone()),
        }
    }
    propagate_subset(&picked, params, space)
}

/// Union of the images of every non-empty memlet over `params` ∈ `space`.
/// Data, reducer and dynamic flag come from the inputs.
pub fn propagate_subset(memlets: &[Memlet], params: &[String], space: &Range) -> Option<Memlet> {
    let mut result: Option<Memlet> = None;
    for m in memlets.iter().filter(|m| !m.is_empty()) {
        let Some(subset) = &m.subset else { continue };
        let image = subset.image(params, space);
        result = Some(match result {
            None => Memlet {
                data: m.data.clone(),
                subset: Some(image),
                other_subset: None,
                wcr: m.wcr.clone(),
                dynamic: m.dynamic,
            },
            Some(mut acc) => {
                let merged = acc.subset.as_ref().and_then(|s| s.bounding_union(&image));
                match merged {
                    Some(u) => acc.subset = Some(u),
                    None => return None,
                }
                if acc.wcr.is_none() {
                    acc.wcr = m.wcr.clone();
                }
                acc.dynamic |= m.dynamic;
                acc
            }
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MapKind;

    #[test]
    fn outer_edges_cover_iteration_space() {
        let mut s = State::new("s");
        let a = s.add_access("A");
        let (me, mx) = s.add_map("m", &["i"], Range::parse("0:10").unwrap(), MapKind::Parallel);
        let t = s.add_tasklet("t", "b = a", &["a"], &["b"]);
        let b = s.add_access("B");
        let ein = s.add_edge(a, None, me, Some("IN_0"), Memlet::simple("A", "0").unwrap());
        s.add_edge(me, Some("OUT_0"), t, Some("a"), Memlet::simple("A", "i").unwrap());
        s.add_edge(t, Some("b"), mx, Some("IN_0"), Memlet::simple("B", "0").unwrap().with_wcr("sum"));
        let eout = s.add_edge(mx, Some("OUT_0"), b, None, Memlet::simple("B", "0").unwrap());
        propagate_state(&mut s);
        assert_eq!(s.edge(ein).unwrap().memlet.to_string(), "A[0:10]");
        assert_eq!(s.edge(eout).unwrap().memlet.to_string(), "B(1, sum)[0]");
    }

    #[test]
    fn nested_scopes_propagate_innermost_first() {
        let mut s = State::new("s");
        let a = s.add_access("A");
        let (o, ox) = s.add_map("o", &["i"], Range::parse("0:4").unwrap(), MapKind::Parallel);
        let (n, nx) = s.add_map("n", &["j"], Range::parse("0:8").unwrap(), MapKind::Parallel);
        let t = s.add_tasklet("t", "", &["a"], &[]);
        let outer = s.add_edge(a, None, o, Some("IN_0"), Memlet::simple("A", "0, 0").unwrap());
        let mid = s.add_edge(o, Some("OUT_0"), n, Some("IN_0"), Memlet::simple("A", "0, 0").unwrap());
        s.add_edge(n, Some("OUT_0"), t, Some("a"), Memlet::simple("A", "i, j").unwrap());
        s.add_edge(t, None, nx, None, Memlet::empty());
        s.add_edge(nx, None, ox, None, Memlet::empty());
        propagate_state(&mut s);
        assert_eq!(s.edge(mid).unwrap().memlet.to_string(), "A[i, 0:8]");
        assert_eq!(s.edge(outer).unwrap().memlet.to_string(), "A[0:4, 0:8]");
    }

    #[test]
    fn propagate_subset_unions_images() {
        let ms = vec![
            Memlet::simple("A", "i").unwrap(),
            Memlet::simple("A", "i + 1").unwrap(),
        ];
        let out = propagate_subset(&ms, &["i".to_string()], &Range::parse("0:10").unwrap()).unwrap();
        assert_eq!(out.to_string(), "A[0:11]");
    }
}
