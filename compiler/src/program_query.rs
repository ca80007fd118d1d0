// program_query.rs — Whole-program container queries
//
// Eliminates duplicated state/node iteration patterns across validation,
// fission legality and lowering.

use std::collections::HashSet;

use crate::graph::Program;
use crate::id::{NodeId, StateId};

/// Every access node of `data`, across all states.
pub fn access_nodes_of(program: &Program, data: &str) -> Vec<(StateId, NodeId)> {
    let mut out = Vec::new();
    for (sid, state) in program.state_ids().into_iter().zip(&program.states) {
        for node in state.nodes() {
            if node.access_data() == Some(data) {
                out.push((sid, node.id));
            }
        }
    }
    out
}

/// States containing an access node or memlet that refers to `data`.
pub fn states_using(program: &Program, data: &str) -> Vec<StateId> {
    program
        .state_ids()
        .into_iter()
        .zip(&program.states)
        .filter(|(_, state)| {
            state.nodes().any(|n| n.access_data() == Some(data))
                || state.edges().any(|e| e.memlet.refers_to(data))
        })
        .map(|(sid, _)| sid)
        .collect()
}

/// Whether `data` is touched anywhere except the nodes of `region` in
/// `state`: by an access node, or by a memlet on an edge with an endpoint
/// outside the region, in this or any other state.
pub fn used_outside(program: &Program, state: StateId, region: &HashSet<NodeId>, data: &str) -> bool {
    for (sid, st) in program.state_ids().into_iter().zip(&program.states) {
        let local = sid == state;
        let inside = |n: NodeId| local && region.contains(&n);
        if st
            .nodes()
            .any(|n| !inside(n.id) && n.access_data() == Some(data))
        {
            return true;
        }
        if st
            .edges()
            .any(|e| e.memlet.refers_to(data) && !(inside(e.src) && inside(e.dst)))
        {
            return true;
        }
    }
    false
}

/// Names of the containers referenced by an access node or memlet in any
/// state.
pub fn referenced_containers(program: &Program) -> HashSet<String> {
    let mut out = HashSet::new();
    for state in &program.states {
        for node in state.nodes() {
            if let Some(d) = node.access_data() {
                out.insert(d.to_string());
            }
        }
        for e in state.edges() {
            if let Some(d) = e.memlet.data_name() {
                out.insert(d.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DType, Data};
    use crate::memlet::Memlet;
    use crate::symbolic::Expr;

    fn two_states() -> (Program, NodeId, NodeId) {
        let mut p = Program::new("p");
        p.add_array("T", Data::array(DType::Float64, vec![Expr::int(4)]).transient());
        let s0 = p.add_state("s0");
        let s1 = p.add_state("s1");
        let st = p.state_mut(s0).unwrap();
        let t = st.add_tasklet("w", "t = 1", &[], &["t"]);
        let a = st.add_access("T");
        st.add_edge(t, Some("t"), a, None, Memlet::simple("T", "0:4").unwrap());
        let st1 = p.state_mut(s1).unwrap();
        st1.add_access("T");
        p.add_transition(s0, s1, "1", &[]);
        (p, t, a)
    }

    #[test]
    fn finds_access_nodes_in_every_state() {
        let (p, _, a) = two_states();
        let found = access_nodes_of(&p, "T");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], (StateId(0), a));
        assert_eq!(states_using(&p, "T"), vec![StateId(0), StateId(1)]);
    }

    #[test]
    fn use_in_another_state_counts_as_outside() {
        let (p, t, a) = two_states();
        let region: HashSet<NodeId> = [t, a].into_iter().collect();
        assert!(used_outside(&p, StateId(0), &region, "T"));
        let mut only_local = p.clone();
        only_local.states[1] = crate::graph::State::new("s1");
        assert!(!used_outside(&only_local, StateId(0), &region, "T"));
    }
}
