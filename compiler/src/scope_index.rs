// scope_index.rs — Scope membership of the nodes of one state
//
// Maps every node to the entry of its innermost enclosing scope. An entry
// and its exit both belong to the scope that encloses the pair; interior
// nodes belong to the entry. Built in topological order from the scope
// connectors, so it must be rebuilt after any structural edit.

use std::collections::HashMap;

use crate::graph::State;
use crate::id::NodeId;

#[derive(Debug, Clone, Default)]
pub struct ScopeIndex {
    parent: HashMap<NodeId, Option<NodeId>>,
}

impl ScopeIndex {
    pub fn build(state: &State) -> Self {
        let mut parent: HashMap<NodeId, Option<NodeId>> = HashMap::new();
        let order = state.topological_order();

        for &id in &order {
            if state.node(id).is_none() {
                continue;
            }
            if let Some(entry) = state.entry_node(id) {
                let scope = parent.get(&entry).copied().flatten();
                parent.insert(id, scope);
                continue;
            }
            let scope = match state.in_edges(id).first() {
                Some(e) if state.node(e.src).is_some_and(|n| n.is_entry()) => Some(e.src),
                Some(e) => parent.get(&e.src).copied().flatten(),
                // Input-less nodes inherit the scope of the exit they feed.
                None => state
                    .out_edges(id)
                    .iter()
                    .find_map(|e| state.entry_node(e.dst).filter(|&en| en != id)),
            };
            parent.insert(id, scope);
        }
        ScopeIndex { parent }
    }

    /// Innermost enclosing scope entry, `None` at the top level.
    pub fn scope_of(&self, id: NodeId) -> Option<NodeId> {
        self.parent.get(&id).copied().flatten()
    }

    /// Nodes directly inside `scope` (`None` = top level), in id order.
    /// Exits are excluded; entries of nested scopes are included.
    pub fn scope_children(&self, state: &State, scope: Option<NodeId>) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = state
            .nodes()
            .filter(|n| !n.is_exit() && self.scope_of(n.id) == scope)
            .map(|n| n.id)
            .collect();
        out.sort();
        out
    }

    /// Every node strictly inside the scope of `entry`, at any depth,
    /// excluding the entry and its exit.
    pub fn scope_subgraph(&self, state: &State, entry: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = state
            .nodes()
            .filter(|n| n.id != entry && self.is_within(n.id, entry))
            .map(|n| n.id)
            .collect();
        out.sort();
        out
    }

    /// Whether `id` lies inside the scope of `entry` at any depth.
    pub fn is_within(&self, id: NodeId, entry: NodeId) -> bool {
        let mut cur = self.scope_of(id);
        while let Some(s) = cur {
            if s == entry {
                return true;
            }
            cur = self.scope_of(s);
        }
        false
    }

    /// Number of scopes enclosing `id`.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut cur = self.scope_of(id);
        while let Some(s) = cur {
            depth += 1;
            cur = self.scope_of(s);
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MapKind;
    use crate::memlet::Memlet;
    use crate::subset::Range;

    #[test]
    fn nested_scopes_resolve_parents() {
        let mut s = State::new("s");
        let a = s.add_access("A");
        let (outer, outer_x) = s.add_map("o", &["i"], Range::parse("0:4").unwrap(), MapKind::Parallel);
        let (inner, inner_x) = s.add_map("n", &["j"], Range::parse("0:4").unwrap(), MapKind::Parallel);
        let t = s.add_tasklet("t", "b = a", &["a"], &["b"]);
        let b = s.add_access("B");
        s.add_edge(a, None, outer, Some("IN_0"), Memlet::simple("A", "0:4, 0:4").unwrap());
        s.add_edge(outer, Some("OUT_0"), inner, Some("IN_0"), Memlet::simple("A", "i, 0:4").unwrap());
        s.add_edge(inner, Some("OUT_0"), t, Some("a"), Memlet::simple("A", "i, j").unwrap());
        s.add_edge(t, Some("b"), inner_x, Some("IN_0"), Memlet::simple("B", "i, j").unwrap());
        s.add_edge(inner_x, Some("OUT_0"), outer_x, Some("IN_0"), Memlet::simple("B", "i, 0:4").unwrap());
        s.add_edge(outer_x, Some("OUT_0"), b, None, Memlet::simple("B", "0:4, 0:4").unwrap());

        let idx = ScopeIndex::build(&s);
        assert_eq!(idx.scope_of(a), None);
        assert_eq!(idx.scope_of(outer), None);
        assert_eq!(idx.scope_of(outer_x), None);
        assert_eq!(idx.scope_of(inner), Some(outer));
        assert_eq!(idx.scope_of(inner_x), Some(outer));
        assert_eq!(idx.scope_of(t), Some(inner));
        assert_eq!(idx.scope_of(b), None);
        assert_eq!(idx.depth(t), 2);
        assert_eq!(idx.scope_children(&s, Some(outer)), vec![inner]);
        assert_eq!(idx.scope_subgraph(&s, outer), vec![inner, inner_x, t]);
        assert!(idx.is_within(t, outer));
    }

    #[test]
    fn inputless_node_joins_scope_of_its_exit() {
        let mut s = State::new("s");
        let (me, mx) = s.add_map("m", &["i"], Range::parse("0:4").unwrap(), MapKind::Parallel);
        let t = s.add_tasklet("t", "b = 1", &[], &["b"]);
        let b = s.add_access("B");
        s.add_edge(t, Some("b"), mx, Some("IN_0"), Memlet::simple("B", "i").unwrap());
        s.add_edge(mx, Some("OUT_0"), b, None, Memlet::simple("B", "0:4").unwrap());
        let idx = ScopeIndex::build(&s);
        assert_eq!(idx.scope_of(t), Some(me));
    }
}
