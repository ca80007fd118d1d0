// id.rs — Stable arena handles for dfc graphs and schedule trees
//
// Graph nodes, edges and states live in append-only arenas. A handle stays
// valid for the lifetime of its arena: removal leaves a tombstone, and slots
// are never reused, so a handle can never silently point at a different node.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a node within one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Handle of a memlet edge within one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub u32);

/// Handle of a state within one program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(pub u32);

/// Handle of a schedule tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeNodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl EdgeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl StateId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TreeNodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Produces fresh names for synthesized containers and scopes.
///
/// Names are derived from a base and a monotonically increasing suffix, in
/// request order, so repeated runs produce identical programs.
#[derive(Debug, Default)]
pub struct NameAllocator {
    next: u32,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `base` if `taken` rejects it, otherwise `base_<n>` for the
    /// first free `n`.
    pub fn fresh(&mut self, base: &str, taken: impl Fn(&str) -> bool) -> String {
        if !taken(base) {
            return base.to_string();
        }
        loop {
            let candidate = format!("{}_{}", base, self.next);
            self.next += 1;
            if !taken(&candidate) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_name_keeps_free_base() {
        let mut names = NameAllocator::new();
        assert_eq!(names.fresh("T", |_| false), "T");
    }

    #[test]
    fn fresh_name_skips_taken_suffixes() {
        let mut names = NameAllocator::new();
        let taken = ["T", "T_0", "T_1"];
        let name = names.fresh("T", |n| taken.contains(&n));
        assert_eq!(name, "T_2");
    }
}
