// transformation.rs — Pattern-matching graph rewrite framework
//
// A transformation declares the node-path patterns it rewrites, a pure
// legality predicate, and an in-place rewrite. Matching enumerates every
// occurrence of every pattern in a state, deterministically by node id.
// The rewrite may only run on a program for which the legality predicate
// just returned true; `apply_checked` enforces that discipline and
// `apply_repeated` is the caller-side fixpoint loop.
//
// Preconditions: matches are found on the program they are applied to.
// Postconditions: a rejected candidate leaves the program unchanged.
// Failure modes: `TransformError` for stale matches and for internal
//                consistency failures raised mid-rewrite.
// Side effects: `apply*` mutate the program in place.

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::graph::{MapKind, Node, NodeKind, Program, ScopeInfo, State};
use crate::id::{NodeId, StateId};

// ── Patterns ────────────────────────────────────────────────────────────────

/// Node-kind predicate for one position of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternNode {
    /// Entry of a parallel map.
    MapEntry,
    NestedProgram,
    Tasklet,
    Access,
    /// Entry of any scope kind.
    AnyEntry,
}

impl PatternNode {
    pub fn matches(self, node: &Node) -> bool {
        match (self, &node.kind) {
            (
                PatternNode::MapEntry,
                NodeKind::Entry {
                    info: ScopeInfo::Map(m),
                    ..
                },
            ) => m.kind == MapKind::Parallel,
            (PatternNode::NestedProgram, NodeKind::Nested { .. }) => true,
            (PatternNode::Tasklet, NodeKind::Tasklet { .. }) => true,
            (PatternNode::Access, NodeKind::Access { .. }) => true,
            (PatternNode::AnyEntry, NodeKind::Entry { .. }) => true,
            _ => false,
        }
    }
}

/// A path of node predicates, consecutive positions joined by an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub nodes: Vec<PatternNode>,
}

impl Pattern {
    pub fn path(nodes: &[PatternNode]) -> Self {
        Pattern {
            nodes: nodes.to_vec(),
        }
    }

    pub fn single(node: PatternNode) -> Self {
        Pattern { nodes: vec![node] }
    }

    /// Every occurrence of the pattern in `state`, ordered by node ids.
    pub fn find(&self, state: &State) -> Vec<Vec<NodeId>> {
        let Some(first) = self.nodes.first() else {
            return Vec::new();
        };
        let mut partial: Vec<Vec<NodeId>> = state
            .nodes()
            .filter(|n| first.matches(n))
            .map(|n| vec![n.id])
            .collect();
        for pred in &self.nodes[1..] {
            let mut next = Vec::new();
            for path in partial {
                let Some(&last) = path.last() else { continue };
                let mut succ: Vec<NodeId> = state.out_edges(last).iter().map(|e| e.dst).collect();
                succ.sort();
                succ.dedup();
                for dst in succ {
                    if path.contains(&dst) {
                        continue;
                    }
                    if state.node(dst).is_some_and(|n| pred.matches(n)) {
                        let mut extended = path.clone();
                        extended.push(dst);
                        next.push(extended);
                    }
                }
            }
            partial = next;
        }
        partial.sort();
        partial
    }

    /// Whether `nodes` is still an occurrence of the pattern in `state`.
    pub fn holds(&self, state: &State, nodes: &[NodeId]) -> bool {
        if nodes.len() != self.nodes.len() {
            return false;
        }
        let kinds_ok = self
            .nodes
            .iter()
            .zip(nodes)
            .all(|(pred, &id)| state.node(id).is_some_and(|n| pred.matches(n)));
        kinds_ok
            && nodes
                .windows(2)
                .all(|w| !state.edges_between(w[0], w[1]).is_empty())
    }
}

/// One occurrence of one of a transformation's patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub state: StateId,
    /// Index into `Transformation::expressions()`.
    pub expr_index: usize,
    pub nodes: Vec<NodeId>,
}

// ── Errors and reports ──────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    /// No stride of the outer container corresponds to a dimension of the
    /// inner one; the legality check should have rejected the match.
    #[error("no stride correspondence for dimension {dim} of '{container}' in nested program '{nested}'")]
    StrideCorrespondence {
        nested: String,
        container: String,
        dim: usize,
    },
    #[error("{transformation}: match {nodes:?} in state {state} is no longer present")]
    StaleMatch {
        transformation: &'static str,
        state: StateId,
        nodes: Vec<NodeId>,
    },
}

/// What a rewrite changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    /// Scope entries created by the rewrite, each with the state holding it.
    /// For a split inside a nested program the state belongs to that program.
    pub new_scopes: Vec<(StateId, NodeId)>,
    /// Scalars replaced by arrays.
    pub promoted: Vec<String>,
    /// Arrays whose layout was augmented, each listed once.
    pub augmented: Vec<String>,
}

// ── Transformation contract ─────────────────────────────────────────────────

pub trait Transformation {
    fn name(&self) -> &'static str;

    /// Candidate patterns, tried in order.
    fn expressions(&self) -> Vec<Pattern>;

    /// Pure legality predicate. Never mutates the program.
    fn can_be_applied(&self, program: &Program, m: &Match, permissive: bool) -> bool;

    /// Perform the rewrite. Only called after `can_be_applied` returned true
    /// for `m` on this exact program.
    fn apply(&self, program: &mut Program, m: &Match) -> Result<RewriteReport, TransformError>;
}

/// Every occurrence of every expression of `t` in `state`.
pub fn find_matches<T: Transformation + ?Sized>(program: &Program, state: StateId, t: &T) -> Vec<Match> {
    let Some(st) = program.state(state) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (expr_index, pattern) in t.expressions().iter().enumerate() {
        for nodes in pattern.find(st) {
            out.push(Match {
                state,
                expr_index,
                nodes,
            });
        }
    }
    trace!(transformation = t.name(), %state, candidates = out.len(), "matched");
    out
}

/// Apply `m` if it is legal. `Ok(None)` is a legality rejection, and leaves
/// the program untouched.
pub fn apply_checked<T: Transformation + ?Sized>(
    program: &mut Program,
    t: &T,
    m: &Match,
) -> Result<Option<RewriteReport>, TransformError> {
    let present = program.state(m.state).is_some_and(|st| {
        t.expressions()
            .get(m.expr_index)
            .is_some_and(|p| p.holds(st, &m.nodes))
    });
    if !present {
        return Err(TransformError::StaleMatch {
            transformation: t.name(),
            state: m.state,
            nodes: m.nodes.clone(),
        });
    }
    if !t.can_be_applied(program, m, false) {
        debug!(transformation = t.name(), state = %m.state, nodes = ?m.nodes, "candidate rejected");
        return Ok(None);
    }
    let report = t.apply(program, m)?;
    info!(
        transformation = t.name(),
        state = %m.state,
        new_scopes = report.new_scopes.len(),
        promoted = ?report.promoted,
        augmented = ?report.augmented,
        "rewrite applied"
    );
    Ok(Some(report))
}

/// Result of a fixpoint run.
#[derive(Debug, Clone, Default)]
pub struct RepeatOutcome {
    pub reports: Vec<RewriteReport>,
    /// The bound stopped the run while legal candidates remained.
    pub bound_reached: bool,
}

impl RepeatOutcome {
    pub fn applied(&self) -> usize {
        self.reports.len()
    }
}

/// Apply `t` until no legal candidate remains or `max_rewrites` rewrites
/// have been applied. Matching is re-run after every rewrite.
pub fn apply_repeated<T: Transformation + ?Sized>(
    program: &mut Program,
    t: &T,
    max_rewrites: usize,
) -> Result<RepeatOutcome, TransformError> {
    let mut outcome = RepeatOutcome::default();
    loop {
        let candidate = program.state_ids().into_iter().find_map(|sid| {
            find_matches(program, sid, t)
                .into_iter()
                .find(|m| t.can_be_applied(program, m, false))
        });
        let Some(m) = candidate else { break };
        if outcome.applied() >= max_rewrites {
            outcome.bound_reached = true;
            break;
        }
        if let Some(report) = apply_checked(program, t, &m)? {
            outcome.reports.push(report);
        }
    }
    debug!(
        transformation = t.name(),
        applied = outcome.applied(),
        bound_reached = outcome.bound_reached,
        "fixpoint run finished"
    );
    Ok(outcome)
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Named transformations available to the pipeline and CLI.
pub struct TransformationRegistry {
    entries: IndexMap<&'static str, Box<dyn Transformation>>,
}

impl Default for TransformationRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TransformationRegistry {
    pub fn new() -> Self {
        TransformationRegistry {
            entries: IndexMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut reg = TransformationRegistry::new();
        reg.register(Box::new(crate::map_fission::MapFission));
        reg
    }

    pub fn register(&mut self, t: Box<dyn Transformation>) {
        self.entries.insert(t.name(), t);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Transformation> {
        self.entries.get(name).map(|b| b.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
