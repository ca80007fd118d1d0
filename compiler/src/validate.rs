// validate.rs — Structural validation of dataflow programs
//
// Checks the obligations every program must meet before and after each
// rewrite: declared containers, memlet ranks and bounds, matched scope
// pairs, scope boundaries and library operator signatures. Nested programs
// are validated recursively against their own container tables.
//
// Preconditions: none (any deserialised program may be checked).
// Postconditions: `GraphCert::all_pass()` iff no error diagnostic was produced.
// Failure modes: violations are reported as `Diagnostic`s (E01xx, E02xx).
// Side effects: none.

use std::cmp::Ordering;

use tracing::debug;

use crate::diag::{codes, DiagLevel, Diagnostic, Location};
use crate::graph::{NodeKind, Program, State};
use crate::id::{NodeId, StateId};
use crate::memlet::Memlet;
use crate::program_query::referenced_containers;
use crate::registry::{check_shapes, check_signature, Registry};
use crate::scope_index::ScopeIndex;
use crate::symbolic::{compare, Expr};

// ── Certificate ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for graph well-formedness (V1-V6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphCert {
    /// V1: every access node names a declared container.
    pub v1_access_declared: bool,
    /// V2: every non-empty memlet names a declared container of matching rank.
    pub v2_memlet_rank: bool,
    /// V3: no subset provably leaves its container's shape.
    pub v3_subset_bounds: bool,
    /// V4: scope entries and exits pair up one-to-one; states are acyclic.
    pub v4_scope_pairs: bool,
    /// V5: non-empty edges enter and leave scopes only through entry/exit.
    pub v5_scope_boundaries: bool,
    /// V6: library calls match their registered operator.
    pub v6_library_signatures: bool,
}

impl crate::pass::StageCert for GraphCert {
    fn all_pass(&self) -> bool {
        self.v1_access_declared
            && self.v2_memlet_rank
            && self.v3_subset_bounds
            && self.v4_scope_pairs
            && self.v5_scope_boundaries
            && self.v6_library_signatures
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("V1_access_declared", self.v1_access_declared),
            ("V2_memlet_rank", self.v2_memlet_rank),
            ("V3_subset_bounds", self.v3_subset_bounds),
            ("V4_scope_pairs", self.v4_scope_pairs),
            ("V5_scope_boundaries", self.v5_scope_boundaries),
            ("V6_library_signatures", self.v6_library_signatures),
        ]
    }
}

// ── Public entry points ─────────────────────────────────────────────────────

/// Validate against the built-in library operators.
pub fn validate_program(program: &Program) -> (GraphCert, Vec<Diagnostic>) {
    validate_with(program, &Registry::builtin())
}

pub fn validate_with(program: &Program, registry: &Registry) -> (GraphCert, Vec<Diagnostic>) {
    let mut v = Validator {
        registry,
        diagnostics: Vec::new(),
        failed: [false; 6],
        context: Vec::new(),
    };
    v.program(program);
    let cert = GraphCert {
        v1_access_declared: !v.failed[0],
        v2_memlet_rank: !v.failed[1],
        v3_subset_bounds: !v.failed[2],
        v4_scope_pairs: !v.failed[3],
        v5_scope_boundaries: !v.failed[4],
        v6_library_signatures: !v.failed[5],
    };
    debug!(
        program = %program.name,
        diagnostics = v.diagnostics.len(),
        ?cert,
        "validated program"
    );
    (cert, v.diagnostics)
}

// ── Validator ───────────────────────────────────────────────────────────────

struct Validator<'r> {
    registry: &'r Registry,
    diagnostics: Vec<Diagnostic>,
    failed: [bool; 6],
    /// Labels of the nested programs being descended through.
    context: Vec<String>,
}

impl Validator<'_> {
    fn report(&mut self, obligation: usize, diag: Diagnostic) {
        if diag.level == DiagLevel::Error {
            self.failed[obligation] = true;
        }
        let diag = match self.context.last() {
            Some(label) => diag.with_cause(format!("inside nested program '{label}'"), None),
            None => diag,
        };
        self.diagnostics.push(diag);
    }

    fn program(&mut self, program: &Program) {
        for (sid, state) in program.state_ids().into_iter().zip(&program.states) {
            self.state(program, sid, state);
        }
        let used = referenced_containers(program);
        for (name, desc) in &program.arrays {
            if desc.transient && !used.contains(name) {
                self.diagnostics.push(
                    Diagnostic::warning(
                        Location::Program,
                        format!("transient container '{name}' is never used"),
                    )
                    .with_code(codes::W0001),
                );
            }
        }
    }

    fn state(&mut self, program: &Program, sid: StateId, state: &State) {
        if !state.is_acyclic() {
            self.report(
                3,
                Diagnostic::error(Location::state(sid), format!("state '{}' has a cycle", state.label))
                    .with_code(codes::E0107),
            );
        }
        let index = ScopeIndex::build(state);

        for node in state.nodes() {
            let at = Location::node(sid, node.id);
            match &node.kind {
                NodeKind::Access { data } if !program.arrays.contains_key(data) => {
                    self.report(
                        0,
                        Diagnostic::error(at, format!("access to undeclared container '{data}'"))
                            .with_code(codes::E0100),
                    );
                }
                NodeKind::Entry { info, exit } => {
                    let paired = matches!(
                        state.node(*exit).map(|n| &n.kind),
                        Some(NodeKind::Exit { entry }) if *entry == node.id
                    );
                    if !paired {
                        self.report(
                            3,
                            Diagnostic::error(
                                at,
                                format!("scope '{}' has no matching exit", info.label()),
                            )
                            .with_code(codes::E0104),
                        );
                    }
                }
                NodeKind::Exit { entry } => {
                    let paired = matches!(
                        state.node(*entry).map(|n| &n.kind),
                        Some(NodeKind::Entry { exit, .. }) if *exit == node.id
                    );
                    if !paired {
                        self.report(
                            3,
                            Diagnostic::error(at, "scope exit has no matching entry")
                                .with_code(codes::E0104),
                        );
                    }
                }
                NodeKind::Library {
                    op, properties, ..
                } => match self.registry.lookup(op) {
                    Some(meta) => {
                        let mut diags = check_signature(meta, state, sid, node.id, properties);
                        diags.extend(check_shapes(op, program, state, sid, node.id));
                        for d in diags {
                            self.report(5, d);
                        }
                    }
                    None => self.report(
                        5,
                        Diagnostic::error(at, format!("unknown library operator '{op}'"))
                            .with_code(codes::E0200),
                    ),
                },
                NodeKind::Nested { label, program: inner, .. } => {
                    self.context.push(label.clone());
                    self.program(inner);
                    self.context.pop();
                }
                _ => {}
            }
        }

        for edge in state.edges() {
            let at = Location::node(sid, edge.dst);
            if !edge.memlet.is_empty() {
                self.memlet(program, &edge.memlet, at);
            }
            let from = outgoing_scope(state, &index, edge.src);
            let to = incoming_scope(state, &index, edge.dst);
            if from != to && !edge.memlet.is_empty() {
                self.report(
                    4,
                    Diagnostic::error(
                        at,
                        format!(
                            "edge {} -> {} ({}) bypasses a scope boundary",
                            edge.src, edge.dst, edge.memlet
                        ),
                    )
                    .with_code(codes::E0105)
                    .with_hint("route the edge through the scope entry or exit"),
                );
            }
        }
    }

    fn memlet(&mut self, program: &Program, memlet: &Memlet, at: Location) {
        let Some(data) = memlet.data_name() else {
            return;
        };
        let Some(desc) = program.arrays.get(data) else {
            self.report(
                1,
                Diagnostic::error(at, format!("memlet refers to undeclared container '{data}'"))
                    .with_code(codes::E0101),
            );
            return;
        };
        let Some(subset) = &memlet.subset else {
            return;
        };
        if subset.rank() != desc.shape.len() {
            self.report(
                1,
                Diagnostic::error(
                    at,
                    format!(
                        "subset [{subset}] has rank {}, container '{data}' has rank {}",
                        subset.rank(),
                        desc.shape.len()
                    ),
                )
                .with_code(codes::E0102),
            );
            return;
        }
        for (i, (dim, extent)) in subset.dims.iter().zip(&desc.shape).enumerate() {
            let below = compare(&dim.start, &Expr::zero()) == Some(Ordering::Less);
            let above = matches!(
                compare(&dim.end, extent),
                Some(Ordering::Greater | Ordering::Equal)
            );
            if below || above {
                self.report(
                    2,
                    Diagnostic::error(
                        at,
                        format!("subset [{subset}] is out of bounds for '{data}'"),
                    )
                    .with_code(codes::E0103)
                    .with_cause(
                        format!("dimension {i} spans {}..={}, extent is {extent}", dim.start, dim.end),
                        None,
                    ),
                );
                return;
            }
        }
    }
}

/// The scope an edge leaving `node` starts in: an entry's edges lead inside.
fn outgoing_scope(state: &State, index: &ScopeIndex, node: NodeId) -> Option<NodeId> {
    match state.node(node).map(|n| &n.kind) {
        Some(NodeKind::Entry { .. }) => Some(node),
        _ => index.scope_of(node),
    }
}

/// The scope an edge arriving at `node` ends in: an exit's edges come from inside.
fn incoming_scope(state: &State, index: &ScopeIndex, node: NodeId) -> Option<NodeId> {
    match state.node(node).map(|n| &n.kind) {
        Some(NodeKind::Exit { entry }) => Some(*entry),
        _ => index.scope_of(node),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DType, Data};
    use crate::graph::{in_conn, out_conn, MapKind};
    use crate::pass::StageCert;
    use crate::subset::Range;
    use indexmap::IndexMap;

    /// `A -> map i in [0:10] { tasklet } -> B`
    fn mapped_copy() -> Program {
        let mut p = Program::new("p");
        p.add_array("A", Data::array(DType::Float64, vec![Expr::int(10)]));
        p.add_array("B", Data::array(DType::Float64, vec![Expr::int(10)]));
        let sid = p.add_state("s0");
        let s = p.state_mut(sid).unwrap();
        let a = s.add_access("A");
        let b = s.add_access("B");
        let (en, ex) = s.add_map("m", &["i"], Range::parse("0:10").unwrap(), MapKind::Parallel);
        let t = s.add_tasklet("t", "b = a", &["a"], &["b"]);
        s.add_edge(a, None, en, Some(&in_conn(0)), Memlet::simple("A", "0:10").unwrap());
        s.add_edge(en, Some(&out_conn(0)), t, Some("a"), Memlet::simple("A", "i").unwrap());
        s.add_edge(t, Some("b"), ex, Some(&in_conn(0)), Memlet::simple("B", "i").unwrap());
        s.add_edge(ex, Some(&out_conn(0)), b, None, Memlet::simple("B", "0:10").unwrap());
        p
    }

    fn codes_of(diags: &[Diagnostic]) -> Vec<crate::diag::DiagCode> {
        diags.iter().filter_map(|d| d.code).collect()
    }

    #[test]
    fn well_formed_program_passes() {
        let (cert, diags) = validate_program(&mapped_copy());
        assert!(cert.all_pass(), "{diags:?}");
        assert!(diags.is_empty());
    }

    #[test]
    fn undeclared_access_and_memlet() {
        let mut p = mapped_copy();
        p.arrays.shift_remove("B");
        let (cert, diags) = validate_program(&p);
        assert!(!cert.v1_access_declared);
        assert!(!cert.v2_memlet_rank);
        assert!(cert.v3_subset_bounds);
        assert!(codes_of(&diags).contains(&codes::E0100));
        assert!(codes_of(&diags).contains(&codes::E0101));
    }

    #[test]
    fn rank_mismatch_and_out_of_bounds() {
        let mut p = mapped_copy();
        let s = p.state_mut(StateId(0)).unwrap();
        let x = s.add_access("A");
        let y = s.add_access("B");
        s.add_edge(x, None, y, None, Memlet::simple("A", "0:10, 0").unwrap());
        let z = s.add_access("B");
        s.add_edge(y, None, z, None, Memlet::simple("B", "5:11").unwrap());
        let (cert, diags) = validate_program(&p);
        assert!(!cert.v2_memlet_rank);
        assert!(!cert.v3_subset_bounds);
        assert_eq!(codes_of(&diags), vec![codes::E0102, codes::E0103]);
    }

    #[test]
    fn symbolic_bounds_are_checked_when_provable() {
        let mut p = Program::new("p");
        p.add_symbol("N", DType::Int64);
        p.add_array("A", Data::array(DType::Float64, vec![Expr::sym("N")]));
        let sid = p.add_state("s0");
        let s = p.state_mut(sid).unwrap();
        let a = s.add_access("A");
        let b = s.add_access("A");
        s.add_edge(a, None, b, None, Memlet::simple("A", "0:N").unwrap());
        assert!(validate_program(&p).0.v3_subset_bounds);
        let s = p.state_mut(sid).unwrap();
        let c = s.add_access("A");
        s.add_edge(b, None, c, None, Memlet::simple("A", "1:N + 1").unwrap());
        assert!(!validate_program(&p).0.v3_subset_bounds);
    }

    #[test]
    fn edge_bypassing_scope_is_rejected() {
        let mut p = mapped_copy();
        let s = p.state_mut(StateId(0)).unwrap();
        let outside = s.add_access("A");
        // tasklet is node 4 (A, B, entry, exit, tasklet)
        s.add_edge(outside, None, NodeId(4), Some("c"), Memlet::simple("A", "0").unwrap());
        let (cert, diags) = validate_program(&p);
        assert!(!cert.v5_scope_boundaries);
        assert_eq!(codes_of(&diags), vec![codes::E0105]);
    }

    #[test]
    fn empty_edge_may_cross_scope() {
        let mut p = mapped_copy();
        let s = p.state_mut(StateId(0)).unwrap();
        let outside = s.add_access("A");
        s.add_edge(outside, None, NodeId(4), None, Memlet::empty());
        assert!(validate_program(&p).0.v5_scope_boundaries);
    }

    #[test]
    fn unmatched_scope_exit() {
        let mut p = mapped_copy();
        let s = p.state_mut(StateId(0)).unwrap();
        if let Some(n) = s.node_mut(NodeId(3)) {
            n.kind = NodeKind::Exit { entry: NodeId(0) };
        }
        let (cert, diags) = validate_program(&p);
        assert!(!cert.v4_scope_pairs);
        assert!(codes_of(&diags).contains(&codes::E0104));
    }

    #[test]
    fn library_operators_are_checked() {
        let mut p = Program::new("p");
        let sid = p.add_state("s0");
        let s = p.state_mut(sid).unwrap();
        s.add_library("x", "Conv", IndexMap::new(), &[], &[]);
        s.add_library("r", "Reduce", IndexMap::new(), &["_in"], &["_out"]);
        let (cert, diags) = validate_program(&p);
        assert!(!cert.v6_library_signatures);
        assert_eq!(codes_of(&diags), vec![codes::E0200]);
    }

    #[test]
    fn unused_transient_warns_without_failing() {
        let mut p = mapped_copy();
        p.add_array("T", Data::scalar(DType::Float64).transient());
        let (cert, diags) = validate_program(&p);
        assert!(cert.all_pass());
        assert_eq!(codes_of(&diags), vec![codes::W0001]);
    }

    #[test]
    fn nested_programs_are_validated() {
        let mut inner = Program::new("inner");
        let isid = inner.add_state("i0");
        inner.state_mut(isid).unwrap().add_access("missing");
        let mut p = Program::new("outer");
        let sid = p.add_state("s0");
        p.state_mut(sid)
            .unwrap()
            .add_nested("sub", inner, IndexMap::new(), &[], &[]);
        let (cert, diags) = validate_program(&p);
        assert!(!cert.v1_access_declared);
        assert_eq!(diags[0].cause_chain[0].message, "inside nested program 'sub'");
    }
}
