// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the compiler's six passes (loading the program is outside the
// runner), their dependency edges, and the artifacts they produce. Used by the
// pipeline runner to compute minimal pass subsets for each --emit target.

use std::collections::HashSet;

// ── Stage certificates ─────────────────────────────────────────────────────

/// Machine-checkable evidence that a stage met its postconditions.
pub trait StageCert {
    /// True iff every obligation holds.
    fn all_pass(&self) -> bool;

    /// Named obligations and whether each one holds, in a stable order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;
}

/// Names of the obligations a certificate failed.
pub fn failed_obligations(cert: &impl StageCert) -> Vec<&'static str> {
    cert.obligations()
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect()
}

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each compiler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Validate,
    Fission,
    Propagate,
    Lower,
    VerifyTree,
    Emit,
}

/// Machine-readable artifact identifiers. Each maps to a field of the
/// compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    GraphCert, // GraphCert
    Rewrites,  // Vec<RewriteReport>
    Program,   // Program (rewritten in place)
    Tree,      // ScheduleTree
    TreeCert,  // TreeCert
    Script,    // String
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Validate => PassDescriptor {
            name: "validate",
            inputs: &[],
            outputs: &[ArtifactId::GraphCert],
            invalidation_key: "program + library registry",
            invariants: "V1-V6 obligations verified",
        },
        PassId::Fission => PassDescriptor {
            name: "fission",
            inputs: &[PassId::Validate],
            outputs: &[ArtifactId::Rewrites, ArtifactId::Program],
            invalidation_key: "program + enabled transformations + rewrite bound",
            invariants: "each rewrite applied only after its legality check passed",
        },
        PassId::Propagate => PassDescriptor {
            name: "propagate",
            inputs: &[PassId::Fission],
            outputs: &[ArtifactId::Program],
            invalidation_key: "program",
            invariants: "outer memlets cover the union of their interior accesses",
        },
        PassId::Lower => PassDescriptor {
            name: "lower",
            inputs: &[PassId::Propagate],
            outputs: &[ArtifactId::Tree],
            invalidation_key: "program",
            invariants: "every state and scope has a tree counterpart",
        },
        PassId::VerifyTree => PassDescriptor {
            name: "verify_tree",
            inputs: &[PassId::Lower],
            outputs: &[ArtifactId::TreeCert],
            invalidation_key: "tree",
            invariants: "T1-T3 obligations verified",
        },
        PassId::Emit => PassDescriptor {
            name: "emit",
            inputs: &[PassId::VerifyTree],
            outputs: &[ArtifactId::Script],
            invalidation_key: "tree",
            invariants: "script re-parses to an equivalent tree",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 6] = [
    PassId::Validate,
    PassId::Fission,
    PassId::Propagate,
    PassId::Lower,
    PassId::VerifyTree,
    PassId::Emit,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<(&'static str, bool)>);

    impl StageCert for Fixed {
        fn all_pass(&self) -> bool {
            self.0.iter().all(|(_, ok)| *ok)
        }
        fn obligations(&self) -> Vec<(&'static str, bool)> {
            self.0.clone()
        }
    }

    #[test]
    fn required_passes_propagate_skips_lowering() {
        let passes = required_passes(PassId::Propagate);
        assert_eq!(
            passes,
            vec![PassId::Validate, PassId::Fission, PassId::Propagate]
        );
        assert!(!passes.contains(&PassId::Lower));
    }

    #[test]
    fn required_passes_emit_includes_all() {
        let passes = required_passes(PassId::Emit);
        assert_eq!(passes, ALL_PASSES.to_vec());
    }

    #[test]
    fn required_passes_validate_is_minimal() {
        assert_eq!(required_passes(PassId::Validate), vec![PassId::Validate]);
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            assert!(
                !desc.outputs.is_empty(),
                "pass {:?} has no outputs declared",
                pass
            );
        }
    }

    #[test]
    fn pass_names_are_unique() {
        let names: HashSet<_> = ALL_PASSES.iter().map(|p| descriptor(*p).name).collect();
        assert_eq!(names.len(), ALL_PASSES.len());
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            let order = required_passes(*pass);
            for dep in desc.inputs {
                let dep_pos = order.iter().position(|p| p == dep);
                let self_pos = order.iter().position(|p| p == pass);
                assert!(
                    dep_pos.unwrap() < self_pos.unwrap(),
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }

    #[test]
    fn failed_obligations_lists_only_failures() {
        let cert = Fixed(vec![("A", true), ("B", false), ("C", false)]);
        assert!(!cert.all_pass());
        assert_eq!(failed_obligations(&cert), vec!["B", "C"]);
    }
}
