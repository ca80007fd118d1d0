// visit.rs — Traversal protocol for schedule trees
//
// `Visitor` is the read-only traversal: one method per node variant,
// dispatched by `Visitor::visit`. Scope methods recurse into children in
// stored order by default; leaf methods do nothing by default.
//
// `Transformer` is the rewriting traversal with the same dispatch. Each
// method returns a `Visit` telling the enclosing scope what to do with the
// node: keep it, drop it, replace it with another node, or splice a
// sequence in its place. The scope's child list is snapshotted before any
// child is visited and rebuilt afterwards, and every surviving child is
// re-parented to the scope.
//
// Preconditions: nodes handed to `Visit::Replace` / `Visit::Splice` were
//                allocated in the same tree.
// Postconditions: T1 (parent links) holds for every rebuilt scope.
// Failure modes: none.
// Side effects: `Transformer` mutates the tree.

use crate::id::TreeNodeId;
use crate::schedule::{ScheduleTree, TreeKind};

// ── Read-only visitor ───────────────────────────────────────────────────────

pub trait Visitor {
    fn visit(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        let Some(kind) = tree.kind(id) else { return };
        match kind {
            TreeKind::Root => self.visit_root(tree, id),
            TreeKind::GeneralBlock => self.visit_general_block(tree, id),
            TreeKind::For { .. } => self.visit_for(tree, id),
            TreeKind::While { .. } => self.visit_while(tree, id),
            TreeKind::DoWhile { .. } => self.visit_do_while(tree, id),
            TreeKind::If { .. } => self.visit_if(tree, id),
            TreeKind::Elif { .. } => self.visit_elif(tree, id),
            TreeKind::Else => self.visit_else(tree, id),
            TreeKind::StateIf { .. } => self.visit_state_if(tree, id),
            TreeKind::Map { .. } => self.visit_map(tree, id),
            TreeKind::Consume { .. } => self.visit_consume(tree, id),
            TreeKind::Pipeline { .. } => self.visit_pipeline(tree, id),
            TreeKind::Label { .. } => self.visit_label(tree, id),
            TreeKind::Goto { .. } => self.visit_goto(tree, id),
            TreeKind::Assign { .. } => self.visit_assign(tree, id),
            TreeKind::Break => self.visit_break(tree, id),
            TreeKind::Continue => self.visit_continue(tree, id),
            TreeKind::Tasklet { .. } => self.visit_tasklet(tree, id),
            TreeKind::Library { .. } => self.visit_library(tree, id),
            TreeKind::Copy { .. } => self.visit_copy(tree, id),
            TreeKind::DynScopeCopy { .. } => self.visit_dyn_scope_copy(tree, id),
            TreeKind::View { .. } => self.visit_view(tree, id),
            TreeKind::NestedView { .. } => self.visit_nested_view(tree, id),
            TreeKind::RefSet { .. } => self.visit_ref_set(tree, id),
        }
    }

    fn visit_children(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        for &c in tree.children(id) {
            self.visit(tree, c);
        }
    }

    // Scopes

    fn visit_root(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_general_block(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_for(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_while(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_do_while(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_if(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_elif(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_else(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_state_if(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_map(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_consume(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }
    fn visit_pipeline(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.visit_children(tree, id)
    }

    // Leaves

    fn visit_label(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_goto(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_assign(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_break(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_continue(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_tasklet(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_library(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_copy(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_dyn_scope_copy(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_view(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_nested_view(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
    fn visit_ref_set(&mut self, _tree: &ScheduleTree, _id: TreeNodeId) {}
}

// ── Rewriting transformer ───────────────────────────────────────────────────

/// What the enclosing scope does with a transformed child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
    Replace(TreeNodeId),
    Splice(Vec<TreeNodeId>),
}

pub trait Transformer {
    fn transform(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        let Some(kind) = tree.kind(id) else {
            return Visit::Keep;
        };
        match kind {
            TreeKind::Root => {
                self.transform_children(tree, id);
                Visit::Keep
            }
            TreeKind::GeneralBlock => self.transform_general_block(tree, id),
            TreeKind::For { .. } => self.transform_for(tree, id),
            TreeKind::While { .. } => self.transform_while(tree, id),
            TreeKind::DoWhile { .. } => self.transform_do_while(tree, id),
            TreeKind::If { .. } => self.transform_if(tree, id),
            TreeKind::Elif { .. } => self.transform_elif(tree, id),
            TreeKind::Else => self.transform_else(tree, id),
            TreeKind::StateIf { .. } => self.transform_state_if(tree, id),
            TreeKind::Map { .. } => self.transform_map(tree, id),
            TreeKind::Consume { .. } => self.transform_consume(tree, id),
            TreeKind::Pipeline { .. } => self.transform_pipeline(tree, id),
            TreeKind::Label { .. } => self.transform_label(tree, id),
            TreeKind::Goto { .. } => self.transform_goto(tree, id),
            TreeKind::Assign { .. } => self.transform_assign(tree, id),
            TreeKind::Break => self.transform_break(tree, id),
            TreeKind::Continue => self.transform_continue(tree, id),
            TreeKind::Tasklet { .. } => self.transform_tasklet(tree, id),
            TreeKind::Library { .. } => self.transform_library(tree, id),
            TreeKind::Copy { .. } => self.transform_copy(tree, id),
            TreeKind::DynScopeCopy { .. } => self.transform_dyn_scope_copy(tree, id),
            TreeKind::View { .. } => self.transform_view(tree, id),
            TreeKind::NestedView { .. } => self.transform_nested_view(tree, id),
            TreeKind::RefSet { .. } => self.transform_ref_set(tree, id),
        }
    }

    /// Transform every child of `scope` and rebuild its child list.
    fn transform_children(&mut self, tree: &mut ScheduleTree, scope: TreeNodeId) {
        let before = tree.children(scope).to_vec();
        let mut after = Vec::with_capacity(before.len());
        for c in before.iter().copied() {
            match self.transform(tree, c) {
                Visit::Keep => after.push(c),
                Visit::Remove => {}
                Visit::Replace(n) => after.push(n),
                Visit::Splice(ns) => after.extend(ns),
            }
        }
        for c in before {
            if !after.contains(&c) && tree.parent(c) == Some(scope) {
                if let Some(n) = tree.node_mut(c) {
                    n.parent = None;
                }
            }
        }
        tree.set_children(scope, after);
    }

    /// Default for every scope kind.
    fn transform_scope(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_children(tree, id);
        Visit::Keep
    }

    // Scopes

    fn transform_general_block(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }
    fn transform_for(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }
    fn transform_while(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }
    fn transform_do_while(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }
    fn transform_if(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }
    fn transform_elif(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }
    fn transform_else(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }
    fn transform_state_if(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }
    fn transform_map(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }
    fn transform_consume(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }
    fn transform_pipeline(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_scope(tree, id)
    }

    // Leaves

    fn transform_label(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_goto(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_assign(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_break(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_continue(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_tasklet(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_library(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_copy(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_dyn_scope_copy(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_view(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_nested_view(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
    fn transform_ref_set(&mut self, _tree: &mut ScheduleTree, _id: TreeNodeId) -> Visit {
        Visit::Keep
    }
}

/// Run a transformer over the whole tree.
pub fn transform_tree<T: Transformer + ?Sized>(transformer: &mut T, tree: &mut ScheduleTree) {
    let root = tree.root();
    transformer.transform_children(tree, root);
}

// ── Stock passes ────────────────────────────────────────────────────────────

/// Drops dataflow scopes left without a body. Control-flow scopes stay,
/// since their headers still update symbols.
#[derive(Debug, Default)]
pub struct ElideEmptyScopes {
    pub removed: usize,
}

impl ElideEmptyScopes {
    fn elide(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.transform_children(tree, id);
        if tree.children(id).is_empty() {
            self.removed += 1;
            Visit::Remove
        } else {
            Visit::Keep
        }
    }
}

impl Transformer for ElideEmptyScopes {
    fn transform_map(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.elide(tree, id)
    }
    fn transform_consume(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.elide(tree, id)
    }
    fn transform_pipeline(&mut self, tree: &mut ScheduleTree, id: TreeNodeId) -> Visit {
        self.elide(tree, id)
    }
}

/// Counts nodes per variant name.
#[derive(Debug, Default)]
pub struct KindCounter {
    pub counts: indexmap::IndexMap<&'static str, usize>,
}

impl KindCounter {
    fn bump(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(k) = tree.kind(id) {
            *self.counts.entry(k.name()).or_default() += 1;
        }
    }
}

impl Visitor for KindCounter {
    fn visit(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.bump(tree, id);
        self.visit_children(tree, id);
    }
}
