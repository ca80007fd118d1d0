// schedule.rs — Schedule Tree: the ordered lowering target of a program
//
// A schedule tree linearizes the states and dataflow of a program into a
// hierarchy of scopes (control flow and dataflow iteration) and leaves (one
// atomic action each). Nodes live in an append-only arena addressed by
// `TreeNodeId`; parent links are non-owning back-references that the
// rewriting transformer keeps up to date.
//
// Preconditions: the container table names every container a leaf touches.
// Postconditions: `place_declarations` declares every transient container at
//                 the lowest common scope of its users, or inline at its only
//                 user.
// Failure modes: `verify_tree` reports broken parent links or misplaced
//                declarations through `TreeCert`.
// Side effects: none.

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;

use crate::data::{DType, Data, DataKind};
use crate::id::TreeNodeId;
use crate::memlet::Memlet;
use crate::subset::Range;
use crate::symbolic::Expr;

// ── Public types ────────────────────────────────────────────────────────────

/// Node variants. Everything up to `Pipeline` is a scope; the rest are leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeKind {
    Root,
    /// Irreducible control flow; children are addressed by `Label`/`Goto`.
    GeneralBlock,
    For {
        var: String,
        init: String,
        condition: String,
        update: String,
    },
    While {
        condition: String,
    },
    DoWhile {
        condition: String,
    },
    If {
        condition: String,
    },
    Elif {
        condition: String,
    },
    Else,
    /// Branch between states rather than a source-level conditional.
    StateIf {
        condition: String,
    },
    Map {
        params: Vec<String>,
        range: Range,
    },
    Consume {
        pe_index: String,
        num_pes: Expr,
        condition: Option<String>,
        stream: String,
    },
    Pipeline {
        params: Vec<String>,
        range: Range,
    },

    Label {
        name: String,
    },
    /// `None` jumps to program exit.
    Goto {
        target: Option<String>,
    },
    Assign {
        name: String,
        value: String,
    },
    Break,
    Continue,
    Tasklet {
        code: String,
        inputs: IndexMap<String, Memlet>,
        outputs: IndexMap<String, Memlet>,
    },
    Library {
        op: String,
        properties: IndexMap<String, String>,
        inputs: IndexMap<String, Memlet>,
        outputs: IndexMap<String, Memlet>,
    },
    /// `memlet.data[memlet.subset]` is copied into `target`; the written
    /// subset of `target` is `memlet.other_subset` when present.
    Copy {
        target: String,
        memlet: Memlet,
    },
    DynScopeCopy {
        target: String,
        memlet: Memlet,
    },
    View {
        target: String,
        memlet: Memlet,
        shape: Vec<Expr>,
    },
    /// A view across a nested-program boundary.
    NestedView {
        target: String,
        memlet: Memlet,
        shape: Vec<Expr>,
    },
    RefSet {
        target: String,
        memlet: Memlet,
    },
}

impl TreeKind {
    pub fn is_scope(&self) -> bool {
        matches!(
            self,
            TreeKind::Root
                | TreeKind::GeneralBlock
                | TreeKind::For { .. }
                | TreeKind::While { .. }
                | TreeKind::DoWhile { .. }
                | TreeKind::If { .. }
                | TreeKind::Elif { .. }
                | TreeKind::Else
                | TreeKind::StateIf { .. }
                | TreeKind::Map { .. }
                | TreeKind::Consume { .. }
                | TreeKind::Pipeline { .. }
        )
    }

    pub fn is_leaf(&self) -> bool {
        !self.is_scope()
    }

    /// Short variant name, used in logs and DOT output.
    pub fn name(&self) -> &'static str {
        match self {
            TreeKind::Root => "Root",
            TreeKind::GeneralBlock => "GeneralBlock",
            TreeKind::For { .. } => "ForScope",
            TreeKind::While { .. } => "WhileScope",
            TreeKind::DoWhile { .. } => "DoWhileScope",
            TreeKind::If { .. } => "IfScope",
            TreeKind::Elif { .. } => "ElifScope",
            TreeKind::Else => "ElseScope",
            TreeKind::StateIf { .. } => "StateIfScope",
            TreeKind::Map { .. } => "MapScope",
            TreeKind::Consume { .. } => "ConsumeScope",
            TreeKind::Pipeline { .. } => "PipelineScope",
            TreeKind::Label { .. } => "Label",
            TreeKind::Goto { .. } => "Goto",
            TreeKind::Assign { .. } => "Assign",
            TreeKind::Break => "Break",
            TreeKind::Continue => "Continue",
            TreeKind::Tasklet { .. } => "Tasklet",
            TreeKind::Library { .. } => "LibraryCall",
            TreeKind::Copy { .. } => "Copy",
            TreeKind::DynScopeCopy { .. } => "DynScopeCopy",
            TreeKind::View { .. } => "View",
            TreeKind::NestedView { .. } => "NestedView",
            TreeKind::RefSet { .. } => "RefSet",
        }
    }

    /// Containers this node touches itself, excluding its children.
    pub fn data_used(&self) -> Vec<&str> {
        match self {
            TreeKind::Consume { stream, .. } => vec![stream.as_str()],
            TreeKind::Tasklet { inputs, outputs, .. }
            | TreeKind::Library { inputs, outputs, .. } => inputs
                .values()
                .chain(outputs.values())
                .filter_map(|m| m.data_name())
                .collect(),
            TreeKind::Copy { target, memlet }
            | TreeKind::DynScopeCopy { target, memlet }
            | TreeKind::View { target, memlet, .. }
            | TreeKind::NestedView { target, memlet, .. }
            | TreeKind::RefSet { target, memlet } => {
                let mut out = vec![target.as_str()];
                out.extend(memlet.data_name());
                out
            }
            _ => Vec::new(),
        }
    }

    /// Container defined by this leaf instead of by a declaration.
    pub fn defines(&self) -> Option<&str> {
        match self {
            TreeKind::View { target, .. }
            | TreeKind::NestedView { target, .. }
            | TreeKind::RefSet { target, .. } => Some(target),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub id: TreeNodeId,
    pub parent: Option<TreeNodeId>,
    pub kind: TreeKind,
    pub children: Vec<TreeNodeId>,
    /// Containers declared at this node (scope-local, or inline at a leaf).
    pub declared: IndexMap<String, Data>,
}

/// The tree plus the program-level tables it refers to.
#[derive(Debug, Clone)]
pub struct ScheduleTree {
    pub name: String,
    pub symbols: IndexMap<String, DType>,
    /// Every container, non-transient ones first in interface order.
    pub containers: IndexMap<String, Data>,
    nodes: Vec<TreeNode>,
    root: TreeNodeId,
}

impl ScheduleTree {
    pub fn new(name: impl Into<String>) -> Self {
        let root = TreeNodeId(0);
        ScheduleTree {
            name: name.into(),
            symbols: IndexMap::new(),
            containers: IndexMap::new(),
            nodes: vec![TreeNode {
                id: root,
                parent: None,
                kind: TreeKind::Root,
                children: Vec::new(),
                declared: IndexMap::new(),
            }],
            root,
        }
    }

    pub fn root(&self) -> TreeNodeId {
        self.root
    }

    pub fn node(&self, id: TreeNodeId) -> Option<&TreeNode> {
        self.nodes.get(id.index())
    }

    pub fn node_mut(&mut self, id: TreeNodeId) -> Option<&mut TreeNode> {
        self.nodes.get_mut(id.index())
    }

    pub fn kind(&self, id: TreeNodeId) -> Option<&TreeKind> {
        self.node(id).map(|n| &n.kind)
    }

    pub fn children(&self, id: TreeNodeId) -> &[TreeNodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: TreeNodeId) -> Option<TreeNodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    /// Allocate a detached node.
    pub fn alloc(&mut self, kind: TreeKind) -> TreeNodeId {
        let id = TreeNodeId(self.nodes.len() as u32);
        self.nodes.push(TreeNode {
            id,
            parent: None,
            kind,
            children: Vec::new(),
            declared: IndexMap::new(),
        });
        id
    }

    /// Allocate a node and append it to the children of `parent`.
    pub fn add(&mut self, parent: TreeNodeId, kind: TreeKind) -> TreeNodeId {
        let id = self.alloc(kind);
        if let Some(n) = self.node_mut(id) {
            n.parent = Some(parent);
        }
        if let Some(p) = self.node_mut(parent) {
            p.children.push(id);
        }
        id
    }

    /// Replace the child list of `scope`; every listed child is re-parented.
    pub fn set_children(&mut self, scope: TreeNodeId, children: Vec<TreeNodeId>) {
        for &c in &children {
            if let Some(n) = self.node_mut(c) {
                n.parent = Some(scope);
            }
        }
        if let Some(s) = self.node_mut(scope) {
            s.children = children;
        }
    }

    /// Reachable nodes in pre-order, root first.
    pub fn preorder(&self) -> Vec<TreeNodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            out.push(id);
            for &c in self.children(id).iter().rev() {
                stack.push(c);
            }
        }
        out
    }

    /// Reachable leaves in program order.
    pub fn leaves(&self) -> Vec<TreeNodeId> {
        self.preorder()
            .into_iter()
            .filter(|&id| self.kind(id).is_some_and(TreeKind::is_leaf))
            .collect()
    }

    /// Whether any node of the tree touches `name`.
    pub fn is_data_used(&self, name: &str) -> bool {
        self.subtree_uses(self.root, name)
    }

    /// Whether `id` or any of its descendants touches `name`.
    pub fn subtree_uses(&self, id: TreeNodeId, name: &str) -> bool {
        let Some(node) = self.node(id) else {
            return false;
        };
        node.kind.data_used().contains(&name)
            || node.children.iter().any(|&c| self.subtree_uses(c, name))
    }

    /// Nodes that touch `name` themselves, in pre-order.
    pub fn users(&self, name: &str) -> Vec<TreeNodeId> {
        self.preorder()
            .into_iter()
            .filter(|&id| self.kind(id).is_some_and(|k| k.data_used().contains(&name)))
            .collect()
    }

    /// `id` followed by its ancestors up to the root.
    pub fn ancestors(&self, id: TreeNodeId) -> Vec<TreeNodeId> {
        let mut chain = vec![id];
        let mut cur = self.parent(id);
        while let Some(p) = cur {
            chain.push(p);
            cur = self.parent(p);
        }
        chain
    }

    /// Deepest scope enclosing every node of `nodes`. A scope in `nodes`
    /// counts as enclosing itself; a lone leaf yields its parent.
    pub fn lca_scope(&self, nodes: &[TreeNodeId]) -> Option<TreeNodeId> {
        let (first, rest) = nodes.split_first()?;
        let mut common: Vec<TreeNodeId> = self.ancestors(*first);
        for &n in rest {
            let chain: HashSet<TreeNodeId> = self.ancestors(n).into_iter().collect();
            common.retain(|a| chain.contains(a));
        }
        common
            .into_iter()
            .find(|&a| self.kind(a).is_some_and(TreeKind::is_scope))
    }

    pub fn depth(&self, id: TreeNodeId) -> usize {
        self.ancestors(id).len() - 1
    }

    /// Non-transient containers: the program's external interface.
    pub fn args(&self) -> Vec<&str> {
        self.containers
            .iter()
            .filter(|(_, d)| !d.transient)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Node holding the declaration of `name`, if any.
    pub fn declaration_site(&self, name: &str) -> Option<TreeNodeId> {
        self.preorder()
            .into_iter()
            .find(|&id| self.node(id).is_some_and(|n| n.declared.contains_key(name)))
    }

    /// Render the subtree at `id` with its own line at indent 0.
    pub fn render(&self, id: TreeNodeId) -> String {
        let mut out = String::new();
        if id == self.root {
            for &c in self.children(id) {
                self.render_into(c, 0, &mut out);
            }
        } else {
            self.render_into(id, 0, &mut out);
        }
        out
    }

    fn render_into(&self, id: TreeNodeId, indent: usize, out: &mut String) {
        let Some(node) = self.node(id) else { return };
        let pad = "  ".repeat(indent);
        if node.kind == TreeKind::Root {
            for &c in &node.children {
                self.render_into(c, indent, out);
            }
            return;
        }
        out.push_str(&pad);
        out.push_str(&header(&node.kind));
        out.push('\n');
        if node.kind.is_scope() {
            for &c in &node.children {
                self.render_into(c, indent + 1, out);
            }
            if let TreeKind::DoWhile { condition } = &node.kind {
                out.push_str(&pad);
                out.push_str(&format!("while {condition}\n"));
            }
        }
    }
}

// ── Declaration placement ───────────────────────────────────────────────────

/// Whether `name` needs a declaration in the tree. Views and references are
/// defined by the leaf that binds them; non-transients are arguments.
pub fn needs_declaration(desc: &Data) -> bool {
    desc.transient && !matches!(desc.kind, DataKind::View | DataKind::Reference)
}

/// Recompute every declaration set of the tree.
pub fn place_declarations(tree: &mut ScheduleTree) {
    for id in tree.preorder() {
        if let Some(n) = tree.node_mut(id) {
            n.declared.clear();
        }
    }
    let names: Vec<(String, Data)> = tree
        .containers
        .iter()
        .filter(|(_, d)| needs_declaration(d))
        .map(|(n, d)| (n.clone(), d.clone()))
        .collect();
    let root = tree.root();
    for (name, desc) in names {
        if let Some(site) = declaration_target(tree, root, &name) {
            if let Some(n) = tree.node_mut(site) {
                n.declared.insert(name, desc);
            }
        }
    }
}

/// Where `name` belongs below `scope`: at `scope` when two or more children
/// use it (or the scope header does), inside the single using child
/// otherwise, and nowhere when unused.
fn declaration_target(tree: &ScheduleTree, scope: TreeNodeId, name: &str) -> Option<TreeNodeId> {
    let node = tree.node(scope)?;
    if node.kind.is_leaf() {
        return node.kind.data_used().contains(&name).then_some(scope);
    }
    let direct = node.kind.data_used().contains(&name);
    let users: Vec<TreeNodeId> = node
        .children
        .iter()
        .copied()
        .filter(|&c| tree.subtree_uses(c, name))
        .collect();
    match users.as_slice() {
        [] if direct => Some(scope),
        [] => None,
        [only] if !direct => declaration_target(tree, *only, name),
        _ => Some(scope),
    }
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for tree postconditions (T1-T3).
#[derive(Debug, Clone)]
pub struct TreeCert {
    /// T1: every reachable child points back at the scope listing it.
    pub t1_parent_links: bool,
    /// T2: every declaration sits at the lowest common scope of its users,
    /// or inline at its single user.
    pub t2_declaration_placement: bool,
    /// T3: no container is declared twice on any root-to-leaf path.
    pub t3_single_declaration: bool,
}

impl crate::pass::StageCert for TreeCert {
    fn all_pass(&self) -> bool {
        self.t1_parent_links && self.t2_declaration_placement && self.t3_single_declaration
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("T1_parent_links", self.t1_parent_links),
            ("T2_declaration_placement", self.t2_declaration_placement),
            ("T3_single_declaration", self.t3_single_declaration),
        ]
    }
}

pub fn verify_tree(tree: &ScheduleTree) -> TreeCert {
    TreeCert {
        t1_parent_links: verify_t1_parent_links(tree),
        t2_declaration_placement: verify_t2_declaration_placement(tree),
        t3_single_declaration: verify_t3_single_declaration(tree),
    }
}

/// T1: each node is reachable once, the root has no parent, leaves have no
/// children, and every child's parent is the scope that lists it.
fn verify_t1_parent_links(tree: &ScheduleTree) -> bool {
    if tree.parent(tree.root()).is_some() {
        return false;
    }
    let mut seen = HashSet::new();
    let mut stack = vec![tree.root()];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            return false;
        }
        let Some(node) = tree.node(id) else {
            return false;
        };
        if node.kind.is_leaf() && !node.children.is_empty() {
            return false;
        }
        for &c in &node.children {
            if tree.parent(c) != Some(id) {
                return false;
            }
            stack.push(c);
        }
    }
    true
}

/// T2: checked against the users of each declared container.
fn verify_t2_declaration_placement(tree: &ScheduleTree) -> bool {
    for id in tree.preorder() {
        let Some(node) = tree.node(id) else {
            return false;
        };
        for name in node.declared.keys() {
            let users = tree.users(name);
            let ok = if node.kind.is_leaf() {
                users == [id]
            } else {
                let within_one_child = node
                    .children
                    .iter()
                    .filter(|&&c| tree.subtree_uses(c, name))
                    .count()
                    <= 1
                    && !node.kind.data_used().contains(&name.as_str());
                !within_one_child && tree.lca_scope(&users) == Some(id)
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

/// T3: walk every path, tracking containers declared above.
fn verify_t3_single_declaration(tree: &ScheduleTree) -> bool {
    fn walk(tree: &ScheduleTree, id: TreeNodeId, above: &mut Vec<String>) -> bool {
        let Some(node) = tree.node(id) else {
            return false;
        };
        let mut pushed = 0;
        for name in node.declared.keys() {
            if above.contains(name) {
                return false;
            }
            above.push(name.clone());
            pushed += 1;
        }
        let ok = node.children.iter().all(|&c| walk(tree, c, above));
        above.truncate(above.len() - pushed);
        ok
    }
    walk(tree, tree.root(), &mut Vec::new())
}

// ── Display ─────────────────────────────────────────────────────────────────

fn join_memlets(memlets: &IndexMap<String, Memlet>) -> String {
    memlets
        .values()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_exprs(exprs: &[Expr]) -> String {
    exprs
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Left-hand side of a copy: the target, its written subset when offset,
/// and the conflict multiplicity when a reducer is present.
fn copy_target(target: &str, memlet: &Memlet) -> String {
    if let Some(op) = &memlet.wcr {
        let written = memlet.other_subset.as_ref().or(memlet.subset.as_ref());
        return match written {
            Some(w) => format!("{target}({}, {op})[{w}]", w.num_elements()),
            None => format!("{target}(1, {op})"),
        };
    }
    match &memlet.other_subset {
        Some(other) if other.min_element().iter().any(|e| !e.is_zero()) => {
            format!("{target}[{other}]")
        }
        _ => target.to_string(),
    }
}

fn source_text(memlet: &Memlet) -> String {
    let data = memlet.data_name().unwrap_or("");
    match &memlet.subset {
        Some(s) => format!("{data}[{s}]"),
        None => data.to_string(),
    }
}

/// Canonical one-line form of a node (the header line for scopes).
pub fn header(kind: &TreeKind) -> String {
    match kind {
        TreeKind::Root => String::new(),
        TreeKind::GeneralBlock => "gblock:".to_string(),
        TreeKind::For {
            var,
            init,
            condition,
            update,
        } => format!("for {var} = {init}; {condition}; {var} = {update}:"),
        TreeKind::While { condition } => format!("while {condition}:"),
        TreeKind::DoWhile { .. } => "do:".to_string(),
        TreeKind::If { condition } => format!("if {condition}:"),
        TreeKind::Elif { condition } => format!("elif {condition}:"),
        TreeKind::Else => "else:".to_string(),
        TreeKind::StateIf { condition } => format!("stateif {condition}:"),
        TreeKind::Map { params, range } => format!("map {} in [{range}]:", params.join(", ")),
        TreeKind::Consume {
            pe_index,
            num_pes,
            condition,
            stream,
        } => {
            let until = match condition {
                Some(c) => c.clone(),
                None => format!("{stream} not empty"),
            };
            format!("consume (PE {pe_index} out of {num_pes}) while {until}:")
        }
        TreeKind::Pipeline { params, range } => {
            format!("pipeline {} in [{range}]:", params.join(", "))
        }
        TreeKind::Label { name } => format!("label {name}:"),
        TreeKind::Goto { target } => match target {
            Some(t) => format!("goto {t}"),
            None => "goto exit".to_string(),
        },
        TreeKind::Assign { name, value } => format!("assign {name} = {value}"),
        TreeKind::Break => "break".to_string(),
        TreeKind::Continue => "continue".to_string(),
        TreeKind::Tasklet {
            inputs, outputs, ..
        } => {
            let call = format!("tasklet({})", join_memlets(inputs));
            if outputs.is_empty() {
                call
            } else {
                format!("{} = {call}", join_memlets(outputs))
            }
        }
        TreeKind::Library {
            op,
            properties,
            inputs,
            outputs,
        } => {
            let props = if properties.is_empty() {
                String::new()
            } else {
                let kv: Vec<String> = properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
                format!("[{}]", kv.join(", "))
            };
            let call = format!("library {op}{props}({})", join_memlets(inputs));
            if outputs.is_empty() {
                call
            } else {
                format!("{} = {call}", join_memlets(outputs))
            }
        }
        TreeKind::Copy { target, memlet } => {
            format!("{} = copy {}", copy_target(target, memlet), source_text(memlet))
        }
        TreeKind::DynScopeCopy { target, memlet } => {
            format!("{target} = dscopy {}", source_text(memlet))
        }
        TreeKind::View {
            target,
            memlet,
            shape,
        } => format!("{target} = view {memlet} as [{}]", join_exprs(shape)),
        TreeKind::NestedView {
            target,
            memlet,
            shape,
        } => format!("{target} = nview {memlet} as [{}]", join_exprs(shape)),
        TreeKind::RefSet { target, memlet } => format!("{target} = refset to {memlet}"),
    }
}

impl fmt::Display for ScheduleTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(self.root))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DType;
    use crate::pass::StageCert;

    fn m(data: &str, subset: &str) -> Memlet {
        Memlet::simple(data, subset).unwrap()
    }

    fn tasklet(ins: &[(&str, Memlet)], outs: &[(&str, Memlet)]) -> TreeKind {
        TreeKind::Tasklet {
            code: "b = a".into(),
            inputs: ins.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            outputs: outs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    fn map_scope(n: &str) -> TreeKind {
        TreeKind::Map {
            params: vec!["i".into()],
            range: Range::parse(n).unwrap(),
        }
    }

    fn with_transient(tree: &mut ScheduleTree, name: &str) {
        tree.containers.insert(
            name.into(),
            Data::array(DType::Float64, vec![Expr::int(10)]).transient(),
        );
    }

    #[test]
    fn copy_with_reducer_reports_written_element_count() {
        for n in [1_i64, 5, 100] {
            let subset = format!("0:{n}");
            let copy = TreeKind::Copy {
                target: "B".into(),
                memlet: m("A", &subset)
                    .with_other_subset(Range::parse(&subset).unwrap())
                    .with_wcr("sum"),
            };
            let dst = if n == 1 { "0".to_string() } else { subset.clone() };
            assert_eq!(
                header(&copy),
                format!("B({n}, sum)[{dst}] = copy A[{dst}]")
            );
        }
    }

    #[test]
    fn copy_offset_printed_only_when_nonzero() {
        let plain = TreeKind::Copy {
            target: "B".into(),
            memlet: m("A", "0:5").with_other_subset(Range::parse("0:5").unwrap()),
        };
        assert_eq!(header(&plain), "B = copy A[0:5]");
        let shifted = TreeKind::Copy {
            target: "B".into(),
            memlet: m("A", "0:5").with_other_subset(Range::parse("2:7").unwrap()),
        };
        assert_eq!(header(&shifted), "B[2:7] = copy A[0:5]");
    }

    #[test]
    fn tasklet_output_memlet_shows_multiplicity() {
        let t = tasklet(&[("a", m("A", "i"))], &[("b", m("B", "0:10").with_wcr("sum"))]);
        assert_eq!(header(&t), "B(10, sum)[0:10] = tasklet(A[i])");
    }

    #[test]
    fn render_nests_with_two_space_indent() {
        let mut tree = ScheduleTree::new("p");
        let root = tree.root();
        let f = tree.add(
            root,
            TreeKind::For {
                var: "k".into(),
                init: "0".into(),
                condition: "k < 4".into(),
                update: "k + 1".into(),
            },
        );
        let map = tree.add(f, map_scope("0:10"));
        tree.add(map, tasklet(&[("a", m("A", "i"))], &[("b", m("B", "i"))]));
        let dw = tree.add(root, TreeKind::DoWhile { condition: "x > 0".into() });
        tree.add(dw, TreeKind::Assign { name: "x".into(), value: "x - 1".into() });
        tree.add(root, TreeKind::Goto { target: None });
        let expected = "\
for k = 0; k < 4; k = k + 1:
  map i in [0:10]:
    B[i] = tasklet(A[i])
do:
  assign x = x - 1
while x > 0
goto exit
";
        assert_eq!(tree.to_string(), expected);
    }

    #[test]
    fn consume_header_defaults_to_stream_not_empty() {
        let c = TreeKind::Consume {
            pe_index: "p".into(),
            num_pes: Expr::int(4),
            condition: None,
            stream: "S".into(),
        };
        assert_eq!(header(&c), "consume (PE p out of 4) while S not empty:");
    }

    #[test]
    fn single_user_declared_inline() {
        let mut tree = ScheduleTree::new("p");
        with_transient(&mut tree, "T");
        let root = tree.root();
        let map = tree.add(root, map_scope("0:10"));
        let t = tree.add(map, tasklet(&[("a", m("A", "i"))], &[("t", m("T", "i"))]));
        tree.add(map, tasklet(&[("a", m("A", "i"))], &[("b", m("B", "i"))]));
        place_declarations(&mut tree);
        assert_eq!(tree.declaration_site("T"), Some(t));
        assert!(tree.node(map).unwrap().declared.is_empty());
        assert!(verify_tree(&tree).all_pass());
    }

    #[test]
    fn shared_container_declared_at_lowest_common_scope() {
        let mut tree = ScheduleTree::new("p");
        with_transient(&mut tree, "T");
        let root = tree.root();
        let outer = tree.add(root, map_scope("0:10"));
        let inner = tree.add(outer, map_scope("0:10"));
        let w = tree.add(inner, tasklet(&[], &[("t", m("T", "i"))]));
        let r = tree.add(inner, tasklet(&[("t", m("T", "i"))], &[("b", m("B", "i"))]));
        place_declarations(&mut tree);
        assert_eq!(tree.declaration_site("T"), Some(inner));
        assert_eq!(tree.lca_scope(&[w, r]), Some(inner));
        assert_eq!(tree.lca_scope(&[w]), Some(inner));
        assert!(verify_tree(&tree).all_pass());
    }

    #[test]
    fn unused_and_interface_containers_are_not_declared() {
        let mut tree = ScheduleTree::new("p");
        with_transient(&mut tree, "U");
        tree.containers
            .insert("A".into(), Data::array(DType::Float64, vec![Expr::int(10)]));
        let root = tree.root();
        tree.add(root, tasklet(&[("a", m("A", "0"))], &[]));
        place_declarations(&mut tree);
        assert_eq!(tree.declaration_site("U"), None);
        assert_eq!(tree.declaration_site("A"), None);
        assert_eq!(tree.args(), vec!["A"]);
        assert!(!tree.is_data_used("U"));
        assert!(tree.is_data_used("A"));
    }

    #[test]
    fn broken_parent_link_fails_t1() {
        let mut tree = ScheduleTree::new("p");
        let root = tree.root();
        let map = tree.add(root, map_scope("0:10"));
        let leaf = tree.add(map, TreeKind::Break);
        tree.node_mut(leaf).unwrap().parent = Some(root);
        let cert = verify_tree(&tree);
        assert!(!cert.t1_parent_links);
        assert!(!cert.all_pass());
    }

    #[test]
    fn hoisted_declaration_fails_t2_and_duplicate_fails_t3() {
        let mut tree = ScheduleTree::new("p");
        with_transient(&mut tree, "T");
        let root = tree.root();
        let map = tree.add(root, map_scope("0:10"));
        let leaf = tree.add(map, tasklet(&[], &[("t", m("T", "i"))]));
        let desc = tree.containers["T"].clone();
        tree.node_mut(map).unwrap().declared.insert("T".into(), desc.clone());
        let cert = verify_tree(&tree);
        assert!(!cert.t2_declaration_placement);
        assert!(cert.t3_single_declaration);

        tree.node_mut(leaf).unwrap().declared.insert("T".into(), desc);
        assert!(!verify_tree(&tree).t3_single_declaration);
    }
}
