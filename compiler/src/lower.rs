// lower.rs — Lowering of a dataflow program into a schedule tree
//
// Walks the recovered control-flow structure of a program and, for each
// state, the dataflow nodes in topological order. Scope entries open
// Map/Pipeline/Consume scopes, code nodes become Tasklet/LibraryCall leaves,
// access-to-access edges become Copy leaves (or View/RefSet bindings), and
// data-dependent scope inputs become DynScopeCopy leaves. Nested programs
// are inlined under a pushed symbol frame, with a NestedView leaf per
// connector. Unstructured control flow becomes a GeneralBlock of labels,
// state branches and gotos.
//
// Preconditions: the program passed validation; memlets are propagated.
// Postconditions: every transient container used by the tree is declared
//                 exactly once (see `schedule::place_declarations`).
// Failure modes: none; unstructured control flow and unknown mapping
//                symbols produce warnings.
// Side effects: none.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::control_flow::{self, ControlFlow};
use crate::data::{DType, DataKind};
use crate::diag::{codes, Diagnostic, DiagLevel, Location};
use crate::graph::{MapKind, Node, NodeKind, Program, ScopeInfo, State};
use crate::id::{NameAllocator, NodeId, StateId, TreeNodeId};
use crate::lexer::sanitize_identifier;
use crate::memlet::Memlet;
use crate::schedule::{needs_declaration, place_declarations, ScheduleTree, TreeKind};
use crate::scope_index::ScopeIndex;
use crate::subset::Range;
use crate::symbolic::Expr;
use crate::symbols::{Frame, FrameOrigin, SymbolScope};
use crate::visit::{transform_tree, ElideEmptyScopes};

// ── Output types ────────────────────────────────────────────────────────────

pub struct LowerResult {
    pub tree: ScheduleTree,
    pub diagnostics: Vec<Diagnostic>,
}

impl LowerResult {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.level == DiagLevel::Error)
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

pub fn lower_program(program: &Program) -> LowerResult {
    let mut tree = ScheduleTree::new(program.name.clone());
    tree.symbols = program.symbols.clone();
    for (name, desc) in program.arrays.iter().filter(|(_, d)| !d.transient) {
        tree.containers.insert(name.clone(), desc.clone());
    }
    for (name, desc) in program.arrays.iter().filter(|(_, d)| d.transient) {
        tree.containers.insert(name.clone(), desc.clone());
    }

    let mut lowerer = Lowerer {
        tree,
        diagnostics: Vec::new(),
        names: NameAllocator::new(),
        symbols: SymbolScope::new(),
    };
    let mut top = Frame::new(FrameOrigin::Program(program.name.clone()));
    for (name, dtype) in &program.symbols {
        top = top.bind(name, *dtype, None);
    }
    let version = lowerer.symbols.push(top);
    let root = lowerer.tree.root();
    lowerer.lower_body(program, &Renames::default(), root);
    if let Err(e) = lowerer.symbols.pop(version) {
        debug!(error = %e, "symbol frame mismatch after lowering");
    }

    let Lowerer {
        mut tree,
        mut diagnostics,
        ..
    } = lowerer;

    let mut elide = ElideEmptyScopes::default();
    transform_tree(&mut elide, &mut tree);
    place_declarations(&mut tree);

    for (name, desc) in &tree.containers {
        if needs_declaration(desc) && !tree.is_data_used(name) {
            diagnostics.push(
                Diagnostic::warning(
                    Location::Program,
                    format!("transient container '{name}' is never used"),
                )
                .with_code(codes::W0001),
            );
        }
    }

    debug!(
        program = %program.name,
        nodes = tree.preorder().len(),
        elided = elide.removed,
        "lowered to schedule tree"
    );
    LowerResult { tree, diagnostics }
}

// ── Naming ──────────────────────────────────────────────────────────────────

/// Container names of one (possibly nested) program, mapped to tree names.
#[derive(Debug, Clone, Default)]
struct Renames(HashMap<String, String>);

impl Renames {
    fn name(&self, n: &str) -> String {
        self.0.get(n).cloned().unwrap_or_else(|| n.to_string())
    }

    fn memlet(&self, m: &Memlet) -> Memlet {
        let mut out = m.clone();
        out.data = m.data.as_deref().map(|d| self.name(d));
        out
    }
}

// ── Lowerer ─────────────────────────────────────────────────────────────────

struct Lowerer {
    tree: ScheduleTree,
    diagnostics: Vec<Diagnostic>,
    names: NameAllocator,
    symbols: SymbolScope,
}

impl Lowerer {
    fn add(&mut self, parent: TreeNodeId, kind: TreeKind) -> TreeNodeId {
        self.tree.add(parent, kind)
    }

    /// Lower the whole control flow of `program` under `parent`.
    fn lower_body(&mut self, program: &Program, renames: &Renames, parent: TreeNodeId) {
        match control_flow::structure(program) {
            ControlFlow::General(states) => self.lower_general(program, &states, renames, parent),
            cf => self.lower_cf(program, &cf, renames, parent),
        }
    }

    fn lower_cf(
        &mut self,
        program: &Program,
        cf: &ControlFlow,
        renames: &Renames,
        parent: TreeNodeId,
    ) {
        match cf {
            ControlFlow::Block(s) => self.lower_state(program, *s, renames, parent),
            ControlFlow::Assign(assignments) => {
                for (name, value) in assignments {
                    self.add(
                        parent,
                        TreeKind::Assign {
                            name: name.clone(),
                            value: value.clone(),
                        },
                    );
                }
            }
            ControlFlow::Sequence(items) => {
                for item in items {
                    self.lower_cf(program, item, renames, parent);
                }
            }
            ControlFlow::If(branches) => {
                for (i, branch) in branches.iter().enumerate() {
                    let kind = match (&branch.condition, i) {
                        (Some(c), 0) => TreeKind::If { condition: c.clone() },
                        (Some(c), _) => TreeKind::Elif { condition: c.clone() },
                        (None, _) => TreeKind::Else,
                    };
                    let scope = self.add(parent, kind);
                    for item in &branch.body {
                        self.lower_cf(program, item, renames, scope);
                    }
                }
            }
            ControlFlow::For {
                var,
                init,
                condition,
                update,
                body,
            } => {
                let scope = self.add(
                    parent,
                    TreeKind::For {
                        var: var.clone(),
                        init: init.clone(),
                        condition: condition.clone(),
                        update: update.clone(),
                    },
                );
                for item in body {
                    self.lower_cf(program, item, renames, scope);
                }
            }
            ControlFlow::While { condition, body } => {
                let scope = self.add(parent, TreeKind::While { condition: condition.clone() });
                for item in body {
                    self.lower_cf(program, item, renames, scope);
                }
            }
            ControlFlow::DoWhile { condition, body } => {
                let scope = self.add(parent, TreeKind::DoWhile { condition: condition.clone() });
                for item in body {
                    self.lower_cf(program, item, renames, scope);
                }
            }
            ControlFlow::General(states) => self.lower_general(program, states, renames, parent),
        }
    }

    /// Labels, state contents and explicit transitions inside a GeneralBlock.
    fn lower_general(
        &mut self,
        program: &Program,
        states: &[StateId],
        renames: &Renames,
        parent: TreeNodeId,
    ) {
        warn!(program = %program.name, states = states.len(), "unstructured control flow lowered as general block");
        self.diagnostics.push(
            Diagnostic::warning(
                Location::Program,
                format!("control flow of '{}' is not structured; lowered as a general block", program.name),
            )
            .with_code(codes::W0002)
            .with_hint("labels and gotos preserve the original transitions"),
        );

        let mut labels: HashMap<StateId, String> = HashMap::new();
        let mut taken: HashSet<String> = HashSet::from(["exit".to_string()]);
        let mut label_names = NameAllocator::new();
        for &s in states {
            let base = program
                .state(s)
                .map(|st| sanitize_identifier(&st.label))
                .unwrap_or_else(|| format!("state_{}", s.0));
            let name = label_names.fresh(&base, |n| taken.contains(n));
            taken.insert(name.clone());
            labels.insert(s, name);
        }

        let block = self.add(parent, TreeKind::GeneralBlock);
        for &s in states {
            let label = labels.get(&s).cloned().unwrap_or_default();
            self.add(block, TreeKind::Label { name: label });
            self.lower_state(program, s, renames, block);

            let mut outs = program.out_transitions(s);
            if outs.is_empty() {
                self.add(block, TreeKind::Goto { target: None });
                continue;
            }
            outs.sort_by_key(|t| t.is_unconditional());
            for t in outs {
                let target = labels.get(&t.dst).cloned();
                let scope = if t.is_unconditional() {
                    block
                } else {
                    self.add(block, TreeKind::StateIf { condition: t.condition.clone() })
                };
                for (name, value) in &t.assignments {
                    self.add(
                        scope,
                        TreeKind::Assign {
                            name: name.clone(),
                            value: value.clone(),
                        },
                    );
                }
                self.add(scope, TreeKind::Goto { target });
            }
        }
    }

    fn lower_state(
        &mut self,
        program: &Program,
        sid: StateId,
        renames: &Renames,
        parent: TreeNodeId,
    ) {
        let Some(state) = program.state(sid) else { return };
        let index = ScopeIndex::build(state);
        let order = state.topological_order();
        let ctx = StateCtx {
            program,
            sid,
            state,
            index: &index,
            order: &order,
            renames,
        };
        self.lower_scope_body(&ctx, None, parent);
    }

    /// Lower every node whose innermost scope is `scope`.
    fn lower_scope_body(&mut self, ctx: &StateCtx<'_>, scope: Option<NodeId>, parent: TreeNodeId) {
        let members: Vec<&Node> = ctx
            .order
            .iter()
            .filter(|&&id| ctx.index.scope_of(id) == scope)
            .filter_map(|&id| ctx.state.node(id))
            .collect();

        // Views and references are bound before anything in the scope uses them.
        for node in &members {
            self.bind_alias(ctx, node, parent);
        }

        for node in members {
            match &node.kind {
                NodeKind::Access { data } => self.lower_access(ctx, node.id, data, parent),
                NodeKind::Tasklet { code, .. } => {
                    let (inputs, outputs) = ctx.bindings(node);
                    self.add(
                        parent,
                        TreeKind::Tasklet {
                            code: code.clone(),
                            inputs,
                            outputs,
                        },
                    );
                }
                NodeKind::Library { op, properties, .. } => {
                    let (inputs, outputs) = ctx.bindings(node);
                    self.add(
                        parent,
                        TreeKind::Library {
                            op: op.clone(),
                            properties: properties.clone(),
                            inputs,
                            outputs,
                        },
                    );
                }
                NodeKind::Entry { info, .. } => self.lower_scope(ctx, node.id, info, parent),
                NodeKind::Exit { .. } => {}
                NodeKind::Nested {
                    label,
                    program: inner,
                    symbol_mapping,
                } => self.inline_nested(ctx, node, label, inner, symbol_mapping, parent),
            }
        }
    }

    fn lower_scope(
        &mut self,
        ctx: &StateCtx<'_>,
        entry: NodeId,
        info: &ScopeInfo,
        parent: TreeNodeId,
    ) {
        for e in ctx.state.in_edges(entry) {
            let Some(conn) = e.dst_conn.as_deref() else { continue };
            if conn.starts_with("IN_") || e.memlet.is_empty() {
                continue;
            }
            self.tree.symbols.entry(conn.to_string()).or_insert(DType::Int64);
            self.add(
                parent,
                TreeKind::DynScopeCopy {
                    target: conn.to_string(),
                    memlet: ctx.renames.memlet(&e.memlet),
                },
            );
        }

        let kind = match info {
            ScopeInfo::Map(m) if m.kind == MapKind::Parallel => TreeKind::Map {
                params: m.params.clone(),
                range: m.range.clone(),
            },
            ScopeInfo::Map(m) => TreeKind::Pipeline {
                params: m.params.clone(),
                range: m.range.clone(),
            },
            ScopeInfo::Consume(c) => TreeKind::Consume {
                pe_index: c.pe_index.clone(),
                num_pes: c.num_pes.clone(),
                condition: c.condition.clone(),
                stream: ctx.renames.name(&c.stream),
            },
        };
        let scope = self.add(parent, kind);

        let mut frame = Frame::new(FrameOrigin::Scope(entry));
        for p in info.params() {
            frame = frame.bind(&p, DType::Int64, None);
        }
        let version = self.symbols.push(frame);
        self.lower_scope_body(ctx, Some(entry), scope);
        if let Err(e) = self.symbols.pop(version) {
            debug!(error = %e, "scope frame mismatch");
        }
    }

    /// Copies out of an access node into other access nodes.
    fn lower_access(&mut self, ctx: &StateCtx<'_>, id: NodeId, src: &str, parent: TreeNodeId) {
        if ctx.is_alias(src) {
            return;
        }
        for e in ctx.state.out_edges(id) {
            let Some(dst) = ctx.state.node(e.dst).and_then(Node::access_data) else {
                continue;
            };
            if ctx.is_alias(dst) || e.memlet.is_empty() {
                continue;
            }
            let (src_sub, dst_sub) = ctx.endpoint_subsets(&e.memlet, src, dst);
            let memlet = Memlet {
                data: Some(ctx.renames.name(src)),
                subset: Some(src_sub),
                other_subset: Some(dst_sub),
                wcr: e.memlet.wcr.clone(),
                dynamic: e.memlet.dynamic,
            };
            self.add(
                parent,
                TreeKind::Copy {
                    target: ctx.renames.name(dst),
                    memlet,
                },
            );
        }
    }

    /// A View leaf for a view access node, a RefSet leaf for a reference.
    fn bind_alias(&mut self, ctx: &StateCtx<'_>, node: &Node, parent: TreeNodeId) {
        let Some(alias) = node.access_data() else { return };
        let Some(desc) = ctx.program.arrays.get(alias) else { return };
        if !matches!(desc.kind, DataKind::View | DataKind::Reference) {
            return;
        }
        let neighbour = ctx
            .state
            .in_edges(node.id)
            .into_iter()
            .map(|e| (e, e.src))
            .chain(ctx.state.out_edges(node.id).into_iter().map(|e| (e, e.dst)))
            .find_map(|(e, other)| {
                let data = ctx.state.node(other)?.access_data()?;
                (!ctx.is_alias(data)).then_some((e, data))
            });
        let Some((edge, viewed)) = neighbour else { return };
        let subset = ctx.subset_of(&edge.memlet, viewed);
        let memlet = Memlet::new(ctx.renames.name(viewed), subset);
        let target = ctx.renames.name(alias);
        let kind = if desc.kind == DataKind::View {
            TreeKind::View {
                target,
                memlet,
                shape: desc.shape.clone(),
            }
        } else {
            TreeKind::RefSet { target, memlet }
        };
        self.add(parent, kind);
    }

    fn fresh_container(&mut self, base: &str) -> String {
        let tree = &self.tree;
        self.names.fresh(base, |n| {
            tree.containers.contains_key(n) || tree.symbols.contains_key(n)
        })
    }

    /// Inline a nested program: bind each connector through a NestedView,
    /// rebind mapped symbols, then lower the inner control flow in place.
    fn inline_nested(
        &mut self,
        ctx: &StateCtx<'_>,
        node: &Node,
        label: &str,
        inner: &Program,
        mapping: &IndexMap<String, Expr>,
        parent: TreeNodeId,
    ) {
        let mut inner_renames = Renames::default();
        let mut views = Vec::new();
        let mut conns: Vec<&String> = node.in_connectors.iter().collect();
        for c in &node.out_connectors {
            if !conns.contains(&c) {
                conns.push(c);
            }
        }
        for conn in conns {
            let edge = ctx
                .state
                .in_edges_by_connector(node.id, conn)
                .into_iter()
                .chain(ctx.state.out_edges_by_connector(node.id, conn))
                .find(|e| !e.memlet.is_empty());
            let (Some(edge), Some(desc)) = (edge, inner.arrays.get(conn.as_str())) else {
                continue;
            };
            let name = self.fresh_container(conn);
            inner_renames.0.insert(conn.clone(), name.clone());
            self.tree.containers.insert(
                name.clone(),
                desc.clone().transient().with_kind(DataKind::View),
            );
            views.push(TreeKind::NestedView {
                target: name,
                memlet: ctx.renames.memlet(&edge.memlet),
                shape: desc.shape.clone(),
            });
        }
        for (name, desc) in &inner.arrays {
            if inner_renames.0.contains_key(name) {
                continue;
            }
            let fresh = self.fresh_container(name);
            inner_renames.0.insert(name.clone(), fresh.clone());
            self.tree.containers.insert(fresh, desc.clone().transient());
        }

        let mut frame = Frame::new(FrameOrigin::Nested(label.to_string()));
        for (sym, value) in mapping {
            let dtype = inner.symbols.get(sym).copied().unwrap_or(DType::Int64);
            for free in value.free_symbols() {
                if !self.symbols.contains(&free) {
                    self.diagnostics.push(
                        Diagnostic::warning(
                            Location::node(ctx.sid, node.id),
                            format!("symbol mapping of '{label}' refers to unknown symbol '{free}'"),
                        )
                        .with_code(codes::W0004),
                    );
                }
            }
            frame = frame.bind(sym, dtype, Some(value.clone()));
        }
        for (sym, dtype) in &inner.symbols {
            if !mapping.contains_key(sym) {
                frame = frame.bind(sym, *dtype, None);
            }
        }
        let version = self.symbols.push(frame);

        for (sym, dtype) in &inner.symbols {
            self.tree.symbols.entry(sym.clone()).or_insert(*dtype);
        }
        for (sym, value) in mapping {
            if *value != Expr::sym(sym.clone()) {
                self.tree.symbols.entry(sym.clone()).or_insert(DType::Int64);
                self.add(
                    parent,
                    TreeKind::Assign {
                        name: sym.clone(),
                        value: value.to_string(),
                    },
                );
            }
        }
        for view in views {
            self.add(parent, view);
        }
        debug!(nested = %label, renamed = inner_renames.0.len(), "inlining nested program");
        self.lower_body(inner, &inner_renames, parent);

        if let Err(e) = self.symbols.pop(version) {
            debug!(error = %e, "nested frame mismatch");
        }
    }
}

// ── Per-state context ───────────────────────────────────────────────────────

struct StateCtx<'a> {
    program: &'a Program,
    sid: StateId,
    state: &'a State,
    index: &'a ScopeIndex,
    order: &'a [NodeId],
    renames: &'a Renames,
}

impl StateCtx<'_> {
    fn is_alias(&self, data: &str) -> bool {
        self.program
            .arrays
            .get(data)
            .is_some_and(|d| matches!(d.kind, DataKind::View | DataKind::Reference))
    }

    /// Connector bindings of a code node, in connector declaration order.
    fn bindings(&self, node: &Node) -> (IndexMap<String, Memlet>, IndexMap<String, Memlet>) {
        let mut inputs = IndexMap::new();
        for conn in &node.in_connectors {
            if let Some(e) = self
                .state
                .in_edges_by_connector(node.id, conn)
                .into_iter()
                .find(|e| !e.memlet.is_empty())
            {
                inputs.insert(conn.clone(), self.renames.memlet(&e.memlet));
            }
        }
        let mut outputs = IndexMap::new();
        for conn in &node.out_connectors {
            if let Some(e) = self
                .state
                .out_edges_by_connector(node.id, conn)
                .into_iter()
                .find(|e| !e.memlet.is_empty())
            {
                outputs.insert(conn.clone(), self.renames.memlet(&e.memlet));
            }
        }
        (inputs, outputs)
    }

    fn whole(&self, data: &str) -> Range {
        self.program
            .arrays
            .get(data)
            .map(|d| Range::from_shape(&d.shape))
            .unwrap_or_default()
    }

    /// Subset of `data` addressed by `memlet`, whichever side it names.
    fn subset_of(&self, memlet: &Memlet, data: &str) -> Range {
        let side = if memlet.refers_to(data) {
            memlet.subset.clone()
        } else {
            memlet.other_subset.clone().or_else(|| memlet.subset.clone())
        };
        side.unwrap_or_else(|| self.whole(data))
    }

    /// Source and destination subsets of an access-to-access edge.
    fn endpoint_subsets(&self, memlet: &Memlet, src: &str, dst: &str) -> (Range, Range) {
        if memlet.refers_to(dst) && !memlet.refers_to(src) {
            let dst_sub = memlet.subset.clone().unwrap_or_else(|| self.whole(dst));
            let src_sub = memlet.other_subset.clone().unwrap_or_else(|| dst_sub.clone());
            (src_sub, dst_sub)
        } else {
            let src_sub = memlet.subset.clone().unwrap_or_else(|| self.whole(src));
            let dst_sub = memlet.other_subset.clone().unwrap_or_else(|| src_sub.clone());
            (src_sub, dst_sub)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
