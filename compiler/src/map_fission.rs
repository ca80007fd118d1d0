// map_fission.rs — Split a parallel map into one map per component
//
// A map whose body holds several computations joined only through access
// nodes becomes one map per computation, each over the original iteration
// space. A component is a tasklet, library call, nested program or nested
// scope (entry through exit) sitting directly in the map body. Containers
// passed between components gain one leading dimension per map parameter
// so every iteration keeps its own element.
//
// The second expression matches a map wrapping a single nested program.
// There every state of the nested program is split instead, the nested
// containers that alias outer ones are laid over the full outer container,
// and the outer map is dissolved.
//
// Preconditions: `can_be_applied` returned true for the match on this exact
//                program.
// Postconditions: the matched entry and exit are gone; every new map has the
//                 original parameters and range; memlets are propagated.
// Failure modes: `TransformError::StrideCorrespondence` when a nested
//                container cannot be laid over its outer container. The
//                program is left untouched in that case.
// Side effects: mutates the program in place.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use crate::control_flow::is_sequential;
use crate::data::{DType, Data};
use crate::graph::{in_conn, out_conn, paired_connector, Edge, MapInfo, NodeKind, Program, State};
use crate::id::{EdgeId, NodeId, StateId};
use crate::memlet::Memlet;
use crate::program_query::used_outside;
use crate::propagate::{propagate_state, propagate_subset};
use crate::scope_index::ScopeIndex;
use crate::subset::{Dim, Range};
use crate::symbolic::Expr;
use crate::symbols::SymbolScope;
use crate::transformation::{
    Match, Pattern, PatternNode, RewriteReport, TransformError, Transformation,
};

/// Expression index of a map and its body.
pub const DIRECT: usize = 0;
/// Expression index of a map wrapping one nested program.
pub const NESTED: usize = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct MapFission;

impl Transformation for MapFission {
    fn name(&self) -> &'static str {
        "MapFission"
    }

    fn expressions(&self) -> Vec<Pattern> {
        vec![
            Pattern::single(PatternNode::MapEntry),
            Pattern::path(&[PatternNode::MapEntry, PatternNode::NestedProgram]),
        ]
    }

    fn can_be_applied(&self, program: &Program, m: &Match, _permissive: bool) -> bool {
        let verdict = match m.expr_index {
            DIRECT => check_direct(program, m),
            NESTED => check_nested(program, m),
            _ => Err(Rejection::Missing),
        };
        match verdict {
            Ok(()) => true,
            Err(rule) => {
                debug!(state = %m.state, nodes = ?m.nodes, %rule, "map fission rejected");
                false
            }
        }
    }

    fn apply(&self, program: &mut Program, m: &Match) -> Result<RewriteReport, TransformError> {
        match m.expr_index {
            NESTED => apply_nested(program, m),
            _ => apply_direct(program, m),
        }
    }
}

// ── Legality ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rejection {
    Missing,
    DynamicRange,
    TooFewComponents(usize),
    Undeclared(String),
    NonTransient(String),
    NonScalarExchange(String),
    UsedOutside(String),
    SharedBody,
    UnstructuredControlFlow,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Missing => write!(f, "matched nodes are not a map scope"),
            Rejection::DynamicRange => write!(f, "map range has dynamic inputs"),
            Rejection::TooFewComponents(n) => write!(f, "region has {n} component(s)"),
            Rejection::Undeclared(c) => write!(f, "'{c}' is not declared"),
            Rejection::NonTransient(c) => write!(f, "border container '{c}' is not transient"),
            Rejection::NonScalarExchange(c) => {
                write!(f, "'{c}' passes between code nodes without an access node")
            }
            Rejection::UsedOutside(c) => write!(f, "'{c}' is used outside the map"),
            Rejection::SharedBody => write!(f, "map body holds more than the nested program"),
            Rejection::UnstructuredControlFlow => {
                write!(f, "nested program is not a plain sequence of states")
            }
        }
    }
}

fn check_direct(program: &Program, m: &Match) -> Result<(), Rejection> {
    let st = program.state(m.state).ok_or(Rejection::Missing)?;
    let entry = *m.nodes.first().ok_or(Rejection::Missing)?;
    let exit = st.exit_node(entry).ok_or(Rejection::Missing)?;
    if st.has_dynamic_inputs(entry) {
        return Err(Rejection::DynamicRange);
    }

    let index = ScopeIndex::build(st);
    let comps = components(st, &index, Some(entry));
    if comps.len() <= 1 {
        return Err(Rejection::TooFewComponents(comps.len()));
    }

    let mut region: HashSet<NodeId> = index.scope_subgraph(st, entry).into_iter().collect();
    region.insert(entry);
    region.insert(exit);

    let mut exchanged: BTreeSet<String> = body_access_nodes(st, &index, Some(entry))
        .iter()
        .filter_map(|&n| st.node(n).and_then(|n| n.access_data()).map(str::to_string))
        .collect();
    for eid in crossing_edges(st, &comps) {
        let Some(name) = st.edge(eid).and_then(|e| e.memlet.data.clone()) else {
            continue;
        };
        let desc = program
            .arrays
            .get(&name)
            .ok_or_else(|| Rejection::Undeclared(name.clone()))?;
        if !desc.is_scalar() {
            return Err(Rejection::NonScalarExchange(name));
        }
        exchanged.insert(name);
    }

    for name in &exchanged {
        let desc = program
            .arrays
            .get(name)
            .ok_or_else(|| Rejection::Undeclared(name.clone()))?;
        if !desc.transient {
            return Err(Rejection::NonTransient(name.clone()));
        }
        if used_outside(program, m.state, &region, name) {
            return Err(Rejection::UsedOutside(name.clone()));
        }
    }
    Ok(())
}

fn check_nested(program: &Program, m: &Match) -> Result<(), Rejection> {
    let st = program.state(m.state).ok_or(Rejection::Missing)?;
    let (entry, nested) = match m.nodes.as_slice() {
        [entry, nested] => (*entry, *nested),
        _ => return Err(Rejection::Missing),
    };
    if st.has_dynamic_inputs(entry) {
        return Err(Rejection::DynamicRange);
    }
    let index = ScopeIndex::build(st);
    if index.scope_children(st, Some(entry)) != vec![nested] {
        return Err(Rejection::SharedBody);
    }
    let inner = match st.node(nested).map(|n| &n.kind) {
        Some(NodeKind::Nested { program, .. }) => program,
        _ => return Err(Rejection::Missing),
    };
    if !is_sequential(inner) {
        return Err(Rejection::UnstructuredControlFlow);
    }
    for ist in inner.states.iter().filter(|s| !s.is_empty()) {
        let inner_index = ScopeIndex::build(ist);
        let comps = components(ist, &inner_index, None);
        if comps.len() <= 1 {
            return Err(Rejection::TooFewComponents(comps.len()));
        }
        for eid in crossing_edges(ist, &comps) {
            if let Some(name) = ist.edge(eid).and_then(|e| e.memlet.data.clone()) {
                if !inner.arrays.get(&name).is_some_and(Data::is_scalar) {
                    return Err(Rejection::NonScalarExchange(name));
                }
            }
        }
    }
    Ok(())
}

// ── Region structure ────────────────────────────────────────────────────────

/// One computation of a map body: its input node and its output node.
/// Both are the same node unless the component is a nested scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Component {
    input: NodeId,
    output: NodeId,
}

fn components(state: &State, index: &ScopeIndex, scope: Option<NodeId>) -> Vec<Component> {
    index
        .scope_children(state, scope)
        .into_iter()
        .filter_map(|id| {
            let node = state.node(id)?;
            if node.is_entry() {
                Some(Component {
                    input: id,
                    output: state.exit_node(id)?,
                })
            } else if node.is_code() {
                Some(Component {
                    input: id,
                    output: id,
                })
            } else {
                None
            }
        })
        .collect()
}

fn body_access_nodes(state: &State, index: &ScopeIndex, scope: Option<NodeId>) -> Vec<NodeId> {
    index
        .scope_children(state, scope)
        .into_iter()
        .filter(|&id| state.node(id).is_some_and(|n| n.is_access()))
        .collect()
}

/// Data edges leaving a component straight into another code node or scope.
fn crossing_edges(state: &State, comps: &[Component]) -> Vec<EdgeId> {
    let mut out = Vec::new();
    for c in comps {
        for e in state.out_edges(c.output) {
            let into_code = state
                .node(e.dst)
                .is_some_and(|n| n.is_code() || n.is_entry());
            if into_code && !e.memlet.is_empty() {
                out.push(e.id);
            }
        }
    }
    out
}

fn map_info(state: &State, entry: NodeId) -> Option<MapInfo> {
    state
        .node(entry)
        .and_then(|n| n.scope_info())
        .and_then(|s| s.as_map())
        .cloned()
}

/// Edges feeding scope node `node` on the connector paired with `conn`.
fn outer_in(state: &State, node: NodeId, conn: Option<&str>) -> Vec<Edge> {
    conn.and_then(paired_connector)
        .map(|p| state.in_edges_by_connector(node, &p).into_iter().cloned().collect())
        .unwrap_or_default()
}

fn outer_out(state: &State, node: NodeId, conn: Option<&str>) -> Vec<Edge> {
    conn.and_then(paired_connector)
        .map(|p| state.out_edges_by_connector(node, &p).into_iter().cloned().collect())
        .unwrap_or_default()
}

fn stale(m: &Match) -> TransformError {
    TransformError::StaleMatch {
        transformation: "MapFission",
        state: m.state,
        nodes: m.nodes.clone(),
    }
}

// ── Augmentation bookkeeping ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Augmented {
    /// Containers whose layout already carries the map dimensions.
    done: HashSet<String>,
    /// Former scalars, replaced outright by an iteration-space array.
    replaced: HashSet<String>,
}

/// `leading` in front of `subset`, or `leading` alone for a former scalar.
fn lift(subset: &Range, leading: &[Dim], replaced: bool) -> Range {
    if replaced {
        Range::new(leading.to_vec())
    } else {
        subset.prepend(leading)
    }
}

/// An edge to add once the old scope is gone.
struct Reconnect {
    src: NodeId,
    src_conn: Option<String>,
    dst: NodeId,
    dst_conn: Option<String>,
    memlet: Memlet,
}

// ── Splitting one state ─────────────────────────────────────────────────────

/// One state being split, together with the container table that owns it.
struct Splitter<'a> {
    state: &'a mut State,
    arrays: &'a mut IndexMap<String, Data>,
    map: &'a MapInfo,
}

impl Splitter<'_> {
    fn extents(&self) -> Vec<Expr> {
        self.map.range.size()
    }

    /// One index per map parameter, counted from the range start and
    /// shifted back by the container's leading offsets.
    fn index_dims(&self, offsets: &[Expr]) -> Vec<Dim> {
        self.map
            .params
            .iter()
            .zip(&self.map.range.dims)
            .enumerate()
            .map(|(k, (p, d))| {
                let rel = Expr::floordiv(&Expr::sub(&Expr::sym(p.as_str()), &d.start), &d.step);
                match offsets.get(k) {
                    Some(off) => Dim::index(Expr::sub(&rel, off)),
                    None => Dim::index(rel),
                }
            })
            .collect()
    }

    fn iteration_array(&self, like: &Data) -> Data {
        let mut desc = Data::array(like.dtype, self.extents()).transient();
        desc.storage = like.storage;
        desc.lifetime = like.lifetime;
        desc
    }

    /// Replace scalars passed code-to-code by iteration-space arrays and
    /// route them through a fresh access node.
    fn promote_scalars(&mut self, comps: &[Component]) -> Vec<String> {
        let mut groups: IndexMap<String, Vec<EdgeId>> = IndexMap::new();
        for eid in crossing_edges(self.state, comps) {
            let Some(name) = self.state.edge(eid).and_then(|e| e.memlet.data.clone()) else {
                continue;
            };
            if self.arrays.get(&name).is_some_and(Data::is_scalar) {
                groups.entry(name).or_default().push(eid);
            }
        }

        let subset = Range::new(self.index_dims(&[]));
        let mut promoted = Vec::new();
        for (name, edges) in groups {
            let Some(old) = self.arrays.get(&name) else { continue };
            let desc = self.iteration_array(old);
            self.arrays.insert(name.clone(), desc);
            for eid in edges {
                let Some(edge) = self.state.remove_edge(eid) else { continue };
                let access = self.state.add_access(&name);
                let memlet = Memlet::new(name.clone(), subset.clone());
                self.state
                    .add_edge(edge.src, edge.src_conn.as_deref(), access, None, memlet.clone());
                self.state
                    .add_edge(access, None, edge.dst, edge.dst_conn.as_deref(), memlet);
            }
            trace!(container = %name, "scalar promoted to iteration-space array");
            promoted.push(name);
        }
        promoted
    }

    fn connector_pair(&self, node: NodeId, memlet: &Memlet) -> (Option<String>, Option<String>) {
        if memlet.is_empty() {
            return (None, None);
        }
        let k = self.state.next_connector_index(node);
        (Some(in_conn(k)), Some(out_conn(k)))
    }

    /// Wrap every component in its own copy of the map. With `outer` set,
    /// edges that crossed the old entry/exit are attached to the nodes on
    /// the far side of it. Returns the new entries.
    fn split(&mut self, comps: &[Component], outer: Option<(NodeId, NodeId)>) -> Vec<NodeId> {
        let map = self.map;
        let params: Vec<&str> = map.params.iter().map(String::as_str).collect();
        let label = format!("{}_fission", map.label);
        let mut entries = Vec::new();

        for c in comps {
            let (me, mx) = self.state.add_map(&label, &params, map.range.clone(), map.kind);

            let inputs: Vec<EdgeId> = self.state.in_edges(c.input).iter().map(|e| e.id).collect();
            for eid in inputs {
                let Some(e) = self.state.remove_edge(eid) else { continue };
                let (ic, oc) = self.connector_pair(me, &e.memlet);
                self.state
                    .add_edge(me, oc.as_deref(), e.dst, e.dst_conn.as_deref(), e.memlet.clone());
                match outer {
                    Some((entry, _)) if e.src == entry => {
                        for o in outer_in(self.state, entry, e.src_conn.as_deref()) {
                            self.state
                                .add_edge(o.src, o.src_conn.as_deref(), me, ic.as_deref(), o.memlet);
                        }
                    }
                    _ => {
                        self.state
                            .add_edge(e.src, e.src_conn.as_deref(), me, ic.as_deref(), e.memlet);
                    }
                }
            }
            if self.state.in_degree(c.input) == 0 {
                self.state.add_edge(me, None, c.input, None, Memlet::empty());
            }

            let outputs: Vec<EdgeId> = self.state.out_edges(c.output).iter().map(|e| e.id).collect();
            for eid in outputs {
                let Some(e) = self.state.remove_edge(eid) else { continue };
                let (ic, oc) = self.connector_pair(mx, &e.memlet);
                self.state
                    .add_edge(e.src, e.src_conn.as_deref(), mx, ic.as_deref(), e.memlet.clone());
                match outer {
                    Some((_, exit)) if e.dst == exit => {
                        for o in outer_out(self.state, exit, e.dst_conn.as_deref()) {
                            self.state
                                .add_edge(mx, oc.as_deref(), o.dst, o.dst_conn.as_deref(), o.memlet);
                        }
                    }
                    _ => {
                        self.state
                            .add_edge(mx, oc.as_deref(), e.dst, e.dst_conn.as_deref(), e.memlet);
                    }
                }
            }
            if self.state.out_degree(c.output) == 0 {
                self.state.add_edge(c.output, None, mx, None, Memlet::empty());
            }
            entries.push(me);
        }
        entries
    }

    /// Give each border container the map dimensions, once per program.
    fn augment(&mut self, names: &[String], aug: &mut Augmented, report: &mut RewriteReport) {
        let extents = self.extents();
        for name in names {
            if aug.done.contains(name) {
                continue;
            }
            let Some(desc) = self.arrays.get(name) else { continue };
            if desc.is_scalar() {
                let replacement = self.iteration_array(desc);
                self.arrays.insert(name.clone(), replacement);
                aug.replaced.insert(name.clone());
                report.promoted.push(name.clone());
            } else if let Some(desc) = self.arrays.get_mut(name) {
                desc.prepend_dims(&extents);
                report.augmented.push(name.clone());
            }
            aug.done.insert(name.clone());
        }
    }

    /// Prefix the map indices to every memlet that addresses a border
    /// container through `nodes`. Edges touching `skip` are left alone.
    fn index_border_memlets(&mut self, nodes: &[NodeId], skip: &[NodeId], aug: &Augmented) {
        let nparams = self.map.params.len();
        let mut corrected: HashSet<(String, EdgeId)> = HashSet::new();
        for &n in nodes {
            let Some(name) = self
                .state
                .node(n)
                .and_then(|x| x.access_data())
                .map(str::to_string)
            else {
                continue;
            };
            let offsets: Vec<Expr> = self
                .arrays
                .get(&name)
                .map(|d| d.offset.iter().take(nparams).cloned().collect())
                .unwrap_or_default();
            let leading = self.index_dims(&offsets);
            let replaced = aug.replaced.contains(&name);

            let incident: Vec<EdgeId> = self
                .state
                .in_edges(n)
                .iter()
                .chain(self.state.out_edges(n).iter())
                .map(|e| e.id)
                .collect();
            for eid in incident {
                for tid in self.state.memlet_tree(eid) {
                    if !corrected.insert((name.clone(), tid)) {
                        continue;
                    }
                    let Some(e) = self.state.edge_mut(tid) else { continue };
                    if e.memlet.is_empty() || skip.contains(&e.src) || skip.contains(&e.dst) {
                        continue;
                    }
                    if e.memlet.refers_to(&name) {
                        if let Some(s) = &e.memlet.subset {
                            e.memlet.subset = Some(lift(s, &leading, replaced));
                        }
                    } else if let Some(o) = &e.memlet.other_subset {
                        e.memlet.other_subset = Some(lift(o, &leading, replaced));
                    }
                }
            }
        }
    }
}

// ── Direct body ─────────────────────────────────────────────────────────────

fn apply_direct(program: &mut Program, m: &Match) -> Result<RewriteReport, TransformError> {
    let entry = *m.nodes.first().ok_or_else(|| stale(m))?;
    let Program { states, arrays, .. } = program;
    let st = states.get_mut(m.state.index()).ok_or_else(|| stale(m))?;
    let exit = st.exit_node(entry).ok_or_else(|| stale(m))?;
    let map = map_info(st, entry).ok_or_else(|| stale(m))?;

    let index = ScopeIndex::build(st);
    let comps = components(st, &index, Some(entry));
    let intermediates = body_access_nodes(st, &index, Some(entry));
    let mut border: Vec<String> = Vec::new();
    for &n in &intermediates {
        if let Some(name) = st.node(n).and_then(|x| x.access_data()) {
            if !border.iter().any(|b| b == name) {
                border.push(name.to_string());
            }
        }
    }
    let pending = reconnections(st, arrays, &map, entry, exit, &intermediates);

    let mut report = RewriteReport::default();
    let mut aug = Augmented::default();
    let mut splitter = Splitter {
        state: &mut *st,
        arrays: &mut *arrays,
        map: &map,
    };
    report.promoted = splitter.promote_scalars(&comps);
    report.new_scopes = splitter
        .split(&comps, Some((entry, exit)))
        .into_iter()
        .map(|n| (m.state, n))
        .collect();
    splitter.augment(&border, &mut aug, &mut report);
    splitter.index_border_memlets(&intermediates, &[entry, exit], &aug);

    for r in pending {
        st.add_edge(r.src, r.src_conn.as_deref(), r.dst, r.dst_conn.as_deref(), r.memlet);
    }
    st.remove_node(entry);
    st.remove_node(exit);
    propagate_state(st);

    debug!(
        map = %map.label,
        components = comps.len(),
        border = ?border,
        "map body split"
    );
    Ok(report)
}

/// Edges joining body access nodes directly to the old entry or exit, and
/// the edges that replace them once the scope is gone. The access-node side
/// covers every iteration.
fn reconnections(
    st: &State,
    arrays: &IndexMap<String, Data>,
    map: &MapInfo,
    entry: NodeId,
    exit: NodeId,
    intermediates: &[NodeId],
) -> Vec<Reconnect> {
    let zero_based: Vec<Dim> = map
        .range
        .size()
        .iter()
        .map(|n| Dim::span(Expr::zero(), n))
        .collect();
    let mut out = Vec::new();
    for &n in intermediates {
        let Some(name) = st.node(n).and_then(|x| x.access_data()) else { continue };
        let Some(desc) = arrays.get(name) else { continue };
        let replaced = desc.is_scalar();
        let node_side = |m: &Memlet| {
            let s = if m.refers_to(name) {
                m.subset.clone()
            } else {
                m.other_subset.clone()
            };
            let s = s.unwrap_or_else(|| Range::from_shape(&desc.shape));
            lift(&s, &zero_based, replaced)
        };

        for e in st.edges_between(entry, n) {
            if let Some(o) = outer_in(st, entry, e.src_conn.as_deref()).into_iter().next() {
                out.push(Reconnect {
                    src: o.src,
                    src_conn: o.src_conn.clone(),
                    dst: n,
                    dst_conn: e.dst_conn.clone(),
                    memlet: Memlet {
                        other_subset: Some(node_side(&e.memlet)),
                        wcr: None,
                        ..o.memlet
                    },
                });
            }
        }
        for e in st.edges_between(n, exit) {
            if let Some(o) = outer_out(st, exit, e.dst_conn.as_deref()).into_iter().next() {
                out.push(Reconnect {
                    src: n,
                    src_conn: e.src_conn.clone(),
                    dst: o.dst,
                    dst_conn: o.dst_conn.clone(),
                    memlet: Memlet {
                        other_subset: Some(node_side(&e.memlet)),
                        ..o.memlet
                    },
                });
            }
        }
    }
    out
}

// ── Nested program ──────────────────────────────────────────────────────────

/// How an inner container lies inside its outer container: matched
/// dimensions (inner → outer) and a template giving every outer-only
/// dimension.
#[derive(Debug, Clone)]
struct Unsqueeze {
    common: Vec<(usize, usize)>,
    template: Vec<Option<Dim>>,
}

impl Unsqueeze {
    fn apply(&self, inner: &Range) -> Range {
        let mut dims = self.template.clone();
        for &(i, j) in &self.common {
            if let (Some(slot), Some(d)) = (dims.get_mut(j), inner.dims.get(i)) {
                *slot = Some(d.clone());
            }
        }
        Range::new(dims.into_iter().flatten().collect())
    }
}

/// Match each inner dimension to the first unused outer dimension with the
/// same stride and extent. Inner dimensions of extent 1 may go unmatched.
fn correspondence(
    nested: &str,
    container: &str,
    inner: &Data,
    outer: &Data,
    outer_subset: Option<&Range>,
) -> Result<Unsqueeze, TransformError> {
    let mut common = Vec::new();
    let mut used = HashSet::new();
    for (i, (stride, extent)) in inner.strides.iter().zip(&inner.shape).enumerate() {
        let found = (0..outer.rank()).find(|j| {
            !used.contains(j) && outer.strides.get(*j) == Some(stride) && outer.shape.get(*j) == Some(extent)
        });
        match found {
            Some(j) => {
                used.insert(j);
                common.push((i, j));
            }
            None if extent.is_one() => {}
            None => {
                return Err(TransformError::StrideCorrespondence {
                    nested: nested.to_string(),
                    container: container.to_string(),
                    dim: i,
                })
            }
        }
    }

    let mut template = Vec::with_capacity(outer.rank());
    for j in 0..outer.rank() {
        if used.contains(&j) {
            template.push(None);
            continue;
        }
        let dim = outer_subset
            .and_then(|s| s.dims.get(j).cloned())
            .unwrap_or_else(|| Dim::span(Expr::zero(), &outer.shape[j]));
        warn!(container, dim = j, subset = %dim, "outer dimension taken from the boundary subset");
        template.push(Some(dim));
    }
    Ok(Unsqueeze { common, template })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Input,
    Output,
}

/// Outer edges of the nested node, keyed by the inner container they bind.
struct Boundary {
    inputs: HashMap<String, Edge>,
    outputs: HashMap<String, Edge>,
}

impl Boundary {
    fn of(st: &State, nested: NodeId) -> Self {
        let inputs = st
            .in_edges(nested)
            .into_iter()
            .filter_map(|e| e.dst_conn.clone().map(|c| (c, e.clone())))
            .collect();
        let outputs = st
            .out_edges(nested)
            .into_iter()
            .filter_map(|e| e.src_conn.clone().map(|c| (c, e.clone())))
            .collect();
        Boundary { inputs, outputs }
    }

    fn get(&self, side: Side, name: &str) -> Option<&Edge> {
        match side {
            Side::Input => self.inputs.get(name),
            Side::Output => self.outputs.get(name),
        }
    }
}

/// Bind every symbol the boundary needs inside the nested program, then
/// drop the map parameters, which the new inner maps define.
fn hoist_symbols(
    program: &Program,
    sid: StateId,
    entry: NodeId,
    nested: NodeId,
    map: &MapInfo,
    inner: &mut Program,
    mapping: &mut IndexMap<String, Expr>,
) {
    let Some(st) = program.state(sid) else { return };
    let mut syms = map.range.free_symbols();
    let mut boundary = st.out_edges(entry);
    if let Some(exit) = st.exit_node(entry) {
        boundary.extend(st.in_edges(exit));
    }
    for e in boundary {
        let Some(name) = e.memlet.data_name() else { continue };
        if let Some(s) = &e.memlet.subset {
            syms.extend(s.free_symbols());
        }
        if let Some(desc) = program.arrays.get(name) {
            syms.extend(desc.free_symbols());
        }
    }

    let visible = SymbolScope::defined_at(program, sid, nested);
    for sym in syms {
        if map.params.contains(&sym) || mapping.contains_key(&sym) {
            continue;
        }
        let dtype = match visible.lookup(&sym) {
            Some(binding) => binding.dtype,
            None => {
                warn!(symbol = %sym, nested = %inner.name, "hoisted symbol is not declared outside; typing it int64");
                DType::Int64
            }
        };
        trace!(symbol = %sym, %dtype, "symbol hoisted into nested program");
        mapping.insert(sym.clone(), Expr::sym(sym.clone()));
        inner.symbols.insert(sym, dtype);
    }
    for p in &map.params {
        mapping.shift_remove(p);
        inner.symbols.shift_remove(p);
    }
}

fn apply_nested(program: &mut Program, m: &Match) -> Result<RewriteReport, TransformError> {
    let (entry, nested) = match m.nodes.as_slice() {
        [entry, nested] => (*entry, *nested),
        _ => return Err(stale(m)),
    };
    let st = program.state(m.state).ok_or_else(|| stale(m))?;
    let exit = st.exit_node(entry).ok_or_else(|| stale(m))?;
    let map = map_info(st, entry).ok_or_else(|| stale(m))?;
    let (label, mut inner, mut mapping) = match st.node(nested).map(|n| &n.kind) {
        Some(NodeKind::Nested {
            label,
            program,
            symbol_mapping,
        }) => (label.clone(), (**program).clone(), symbol_mapping.clone()),
        _ => return Err(stale(m)),
    };
    let boundary = Boundary::of(st, nested);

    // The nested program is rewritten on a copy; the outer graph is only
    // touched once every inner state has been split.
    hoist_symbols(program, m.state, entry, nested, &map, &mut inner, &mut mapping);

    let mut report = RewriteReport::default();
    let mut aug = Augmented::default();
    let mut unsqueeze: HashMap<String, Unsqueeze> = HashMap::new();
    let Program {
        states: inner_states,
        arrays: inner_arrays,
        ..
    } = &mut inner;

    for (k, ist) in inner_states.iter_mut().enumerate() {
        if ist.is_empty() {
            continue;
        }
        let inner_sid = StateId(k as u32);
        let index = ScopeIndex::build(ist);
        let comps = components(ist, &index, None);
        let is_external = |n: NodeId| {
            ist.node(n)
                .and_then(|x| x.access_data())
                .and_then(|d| inner_arrays.get(d))
                .is_some_and(|d| !d.transient)
        };
        let mut external: Vec<(NodeId, Side)> = Vec::new();
        for e in ist.edges().filter(|e| !e.memlet.is_empty()) {
            if is_external(e.src) && !external.contains(&(e.src, Side::Input)) {
                external.push((e.src, Side::Input));
            }
            if is_external(e.dst) && !external.contains(&(e.dst, Side::Output)) {
                external.push((e.dst, Side::Output));
            }
        }
        let border_nodes: Vec<NodeId> = body_access_nodes(ist, &index, None)
            .into_iter()
            .filter(|&n| !is_external(n))
            .collect();
        let mut border: Vec<String> = Vec::new();
        for &n in &border_nodes {
            if let Some(name) = ist.node(n).and_then(|x| x.access_data()) {
                if !border.iter().any(|b| b == name) {
                    border.push(name.to_string());
                }
            }
        }

        let mut splitter = Splitter {
            state: &mut *ist,
            arrays: &mut *inner_arrays,
            map: &map,
        };
        report.promoted.extend(splitter.promote_scalars(&comps));
        let new_entries = splitter.split(&comps, None);
        splitter.augment(&border, &mut aug, &mut report);
        reconcile(
            &mut splitter,
            &label,
            &external,
            &new_entries,
            &boundary,
            &program.arrays,
            &mut unsqueeze,
        )?;
        splitter.index_border_memlets(&border_nodes, &[], &aug);
        propagate_state(ist);
        report
            .new_scopes
            .extend(new_entries.into_iter().map(|n| (inner_sid, n)));
    }

    // Reconnect the outer graph straight to the nested node.
    let Program { states, arrays, .. } = program;
    let st = states.get_mut(m.state.index()).ok_or_else(|| stale(m))?;
    if let Some(NodeKind::Nested {
        program: slot,
        symbol_mapping,
        ..
    }) = st.node_mut(nested).map(|n| &mut n.kind)
    {
        **slot = inner;
        *symbol_mapping = mapping;
    }

    let full = |mut memlet: Memlet| {
        if let Some(desc) = memlet.data_name().and_then(|d| arrays.get(d)) {
            memlet.subset = Some(Range::from_shape(&desc.shape));
        }
        memlet
    };
    let inbound: Vec<Edge> = st
        .in_edges(entry)
        .into_iter()
        .filter(|e| e.dst_conn.as_deref().is_some_and(|c| c.starts_with("IN_")))
        .cloned()
        .collect();
    for e in inbound {
        let memlet = full(e.memlet.clone());
        let Some(pair) = e.dst_conn.as_deref().and_then(paired_connector) else { continue };
        let inner_edges: Vec<Edge> = st
            .out_edges_by_connector(entry, &pair)
            .into_iter()
            .cloned()
            .collect();
        for ie in inner_edges {
            st.add_edge(e.src, e.src_conn.as_deref(), nested, ie.dst_conn.as_deref(), memlet.clone());
        }
    }
    let outbound: Vec<Edge> = st.out_edges(exit).into_iter().cloned().collect();
    for e in outbound {
        let memlet = full(e.memlet.clone());
        let Some(pair) = e.src_conn.as_deref().and_then(paired_connector) else { continue };
        let inner_edges: Vec<Edge> = st
            .in_edges_by_connector(exit, &pair)
            .into_iter()
            .cloned()
            .collect();
        for ie in inner_edges {
            st.add_edge(nested, ie.src_conn.as_deref(), e.dst, e.dst_conn.as_deref(), memlet.clone());
        }
    }
    st.remove_node(entry);
    st.remove_node(exit);
    propagate_state(st);

    debug!(map = %map.label, nested = %label, "nested program split");
    Ok(report)
}

/// Lay every boundary container of the nested program over its outer
/// container and re-subscript the inner memlets that address it.
fn reconcile(
    sp: &mut Splitter<'_>,
    nested: &str,
    external: &[(NodeId, Side)],
    new_entries: &[NodeId],
    boundary: &Boundary,
    outer_arrays: &IndexMap<String, Data>,
    unsqueeze: &mut HashMap<String, Unsqueeze>,
) -> Result<(), TransformError> {
    for &(node, side) in external {
        let Some(name) = sp.state.node(node).and_then(|n| n.access_data()).map(str::to_string) else {
            continue;
        };
        if unsqueeze.contains_key(&name) {
            continue;
        }
        let Some(outer_edge) = boundary.get(side, &name) else {
            debug!(container = %name, "no outer edge binds nested container");
            continue;
        };
        let Some(outer_desc) = outer_edge.memlet.data_name().and_then(|d| outer_arrays.get(d)) else {
            continue;
        };
        let Some(desc) = sp.arrays.get(&name) else { continue };
        let u = correspondence(nested, &name, desc, outer_desc, outer_edge.memlet.subset.as_ref())?;
        unsqueeze.insert(name.clone(), u);

        if desc.is_scalar() {
            let mut replacement = outer_desc.clone();
            replacement.transient = false;
            sp.arrays.insert(name.clone(), replacement);
        } else if let Some(desc) = sp.arrays.get_mut(&name) {
            desc.shape = outer_desc.shape.clone();
            desc.strides = outer_desc.strides.clone();
            desc.total_size = outer_desc.total_size.clone();
            desc.offset = outer_desc.offset.clone();
        }
    }

    let index = ScopeIndex::build(sp.state);
    let new_exits: Vec<NodeId> = new_entries
        .iter()
        .filter_map(|&e| sp.state.exit_node(e))
        .collect();
    let scoped = |n: NodeId| {
        index.scope_of(n).is_some() || new_entries.contains(&n) || new_exits.contains(&n)
    };

    let map = sp.map;
    let mut corrected_nodes = HashSet::new();
    let mut corrected_edges = HashSet::new();
    for &(node, _) in external {
        if !corrected_nodes.insert(node) {
            continue;
        }
        let Some(name) = sp.state.node(node).and_then(|n| n.access_data()).map(str::to_string) else {
            continue;
        };
        let Some(u) = unsqueeze.get(&name) else { continue };
        let incident: Vec<EdgeId> = sp
            .state
            .in_edges(node)
            .iter()
            .chain(sp.state.out_edges(node).iter())
            .map(|e| e.id)
            .collect();
        for eid in incident {
            for tid in sp.state.memlet_tree(eid) {
                if !corrected_edges.insert(tid) {
                    continue;
                }
                let Some(e) = sp.state.edge_mut(tid) else { continue };
                if e.memlet.is_empty() {
                    continue;
                }
                let inside = scoped(e.src) && scoped(e.dst);
                if e.memlet.refers_to(&name) {
                    if let Some(s) = &e.memlet.subset {
                        e.memlet.subset = Some(u.apply(s));
                    }
                } else if let Some(o) = &e.memlet.other_subset {
                    e.memlet.other_subset = Some(u.apply(o));
                }
                if !inside {
                    if let Some(p) = propagate_subset(std::slice::from_ref(&e.memlet), &map.params, &map.range) {
                        e.memlet.subset = p.subset;
                    }
                    if let Some(o) = &e.memlet.other_subset {
                        e.memlet.other_subset = Some(o.image(&map.params, &map.range));
                    }
                }
            }
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
