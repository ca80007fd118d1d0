// graph.rs — Two-level dataflow multigraph
//
// A `Program` is an outer graph of states joined by guarded transitions.
// Each `State` is an inner multigraph of access, code, scope and nested
// program nodes joined by memlet edges. Nodes and edges live in append-only
// arenas addressed by `NodeId`/`EdgeId`; removal leaves a tombstone so that
// handles held across a rewrite never alias a different element.
//
// Scope connectors follow one convention throughout the crate: data entering
// a scope through `IN_k` leaves through `OUT_k` on the same node. Any other
// entry in-connector is a dynamic range input.
//
// Preconditions: none.
// Postconditions: `topological_order` lists every live node exactly once.
// Failure modes: `Program::from_json` / `load` return `LoadError`.
// Side effects: `Program::load` / `save` touch the file system.

use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{DType, Data};
use crate::id::{EdgeId, NodeId, StateId};
use crate::memlet::Memlet;
use crate::subset::Range;
use crate::symbolic::Expr;

// ── Scope descriptors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKind {
    /// Iterations run in any order, possibly concurrently.
    Parallel,
    /// Software-pipelined iteration.
    Pipeline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInfo {
    pub label: String,
    pub params: Vec<String>,
    pub range: Range,
    pub kind: MapKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeInfo {
    pub label: String,
    /// Worker index symbol.
    pub pe_index: String,
    pub num_pes: Expr,
    /// Continuation predicate; `None` means "until the stream is empty".
    pub condition: Option<String>,
    pub stream: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum ScopeInfo {
    Map(MapInfo),
    Consume(ConsumeInfo),
}

impl ScopeInfo {
    pub fn label(&self) -> &str {
        match self {
            ScopeInfo::Map(m) => &m.label,
            ScopeInfo::Consume(c) => &c.label,
        }
    }

    /// Iteration symbols defined by the scope.
    pub fn params(&self) -> Vec<String> {
        match self {
            ScopeInfo::Map(m) => m.params.clone(),
            ScopeInfo::Consume(c) => vec![c.pe_index.clone()],
        }
    }

    /// Iteration space, one dimension per parameter.
    pub fn range(&self) -> Range {
        match self {
            ScopeInfo::Map(m) => m.range.clone(),
            ScopeInfo::Consume(c) => Range::from_shape(std::slice::from_ref(&c.num_pes)),
        }
    }

    pub fn as_map(&self) -> Option<&MapInfo> {
        match self {
            ScopeInfo::Map(m) => Some(m),
            ScopeInfo::Consume(_) => None,
        }
    }
}

// ── Nodes and edges ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Access {
        data: String,
    },
    Tasklet {
        label: String,
        code: String,
    },
    Library {
        label: String,
        op: String,
        #[serde(default)]
        properties: IndexMap<String, String>,
    },
    Entry {
        info: ScopeInfo,
        exit: NodeId,
    },
    Exit {
        entry: NodeId,
    },
    Nested {
        label: String,
        program: Box<Program>,
        #[serde(default)]
        symbol_mapping: IndexMap<String, Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub in_connectors: Vec<String>,
    #[serde(default)]
    pub out_connectors: Vec<String>,
}

impl Node {
    pub fn access_data(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Access { data } => Some(data),
            _ => None,
        }
    }

    pub fn is_access(&self) -> bool {
        matches!(self.kind, NodeKind::Access { .. })
    }

    /// Tasklets, library calls and nested programs.
    pub fn is_code(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Tasklet { .. } | NodeKind::Library { .. } | NodeKind::Nested { .. }
        )
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.kind, NodeKind::Entry { .. })
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.kind, NodeKind::Exit { .. })
    }

    pub fn is_nested(&self) -> bool {
        matches!(self.kind, NodeKind::Nested { .. })
    }

    pub fn scope_info(&self) -> Option<&ScopeInfo> {
        match &self.kind {
            NodeKind::Entry { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match &self.kind {
            NodeKind::Access { data } => data.clone(),
            NodeKind::Tasklet { label, .. }
            | NodeKind::Library { label, .. }
            | NodeKind::Nested { label, .. } => label.clone(),
            NodeKind::Entry { info, .. } => info.label().to_string(),
            NodeKind::Exit { entry } => format!("exit({entry})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub src: NodeId,
    #[serde(default)]
    pub src_conn: Option<String>,
    pub dst: NodeId,
    #[serde(default)]
    pub dst_conn: Option<String>,
    pub memlet: Memlet,
}

pub fn in_conn(k: usize) -> String {
    format!("IN_{k}")
}

pub fn out_conn(k: usize) -> String {
    format!("OUT_{k}")
}

/// `IN_k` → `OUT_k` and back; `None` for dynamic-input connectors.
pub fn paired_connector(conn: &str) -> Option<String> {
    if let Some(k) = conn.strip_prefix("IN_") {
        Some(format!("OUT_{k}"))
    } else {
        conn.strip_prefix("OUT_").map(|k| format!("IN_{k}"))
    }
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct State {
    pub label: String,
    nodes: Vec<Option<Node>>,
    edges: Vec<Option<Edge>>,
}

impl State {
    pub fn new(label: impl Into<String>) -> Self {
        State {
            label: label.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    // ── Construction ────────────────────────────────────────────────────

    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node {
            id,
            kind,
            in_connectors: Vec::new(),
            out_connectors: Vec::new(),
        }));
        id
    }

    pub fn add_access(&mut self, data: &str) -> NodeId {
        self.add_node(NodeKind::Access {
            data: data.to_string(),
        })
    }

    pub fn add_tasklet(&mut self, label: &str, code: &str, ins: &[&str], outs: &[&str]) -> NodeId {
        let id = self.add_node(NodeKind::Tasklet {
            label: label.to_string(),
            code: code.to_string(),
        });
        self.set_connectors(id, ins, outs);
        id
    }

    pub fn add_library(
        &mut self,
        label: &str,
        op: &str,
        properties: IndexMap<String, String>,
        ins: &[&str],
        outs: &[&str],
    ) -> NodeId {
        let id = self.add_node(NodeKind::Library {
            label: label.to_string(),
            op: op.to_string(),
            properties,
        });
        self.set_connectors(id, ins, outs);
        id
    }

    pub fn add_nested(
        &mut self,
        label: &str,
        program: Program,
        symbol_mapping: IndexMap<String, Expr>,
        ins: &[&str],
        outs: &[&str],
    ) -> NodeId {
        let id = self.add_node(NodeKind::Nested {
            label: label.to_string(),
            program: Box::new(program),
            symbol_mapping,
        });
        self.set_connectors(id, ins, outs);
        id
    }

    /// Add a scope entry/exit pair.
    pub fn add_scope(&mut self, info: ScopeInfo) -> (NodeId, NodeId) {
        let entry = NodeId(self.nodes.len() as u32);
        let exit = NodeId(entry.0 + 1);
        self.add_node(NodeKind::Entry { info, exit });
        self.add_node(NodeKind::Exit { entry });
        (entry, exit)
    }

    pub fn add_map(
        &mut self,
        label: &str,
        params: &[&str],
        range: Range,
        kind: MapKind,
    ) -> (NodeId, NodeId) {
        self.add_scope(ScopeInfo::Map(MapInfo {
            label: label.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            range,
            kind,
        }))
    }

    pub fn add_consume(
        &mut self,
        label: &str,
        pe_index: &str,
        num_pes: Expr,
        condition: Option<&str>,
        stream: &str,
    ) -> (NodeId, NodeId) {
        self.add_scope(ScopeInfo::Consume(ConsumeInfo {
            label: label.to_string(),
            pe_index: pe_index.to_string(),
            num_pes,
            condition: condition.map(str::to_string),
            stream: stream.to_string(),
        }))
    }

    fn set_connectors(&mut self, id: NodeId, ins: &[&str], outs: &[&str]) {
        if let Some(node) = self.node_mut(id) {
            node.in_connectors = ins.iter().map(|s| s.to_string()).collect();
            node.out_connectors = outs.iter().map(|s| s.to_string()).collect();
        }
    }

    /// Add an edge. Named connectors missing on the endpoints are added.
    pub fn add_edge(
        &mut self,
        src: NodeId,
        src_conn: Option<&str>,
        dst: NodeId,
        dst_conn: Option<&str>,
        memlet: Memlet,
    ) -> EdgeId {
        if let (Some(c), Some(node)) = (src_conn, self.node_mut(src)) {
            if !node.out_connectors.iter().any(|x| x == c) {
                node.out_connectors.push(c.to_string());
            }
        }
        if let (Some(c), Some(node)) = (dst_conn, self.node_mut(dst)) {
            if !node.in_connectors.iter().any(|x| x == c) {
                node.in_connectors.push(c.to_string());
            }
        }
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Some(Edge {
            id,
            src,
            src_conn: src_conn.map(str::to_string),
            dst,
            dst_conn: dst_conn.map(str::to_string),
            memlet,
        }));
        id
    }

    pub fn remove_edge(&mut self, id: EdgeId) -> Option<Edge> {
        self.edges.get_mut(id.index()).and_then(Option::take)
    }

    /// Remove a node together with every incident edge.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let incident: Vec<EdgeId> = self
            .edges()
            .filter(|e| e.src == id || e.dst == id)
            .map(|e| e.id)
            .collect();
        for e in incident {
            self.remove_edge(e);
        }
        self.nodes.get_mut(id.index()).and_then(Option::take)
    }

    /// Drop the scope connector pair `IN_k`/`OUT_k` on a node.
    pub fn remove_connector_pair(&mut self, id: NodeId, conn: &str) {
        let pair = paired_connector(conn);
        if let Some(node) = self.node_mut(id) {
            node.in_connectors
                .retain(|c| c != conn && Some(c) != pair.as_ref());
            node.out_connectors
                .retain(|c| c != conn && Some(c) != pair.as_ref());
        }
    }

    // ── Access ──────────────────────────────────────────────────────────

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.index()).and_then(Option::as_ref)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> Option<&mut Edge> {
        self.edges.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut().flatten()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes().map(|n| n.id).collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().flatten()
    }

    pub fn edges_mut(&mut self) -> impl Iterator<Item = &mut Edge> {
        self.edges.iter_mut().flatten()
    }

    pub fn edge_ids(&self) -> Vec<EdgeId> {
        self.edges().map(|e| e.id).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.node_count() == 0
    }

    pub fn in_edges(&self, id: NodeId) -> Vec<&Edge> {
        self.edges().filter(|e| e.dst == id).collect()
    }

    pub fn out_edges(&self, id: NodeId) -> Vec<&Edge> {
        self.edges().filter(|e| e.src == id).collect()
    }

    pub fn in_degree(&self, id: NodeId) -> usize {
        self.edges().filter(|e| e.dst == id).count()
    }

    pub fn out_degree(&self, id: NodeId) -> usize {
        self.edges().filter(|e| e.src == id).count()
    }

    pub fn edges_between(&self, src: NodeId, dst: NodeId) -> Vec<&Edge> {
        self.edges()
            .filter(|e| e.src == src && e.dst == dst)
            .collect()
    }

    pub fn in_edges_by_connector(&self, id: NodeId, conn: &str) -> Vec<&Edge> {
        self.edges()
            .filter(|e| e.dst == id && e.dst_conn.as_deref() == Some(conn))
            .collect()
    }

    pub fn out_edges_by_connector(&self, id: NodeId, conn: &str) -> Vec<&Edge> {
        self.edges()
            .filter(|e| e.src == id && e.src_conn.as_deref() == Some(conn))
            .collect()
    }

    pub fn source_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| self.in_degree(n.id) == 0)
            .map(|n| n.id)
            .collect()
    }

    pub fn sink_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| self.out_degree(n.id) == 0)
            .map(|n| n.id)
            .collect()
    }

    pub fn exit_node(&self, entry: NodeId) -> Option<NodeId> {
        match self.node(entry)?.kind {
            NodeKind::Entry { exit, .. } => Some(exit),
            _ => None,
        }
    }

    pub fn entry_node(&self, exit: NodeId) -> Option<NodeId> {
        match self.node(exit)?.kind {
            NodeKind::Exit { entry } => Some(entry),
            _ => None,
        }
    }

    /// Kahn's algorithm, ties broken by ascending id. Nodes on a cycle are
    /// appended in id order after every acyclic node.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut indegree: HashMap<NodeId, usize> =
            self.nodes().map(|n| (n.id, 0)).collect();
        for e in self.edges() {
            if let Some(d) = indegree.get_mut(&e.dst) {
                *d += 1;
            }
        }
        let mut ready: BinaryHeap<Reverse<NodeId>> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| Reverse(*n))
            .collect();
        let mut order = Vec::with_capacity(indegree.len());
        let mut placed = BTreeSet::new();
        while let Some(Reverse(n)) = ready.pop() {
            order.push(n);
            placed.insert(n);
            for e in self.edges().filter(|e| e.src == n) {
                if let Some(d) = indegree.get_mut(&e.dst) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(e.dst));
                    }
                }
            }
        }
        for n in self.node_ids() {
            if !placed.contains(&n) {
                order.push(n);
            }
        }
        order
    }

    pub fn is_acyclic(&self) -> bool {
        let mut indegree: HashMap<NodeId, usize> =
            self.nodes().map(|n| (n.id, 0)).collect();
        for e in self.edges() {
            if let Some(d) = indegree.get_mut(&e.dst) {
                *d += 1;
            }
        }
        let mut ready: Vec<NodeId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut seen = 0;
        while let Some(n) = ready.pop() {
            seen += 1;
            for e in self.edges().filter(|e| e.src == n) {
                if let Some(d) = indegree.get_mut(&e.dst) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(e.dst);
                    }
                }
            }
        }
        seen == indegree.len()
    }

    /// Edges a memlet traverses from its outermost source to its outermost
    /// destination, following `IN_k`/`OUT_k` pairs through scope nodes.
    pub fn memlet_path(&self, edge: EdgeId) -> Vec<EdgeId> {
        let Some(start) = self.edge(edge) else {
            return Vec::new();
        };
        let mut path = vec![start.id];

        let mut cur = start;
        while let (Some(node), Some(conn)) = (self.node(cur.src), cur.src_conn.as_deref()) {
            if !node.is_entry() {
                break;
            }
            let Some(incoming) = paired_connector(conn) else { break };
            let Some(prev) = self.in_edges_by_connector(cur.src, &incoming).into_iter().next()
            else {
                break;
            };
            path.insert(0, prev.id);
            cur = prev;
        }

        let mut cur = start;
        while let (Some(node), Some(conn)) = (self.node(cur.dst), cur.dst_conn.as_deref()) {
            if !node.is_exit() {
                break;
            }
            let Some(outgoing) = paired_connector(conn) else { break };
            let Some(next) = self.out_edges_by_connector(cur.dst, &outgoing).into_iter().next()
            else {
                break;
            };
            path.push(next.id);
            cur = next;
        }
        path
    }

    /// Every edge joined to `edge` through `IN_k`/`OUT_k` pairs of scope
    /// nodes, in both directions and across fan-out, in id order.
    pub fn memlet_tree(&self, edge: EdgeId) -> Vec<EdgeId> {
        let mut seen = BTreeSet::new();
        let mut work = vec![edge];
        while let Some(id) = work.pop() {
            let Some(e) = self.edge(id) else { continue };
            if !seen.insert(id) {
                continue;
            }
            let scope_conn = |node: NodeId, conn: Option<&str>| {
                let is_scope = self.node(node).is_some_and(|n| n.is_entry() || n.is_exit());
                conn.filter(|_| is_scope)
                    .and_then(|c| paired_connector(c).map(|p| (c.to_string(), p)))
            };
            if let Some((conn, pair)) = scope_conn(e.src, e.src_conn.as_deref()) {
                work.extend(self.in_edges_by_connector(e.src, &pair).iter().map(|x| x.id));
                work.extend(self.out_edges_by_connector(e.src, &conn).iter().map(|x| x.id));
            }
            if let Some((conn, pair)) = scope_conn(e.dst, e.dst_conn.as_deref()) {
                work.extend(self.out_edges_by_connector(e.dst, &pair).iter().map(|x| x.id));
                work.extend(self.in_edges_by_connector(e.dst, &conn).iter().map(|x| x.id));
            }
        }
        seen.into_iter().collect()
    }

    /// Whether a scope entry has data-dependent range inputs.
    pub fn has_dynamic_inputs(&self, entry: NodeId) -> bool {
        let Some(node) = self.node(entry) else {
            return false;
        };
        if node.in_connectors.iter().any(|c| !c.starts_with("IN_")) {
            return true;
        }
        self.in_edges(entry).iter().any(|e| {
            !e.memlet.is_empty()
                && !e
                    .dst_conn
                    .as_deref()
                    .is_some_and(|c| c.starts_with("IN_"))
        })
    }

    /// First `k` such that neither `IN_k` nor `OUT_k` is taken on `id`.
    pub fn next_connector_index(&self, id: NodeId) -> usize {
        let Some(node) = self.node(id) else { return 0 };
        let mut k = 0;
        while node.in_connectors.contains(&in_conn(k)) || node.out_connectors.contains(&out_conn(k)) {
            k += 1;
        }
        k
    }
}

// ── Program ─────────────────────────────────────────────────────────────────

/// A guarded control transition between two states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub src: StateId,
    pub dst: StateId,
    /// Guard text; `"1"` is unconditional.
    #[serde(default = "always")]
    pub condition: String,
    /// Symbol updates applied when the transition is taken, in order.
    #[serde(default)]
    pub assignments: IndexMap<String, String>,
}

fn always() -> String {
    "1".to_string()
}

impl Transition {
    pub fn is_unconditional(&self) -> bool {
        matches!(self.condition.trim(), "1" | "True" | "true")
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid program JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub states: Vec<State>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default = "first_state")]
    pub start: StateId,
    #[serde(default)]
    pub symbols: IndexMap<String, DType>,
    #[serde(default)]
    pub arrays: IndexMap<String, Data>,
}

fn first_state() -> StateId {
    StateId(0)
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Program {
            name: name.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            start: StateId(0),
            symbols: IndexMap::new(),
            arrays: IndexMap::new(),
        }
    }

    pub fn add_state(&mut self, label: &str) -> StateId {
        let id = StateId(self.states.len() as u32);
        self.states.push(State::new(label));
        id
    }

    pub fn add_transition(
        &mut self,
        src: StateId,
        dst: StateId,
        condition: &str,
        assignments: &[(&str, &str)],
    ) {
        self.transitions.push(Transition {
            src,
            dst,
            condition: condition.to_string(),
            assignments: assignments
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    pub fn add_array(&mut self, name: &str, desc: Data) {
        self.arrays.insert(name.to_string(), desc);
    }

    pub fn add_symbol(&mut self, name: &str, dtype: DType) {
        self.symbols.insert(name.to_string(), dtype);
    }

    pub fn state(&self, id: StateId) -> Option<&State> {
        self.states.get(id.index())
    }

    pub fn state_mut(&mut self, id: StateId) -> Option<&mut State> {
        self.states.get_mut(id.index())
    }

    pub fn state_ids(&self) -> Vec<StateId> {
        (0..self.states.len() as u32).map(StateId).collect()
    }

    pub fn out_transitions(&self, state: StateId) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| t.src == state).collect()
    }

    pub fn in_transitions(&self, state: StateId) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| t.dst == state).collect()
    }

    // ── Serialization ───────────────────────────────────────────────────

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> Result<Program, LoadError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Program, LoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Program::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), LoadError> {
        let text = self.to_json()?;
        std::fs::write(path, text).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// SHA-256 of the canonical compact JSON, as lowercase hex.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        use std::fmt::Write;

        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hex = String::with_capacity(64);
        for b in digest {
            let _ = write!(hex, "{:02x}", b);
        }
        hex
    }
}

// ── Listing ─────────────────────────────────────────────────────────────────

fn kind_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Access { .. } => "access",
        NodeKind::Tasklet { .. } => "tasklet",
        NodeKind::Library { .. } => "library",
        NodeKind::Entry { .. } => "entry",
        NodeKind::Exit { .. } => "exit",
        NodeKind::Nested { .. } => "nested",
    }
}

fn endpoint(node: NodeId, conn: &Option<String>) -> String {
    match conn {
        Some(c) => format!("{node}.{c}"),
        None => node.to_string(),
    }
}

/// Plain-text listing: containers, then every state's nodes and edges, then
/// transitions. Used by `--emit graph`.
impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "program {}", self.name)?;
        for (name, dtype) in &self.symbols {
            writeln!(f, "  symbol {name}: {dtype}")?;
        }
        for (name, desc) in &self.arrays {
            let shape: Vec<String> = desc.shape.iter().map(|e| e.to_string()).collect();
            let transient = if desc.transient { " transient" } else { "" };
            writeln!(f, "  array {name}: {}[{}]{transient}", desc.dtype, shape.join(", "))?;
        }
        for (i, state) in self.states.iter().enumerate() {
            let sid = StateId(i as u32);
            let start = if sid == self.start { " start" } else { "" };
            writeln!(f, "  state {sid} {:?}{start}", state.label)?;
            for node in state.nodes() {
                match node.scope_info() {
                    Some(info) => writeln!(
                        f,
                        "    {} entry {}[{}] = {}",
                        node.id,
                        info.label(),
                        info.params().join(", "),
                        info.range()
                    )?,
                    None => writeln!(f, "    {} {} {}", node.id, kind_name(&node.kind), node.label())?,
                }
            }
            for edge in state.edges() {
                writeln!(
                    f,
                    "    {}: {} -> {}  {}",
                    edge.id,
                    endpoint(edge.src, &edge.src_conn),
                    endpoint(edge.dst, &edge.dst_conn),
                    edge.memlet
                )?;
            }
        }
        for t in &self.transitions {
            write!(f, "  {} -> {}", t.src, t.dst)?;
            if !t.is_unconditional() {
                write!(f, " if {}", t.condition)?;
            }
            for (name, value) in &t.assignments {
                write!(f, " {name} = {value};")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subset::Dim;

    fn map_range(n: i64) -> Range {
        Range::new(vec![Dim::span(Expr::zero(), &Expr::int(n))])
    }

    fn sample() -> (State, NodeId, NodeId, NodeId, NodeId) {
        let mut s = State::new("s0");
        let a = s.add_access("A");
        let (me, mx) = s.add_map("m", &["i"], map_range(10), MapKind::Parallel);
        let t = s.add_tasklet("t", "b = a", &["a"], &["b"]);
        let b = s.add_access("B");
        s.add_edge(a, None, me, Some("IN_0"), Memlet::simple("A", "0:10").unwrap());
        s.add_edge(me, Some("OUT_0"), t, Some("a"), Memlet::simple("A", "i").unwrap());
        s.add_edge(t, Some("b"), mx, Some("IN_0"), Memlet::simple("B", "i").unwrap());
        s.add_edge(mx, Some("OUT_0"), b, None, Memlet::simple("B", "0:10").unwrap());
        (s, a, me, t, b)
    }

    #[test]
    fn add_edge_registers_connectors() {
        let (s, _, me, _, _) = sample();
        let entry = s.node(me).unwrap();
        assert_eq!(entry.in_connectors, vec!["IN_0"]);
        assert_eq!(entry.out_connectors, vec!["OUT_0"]);
        assert_eq!(s.next_connector_index(me), 1);
    }

    #[test]
    fn remove_node_drops_incident_edges_and_keeps_handles() {
        let (mut s, a, me, t, _) = sample();
        s.remove_node(t);
        assert!(s.node(t).is_none());
        assert_eq!(s.edges().count(), 2);
        assert!(s.node(a).is_some());
        let fresh = s.add_access("C");
        assert_ne!(fresh, t);
        assert_eq!(s.exit_node(me).map(|x| s.entry_node(x)), Some(Some(me)));
    }

    #[test]
    fn topological_order_is_deterministic() {
        let (s, a, me, t, b) = sample();
        let order = s.topological_order();
        let mx = s.exit_node(me).unwrap();
        assert_eq!(order, vec![a, me, t, mx, b]);
        assert!(s.is_acyclic());
    }

    #[test]
    fn memlet_path_crosses_scope_connectors() {
        let (s, _, me, t, _) = sample();
        let inner = s.edges_between(me, t)[0].id;
        let path = s.memlet_path(inner);
        assert_eq!(path.len(), 2);
        let inner_out = s.out_edges(t)[0].id;
        assert_eq!(s.memlet_path(inner_out).len(), 2);
    }

    #[test]
    fn memlet_tree_reaches_back_through_exits() {
        let (s, _, _, t, b) = sample();
        let outer = s.in_edges(b)[0].id;
        let inner = s.out_edges(t)[0].id;
        assert_eq!(s.memlet_tree(outer), vec![inner, outer]);
        assert_eq!(s.memlet_tree(inner), vec![inner, outer]);
    }

    #[test]
    fn dynamic_inputs_detected() {
        let (mut s, _, me, _, _) = sample();
        assert!(!s.has_dynamic_inputs(me));
        let n = s.add_access("n");
        s.add_edge(n, None, me, Some("n"), Memlet::simple("n", "0").unwrap());
        assert!(s.has_dynamic_inputs(me));
    }

    #[test]
    fn json_round_trip_preserves_program() {
        let (s, ..) = sample();
        let mut p = Program::new("p");
        p.states.push(s);
        p.add_array("A", Data::array(DType::Float64, vec![Expr::int(10)]));
        p.add_array("B", Data::array(DType::Float64, vec![Expr::int(10)]));
        let text = p.to_json().unwrap();
        let back = Program::from_json(&text).unwrap();
        assert_eq!(back, p);
        assert_eq!(back.fingerprint(), p.fingerprint());
    }

    #[test]
    fn listing_names_nodes_edges_and_transitions() {
        let (s, ..) = sample();
        let mut p = Program::new("p");
        p.add_array("A", Data::array(DType::Float64, vec![Expr::int(10)]));
        p.states.push(s);
        let s1 = p.add_state("s1");
        p.add_transition(StateId(0), s1, "k < 3", &[("k", "k + 1")]);
        let text = p.to_string();
        assert!(text.starts_with("program p\n  array A: float64[10]\n"));
        assert!(text.contains("    n1 entry m[i] = 0:10\n"));
        assert!(text.contains("    n3 tasklet t\n"));
        assert!(text.contains("    e0: n0 -> n1.IN_0  A[0:10]\n"));
        assert!(text.ends_with("  s0 -> s1 if k < 3 k = k + 1;\n"));
    }
}
