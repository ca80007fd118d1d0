// registry.rs — Library operator metadata registry
//
// Library nodes name an operator; the registry records each operator's
// connector signature and property defaults, and carries the operator-
// specific shape checks applied during validation. Built-in operators are
// always available; further operators can be loaded from JSON.
//
// Preconditions: none.
// Postconditions: operator names are unique within a registry.
// Failure modes: `load_json` / `add_json` return `RegistryError`.
// Side effects: `load_json` reads the file system.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diag::{codes, Diagnostic, Location};
use crate::graph::{Program, State};
use crate::id::{NodeId, StateId};
use crate::subset::Range;
use crate::symbolic::Expr;

// ── Data types ──────────────────────────────────────────────────────────────

/// Signature of one library operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryMeta {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Recognised properties and their default values.
    #[serde(default)]
    pub properties: IndexMap<String, String>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid operator JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate operator '{name}'")]
    DuplicateOperator { name: String },
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Registry {
    operators: IndexMap<String, LibraryMeta>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Registry {
            operators: IndexMap::new(),
        }
    }

    /// The built-in operators: `AHHT`, `Gemm` and `Reduce`.
    pub fn builtin() -> Self {
        let mut reg = Registry::new();
        let builtins = [
            LibraryMeta {
                name: "AHHT".into(),
                inputs: names(&["_a_row", "_a_col", "_h1", "_h2"]),
                outputs: names(&["_out"]),
                properties: IndexMap::new(),
            },
            LibraryMeta {
                name: "Gemm".into(),
                inputs: names(&["_a", "_b"]),
                outputs: names(&["_c"]),
                properties: [("alpha", "1"), ("beta", "0"), ("trans_a", "false"), ("trans_b", "false")]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            LibraryMeta {
                name: "Reduce".into(),
                inputs: names(&["_in"]),
                outputs: names(&["_out"]),
                properties: [("wcr", "sum"), ("axes", "")]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        ];
        for meta in builtins {
            reg.operators.insert(meta.name.clone(), meta);
        }
        reg
    }

    pub fn insert(&mut self, meta: LibraryMeta) -> Result<(), RegistryError> {
        if self.operators.contains_key(&meta.name) {
            return Err(RegistryError::DuplicateOperator { name: meta.name });
        }
        self.operators.insert(meta.name.clone(), meta);
        Ok(())
    }

    /// Add every operator of a JSON array of `LibraryMeta`. Returns the
    /// number of operators added.
    pub fn add_json(&mut self, text: &str) -> Result<usize, RegistryError> {
        let metas: Vec<LibraryMeta> = serde_json::from_str(text)?;
        let count = metas.len();
        for meta in metas {
            self.insert(meta)?;
        }
        Ok(count)
    }

    pub fn load_json(&mut self, path: &Path) -> Result<usize, RegistryError> {
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.add_json(&text)
    }

    pub fn lookup(&self, name: &str) -> Option<&LibraryMeta> {
        self.operators.get(name)
    }

    pub fn operators(&self) -> impl Iterator<Item = &LibraryMeta> {
        self.operators.values()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

// ── Operator checks ─────────────────────────────────────────────────────────

/// Connector signature check for the library node `node`: every declared
/// connector of the operator is present, nothing else is, and every property
/// is recognised.
pub fn check_signature(
    meta: &LibraryMeta,
    state: &State,
    sid: StateId,
    node: NodeId,
    properties: &IndexMap<String, String>,
) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    let Some(n) = state.node(node) else {
        return diags;
    };
    let at = Location::node(sid, node);
    let sides = [
        ("input", &meta.inputs, &n.in_connectors),
        ("output", &meta.outputs, &n.out_connectors),
    ];
    for (side, expected, actual) in sides {
        for conn in expected.iter().filter(|c| !actual.contains(*c)) {
            diags.push(
                Diagnostic::error(
                    at,
                    format!("{} is missing {side} connector '{conn}'", meta.name),
                )
                .with_code(codes::E0106),
            );
        }
        for conn in actual.iter().filter(|c| !expected.contains(*c)) {
            diags.push(
                Diagnostic::error(
                    at,
                    format!("{} has no {side} connector '{conn}'", meta.name),
                )
                .with_code(codes::E0106)
                .with_hint(format!("expected {side}s: {}", expected.join(", "))),
            );
        }
    }
    for key in properties.keys().filter(|k| !meta.properties.contains_key(*k)) {
        diags.push(
            Diagnostic::error(at, format!("{} has no property '{key}'", meta.name))
                .with_code(codes::E0106),
        );
    }
    diags
}

/// Operator-specific shape checks.
pub fn check_shapes(
    op: &str,
    program: &Program,
    state: &State,
    sid: StateId,
    node: NodeId,
) -> Vec<Diagnostic> {
    match op {
        "AHHT" => check_ahht(program, state, sid, node),
        _ => Vec::new(),
    }
}

/// Squeezed per-dimension sizes of the data arriving on `conn`.
fn connector_sizes(program: &Program, state: &State, node: NodeId, conn: &str) -> Option<Vec<Expr>> {
    let edge = state.in_edges_by_connector(node, conn).into_iter().next()?;
    let mut range = match &edge.memlet.subset {
        Some(s) => s.clone(),
        None => {
            let desc = program.arrays.get(edge.memlet.data_name()?)?;
            Range::from_shape(&desc.shape)
        }
    };
    range.squeeze();
    Some(range.size())
}

/// `A ⊙ (H × Hᵀ)` on a COO adjacency: the row and column index arrays share
/// `nnz`, and both factors share their column count.
fn check_ahht(program: &Program, state: &State, sid: StateId, node: NodeId) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    let at = Location::node(sid, node);
    let size = |conn: &str| connector_sizes(program, state, node, conn);

    if let (Some(rows), Some(cols)) = (size("_a_row"), size("_a_col")) {
        if rows != cols {
            diags.push(
                Diagnostic::error(
                    at,
                    format!(
                        "AHHT index arrays disagree on nnz: _a_row is {}, _a_col is {}",
                        join(&rows),
                        join(&cols)
                    ),
                )
                .with_code(codes::E0201),
            );
        }
    }
    if let (Some(h1), Some(h2)) = (size("_h1"), size("_h2")) {
        if h1.last() != h2.last() {
            diags.push(
                Diagnostic::error(
                    at,
                    format!(
                        "AHHT factors disagree on column count: _h1 is [{}], _h2 is [{}]",
                        join(&h1),
                        join(&h2)
                    ),
                )
                .with_code(codes::E0201),
            );
        }
    }
    diags
}

fn join(sizes: &[Expr]) -> String {
    sizes
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DType, Data};
    use crate::memlet::Memlet;

    fn ahht_program(col_nnz: i64, h2_cols: i64) -> (Program, StateId, NodeId) {
        let mut p = Program::new("ahht");
        p.add_array("rows", Data::array(DType::Int32, vec![Expr::int(20)]));
        p.add_array("cols", Data::array(DType::Int32, vec![Expr::int(col_nnz)]));
        p.add_array("H", Data::array(DType::Float64, vec![Expr::int(8), Expr::int(4)]));
        p.add_array("G", Data::array(DType::Float64, vec![Expr::int(8), Expr::int(h2_cols)]));
        p.add_array("out", Data::array(DType::Float64, vec![Expr::int(20)]));
        let sid = p.add_state("s0");
        let s = p.state_mut(sid).unwrap();
        let lib = s.add_library(
            "ahht",
            "AHHT",
            IndexMap::new(),
            &["_a_row", "_a_col", "_h1", "_h2"],
            &["_out"],
        );
        for (data, conn) in [("rows", "_a_row"), ("cols", "_a_col"), ("H", "_h1"), ("G", "_h2")] {
            let a = s.add_access(data);
            s.add_edge(a, None, lib, Some(conn), Memlet { data: Some(data.into()), ..Memlet::default() });
        }
        let out = s.add_access("out");
        s.add_edge(lib, Some("_out"), out, None, Memlet::simple("out", "0:20").unwrap());
        (p, sid, lib)
    }

    #[test]
    fn builtins_are_present() {
        let reg = Registry::builtin();
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.lookup("Gemm").unwrap().properties["alpha"], "1");
        assert!(reg.lookup("Conv").is_none());
    }

    #[test]
    fn json_operators_load_and_reject_duplicates() {
        let mut reg = Registry::new();
        let text = r#"[{"name": "Axpy", "inputs": ["_x", "_y"], "outputs": ["_out"], "properties": {"a": "1"}}]"#;
        assert_eq!(reg.add_json(text).unwrap(), 1);
        assert_eq!(reg.lookup("Axpy").unwrap().inputs, vec!["_x", "_y"]);
        assert!(matches!(
            reg.add_json(text),
            Err(RegistryError::DuplicateOperator { name }) if name == "Axpy"
        ));
    }

    #[test]
    fn signature_reports_missing_and_extra_connectors() {
        let mut p = Program::new("gemm");
        let sid = p.add_state("s0");
        let s = p.state_mut(sid).unwrap();
        let props: IndexMap<String, String> = [("gamma".to_string(), "2".to_string())].into_iter().collect();
        let lib = s.add_library("mm", "Gemm", props.clone(), &["_a", "_x"], &["_c"]);
        let reg = Registry::builtin();
        let diags = check_signature(reg.lookup("Gemm").unwrap(), s, sid, lib, &props);
        let messages: Vec<String> = diags.iter().map(|d| d.message.clone()).collect();
        assert_eq!(
            messages,
            vec![
                "Gemm is missing input connector '_b'",
                "Gemm has no input connector '_x'",
                "Gemm has no property 'gamma'",
            ]
        );
        assert!(diags.iter().all(|d| d.code == Some(codes::E0106)));
    }

    #[test]
    fn ahht_shapes_agree() {
        let (p, sid, lib) = ahht_program(20, 4);
        assert!(check_shapes("AHHT", &p, p.state(sid).unwrap(), sid, lib).is_empty());
    }

    #[test]
    fn ahht_nnz_and_column_mismatch() {
        let (p, sid, lib) = ahht_program(19, 5);
        let diags = check_shapes("AHHT", &p, p.state(sid).unwrap(), sid, lib);
        assert_eq!(diags.len(), 2);
        assert!(diags[0].message.contains("nnz"));
        assert!(diags[1].message.contains("column count"));
        assert!(diags.iter().all(|d| d.code == Some(codes::E0201)));
    }
}
