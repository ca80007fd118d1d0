// resolve.rs — Name resolution from script text to a schedule tree
//
// Walks the parsed script, resolves every container and symbol reference
// against the declarations in scope, and builds the schedule tree the script
// describes. Declaration sites are recomputed from uses rather than taken
// from where the script happens to write them.
//
// Preconditions: `script` is a well-formed AST from the parser.
// Postconditions: returns the tree plus all accumulated diagnostics; the tree
//                 has declarations placed and passes `verify_tree`.
// Failure modes: undeclared containers (E0002), undeclared symbols (E0003),
//                duplicate declarations (E0004), malformed scope headers
//                (E0005) and unknown element types (E0006) produce
//                `Diagnostic` entries. Resolution continues past errors.
// Side effects: none.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::debug;

use crate::ast::*;
use crate::data::{DType, Data, DataKind};
use crate::diag::{codes, has_errors, Diagnostic, Location};
use crate::id::TreeNodeId;
use crate::memlet::Memlet;
use crate::schedule::{place_declarations, ScheduleTree, TreeKind};
use crate::symbolic::Expr;
use crate::symbols::{Frame, FrameOrigin, SymbolScope};

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ResolveResult {
    pub tree: ScheduleTree,
    pub diagnostics: Vec<Diagnostic>,
}

impl ResolveResult {
    pub fn has_errors(&self) -> bool {
        has_errors(&self.diagnostics)
    }
}

// ── Public entry points ─────────────────────────────────────────────────────

/// Resolve all names in a parsed script.
pub fn resolve(script: &Script) -> ResolveResult {
    let mut ctx = ResolveCtx::new(&script.name.name);

    // Pass 1: symbols, parameters and every ndarray/scalar declaration
    ctx.collect_globals(script);
    ctx.collect_decls(&script.body);

    // Pass 2: build the tree
    let root = ctx.tree.root();
    let mut program_frame = Frame::new(FrameOrigin::Program(script.name.name.clone()));
    for (name, dtype) in &ctx.tree.symbols {
        program_frame = program_frame.bind(name, *dtype, None);
    }
    let version = ctx.scope.push(program_frame);
    ctx.resolve_block(root, &script.body);
    if let Err(e) = ctx.scope.pop(version) {
        ctx.diagnostics
            .push(Diagnostic::error(Location::Program, e.to_string()));
    }

    place_declarations(&mut ctx.tree);
    ctx.report_unused();

    debug!(
        program = %ctx.tree.name,
        nodes = ctx.tree.preorder().len(),
        diagnostics = ctx.diagnostics.len(),
        "resolved script"
    );
    ResolveResult {
        tree: ctx.tree,
        diagnostics: ctx.diagnostics,
    }
}

/// Parse and resolve script text. Syntax errors are reported as E0001 and
/// leave an empty tree.
pub fn read_script(source: &str) -> ResolveResult {
    let parsed = crate::parser::parse(source);
    let syntax: Vec<Diagnostic> = parsed
        .errors
        .iter()
        .map(|e| {
            Diagnostic::error(Location::Source(*e.span()), e.to_string())
                .with_code(codes::E0001)
        })
        .collect();
    match parsed.script {
        Some(script) if syntax.is_empty() => resolve(&script),
        _ => ResolveResult {
            tree: ScheduleTree::new(""),
            diagnostics: syntax,
        },
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct ResolveCtx {
    tree: ScheduleTree,
    diagnostics: Vec<Diagnostic>,
    scope: SymbolScope,
    /// Names bound by `assign` and `dscopy` rather than declared.
    assigned: HashSet<String>,
    /// Where each container or symbol was declared, for duplicate reports.
    decl_spans: HashMap<String, Span>,
}

impl ResolveCtx {
    fn new(name: &str) -> Self {
        ResolveCtx {
            tree: ScheduleTree::new(name),
            diagnostics: Vec::new(),
            scope: SymbolScope::new(),
            assigned: HashSet::new(),
            decl_spans: HashMap::new(),
        }
    }

    fn report(&mut self, diag: Diagnostic) {
        self.diagnostics.push(diag);
    }

    fn dtype(&mut self, ident: &Ident) -> Option<DType> {
        match ident.name.parse::<DType>() {
            Ok(t) => Some(t),
            Err(message) => {
                self.report(Diagnostic::error(Location::Source(ident.span), message)
                        .with_code(codes::E0006)
                        .with_hint("expected one of bool, int32, int64, float32, float64"),
                );
                None
            }
        }
    }

    /// Record a declaration of `name`; false (with E0004) if already taken.
    fn declare(&mut self, name: &Ident) -> bool {
        if let Some(first) = self.decl_spans.get(&name.name).copied() {
            self.report(Diagnostic::error(
                    Location::Source(name.span),
                    format!("duplicate declaration of '{}'", name.name),
                )
                .with_code(codes::E0004)
                .with_related(Location::Source(first), "first declared here"),
            );
            return false;
        }
        self.decl_spans.insert(name.name.clone(), name.span);
        true
    }

    // ── Pass 1: collect declarations ────────────────────────────────────

    fn collect_globals(&mut self, script: &Script) {
        for sym in &script.symbols {
            if !self.declare(&sym.name) {
                continue;
            }
            if let Some(dtype) = self.dtype(&sym.dtype) {
                self.tree.symbols.insert(sym.name.name.clone(), dtype);
            }
        }
        for param in &script.params {
            if !self.declare(&param.name) {
                continue;
            }
            let Some(dtype) = self.dtype(&param.dtype) else {
                continue;
            };
            let desc = match &param.shape {
                Some(shape) => Data::array(dtype, shape.clone()),
                None => Data::scalar(dtype),
            };
            self.tree.containers.insert(param.name.name.clone(), desc);
        }
    }

    fn collect_decls(&mut self, body: &[Stmt]) {
        for stmt in body {
            match &stmt.kind {
                StmtKind::Decl { name, dtype, shape } => {
                    if !self.declare(name) {
                        continue;
                    }
                    let Some(dtype) = self.dtype(dtype) else {
                        continue;
                    };
                    let desc = match shape {
                        Some(shape) => Data::array(dtype, shape.clone()),
                        None => Data::scalar(dtype),
                    };
                    self.tree
                        .containers
                        .insert(name.name.clone(), desc.transient());
                }
                StmtKind::Scope { body, .. } => self.collect_decls(body),
                _ => {}
            }
        }
    }

    // ── Pass 2: build the tree ──────────────────────────────────────────

    fn resolve_block(&mut self, parent: TreeNodeId, body: &[Stmt]) {
        let mut after_branch = false;
        for stmt in body {
            let is_branch = matches!(
                &stmt.kind,
                StmtKind::Scope {
                    header: ScopeHeader::If(_) | ScopeHeader::Elif(_),
                    ..
                }
            );
            match &stmt.kind {
                StmtKind::Decl { shape, .. } => {
                    if let Some(shape) = shape {
                        for e in shape {
                            self.check_expr(e, stmt.span);
                        }
                    }
                }
                StmtKind::Pass => {}
                StmtKind::Scope { header, body } => {
                    let continues_branch = matches!(header, ScopeHeader::Elif(_) | ScopeHeader::Else);
                    if continues_branch && !after_branch {
                        self.report(Diagnostic::error(
                                Location::Source(stmt.span),
                                "'elif' or 'else' without a preceding 'if'",
                            )
                            .with_code(codes::E0005),
                        );
                    }
                    self.resolve_scope(parent, header, body, stmt.span);
                }
                other => {
                    if let Some(kind) = self.resolve_leaf(other, stmt.span) {
                        self.tree.add(parent, kind);
                    }
                }
            }
            after_branch = is_branch;
        }
    }

    fn resolve_scope(&mut self, parent: TreeNodeId, header: &ScopeHeader, body: &[Stmt], span: Span) {
        let (kind, params) = match header {
            ScopeHeader::Map { params, range } | ScopeHeader::Pipeline { params, range } => {
                if params.len() != range.rank() {
                    self.report(Diagnostic::error(
                            Location::Source(span),
                            format!(
                                "{} parameter(s) for a {}-dimensional range",
                                params.len(),
                                range.rank()
                            ),
                        )
                        .with_code(codes::E0005),
                    );
                }
                self.check_symbols(range.free_symbols(), span);
                let names: Vec<String> = params.iter().map(|p| p.name.clone()).collect();
                let kind = if matches!(header, ScopeHeader::Map { .. }) {
                    TreeKind::Map {
                        params: names.clone(),
                        range: range.clone(),
                    }
                } else {
                    TreeKind::Pipeline {
                        params: names.clone(),
                        range: range.clone(),
                    }
                };
                (kind, names)
            }
            ScopeHeader::Consume {
                pe_index,
                stream,
                num_pes,
                condition,
            } => {
                self.check_container(stream);
                self.check_expr(num_pes, span);
                let kind = TreeKind::Consume {
                    pe_index: pe_index.name.clone(),
                    num_pes: num_pes.clone(),
                    condition: condition.clone(),
                    stream: stream.name.clone(),
                };
                (kind, vec![pe_index.name.clone()])
            }
            ScopeHeader::Loop {
                var,
                init,
                condition,
                update,
            } => {
                let kind = TreeKind::For {
                    var: var.name.clone(),
                    init: init.clone(),
                    condition: condition.clone(),
                    update: update.clone(),
                };
                (kind, vec![var.name.clone()])
            }
            ScopeHeader::While(c) => (TreeKind::While { condition: c.clone() }, vec![]),
            ScopeHeader::DoWhile(c) => (TreeKind::DoWhile { condition: c.clone() }, vec![]),
            ScopeHeader::If(c) => (TreeKind::If { condition: c.clone() }, vec![]),
            ScopeHeader::Elif(c) => (TreeKind::Elif { condition: c.clone() }, vec![]),
            ScopeHeader::Else => (TreeKind::Else, vec![]),
            ScopeHeader::StateIf(c) => (TreeKind::StateIf { condition: c.clone() }, vec![]),
            ScopeHeader::GBlock => (TreeKind::GeneralBlock, vec![]),
        };

        let id = self.tree.add(parent, kind);
        if params.is_empty() {
            self.resolve_block(id, body);
            return;
        }
        let mut frame = Frame::new(FrameOrigin::Tree(id));
        for p in &params {
            frame = frame.bind(p, DType::Int64, None);
        }
        let version = self.scope.push(frame);
        self.resolve_block(id, body);
        if let Err(e) = self.scope.pop(version) {
            self.diagnostics
                .push(Diagnostic::error(Location::Tree(id), e.to_string()));
        }
    }

    fn resolve_leaf(&mut self, stmt: &StmtKind, span: Span) -> Option<TreeKind> {
        let kind = match stmt {
            StmtKind::Label(name) => TreeKind::Label {
                name: name.name.clone(),
            },
            StmtKind::Goto(target) => TreeKind::Goto {
                target: target.as_ref().map(|t| t.name.clone()),
            },
            StmtKind::Assign { name, value } => {
                if !self.scope.contains(&name.name) {
                    self.assigned.insert(name.name.clone());
                }
                TreeKind::Assign {
                    name: name.name.clone(),
                    value: value.clone(),
                }
            }
            StmtKind::Break => TreeKind::Break,
            StmtKind::Continue => TreeKind::Continue,
            StmtKind::Tasklet { code, connectors } => {
                let (inputs, outputs) = self.connectors(connectors);
                TreeKind::Tasklet {
                    code: code.clone(),
                    inputs,
                    outputs,
                }
            }
            StmtKind::Library {
                op,
                properties,
                connectors,
            } => {
                let (inputs, outputs) = self.connectors(connectors);
                TreeKind::Library {
                    op: op.clone(),
                    properties: properties
                        .iter()
                        .map(|(k, v)| (k.name.clone(), v.clone()))
                        .collect(),
                    inputs,
                    outputs,
                }
            }
            StmtKind::Copy { src, dst, wcr } => {
                let mut memlet = self.memlet(src);
                self.check_container(&dst.data);
                if let Some(s) = &dst.subset {
                    self.check_symbols(s.free_symbols(), dst.span);
                }
                memlet.other_subset = dst.subset.clone();
                memlet.wcr = wcr
                    .clone()
                    .or_else(|| dst.wcr.as_ref().map(|(_, op)| op.clone()));
                TreeKind::Copy {
                    target: dst.data.name.clone(),
                    memlet,
                }
            }
            StmtKind::DynScopeCopy { src, dst } => {
                let memlet = self.memlet(src);
                if !self.scope.contains(&dst.name) {
                    self.assigned.insert(dst.name.clone());
                }
                TreeKind::DynScopeCopy {
                    target: dst.name.clone(),
                    memlet,
                }
            }
            StmtKind::View {
                name,
                source,
                shape,
                nested,
            } => {
                let memlet = self.memlet(source);
                for e in shape {
                    self.check_expr(e, span);
                }
                if let Some(src) = self.tree.containers.get(&source.data.name) {
                    let desc = Data::array(src.dtype, shape.clone())
                        .transient()
                        .with_kind(DataKind::View);
                    self.bind_alias(name, desc);
                }
                if *nested {
                    TreeKind::NestedView {
                        target: name.name.clone(),
                        memlet,
                        shape: shape.clone(),
                    }
                } else {
                    TreeKind::View {
                        target: name.name.clone(),
                        memlet,
                        shape: shape.clone(),
                    }
                }
            }
            StmtKind::RefSet { name, source } => {
                let memlet = self.memlet(source);
                if let Some(src) = self.tree.containers.get(&source.data.name) {
                    let desc = src.clone().transient().with_kind(DataKind::Reference);
                    self.bind_alias(name, desc);
                }
                TreeKind::RefSet {
                    target: name.name.clone(),
                    memlet,
                }
            }
            StmtKind::Decl { .. } | StmtKind::Pass | StmtKind::Scope { .. } => return None,
        };
        Some(kind)
    }

    /// A view or reference may be rebound any number of times; only a clash
    /// with an ndarray/scalar declaration is a duplicate.
    fn bind_alias(&mut self, name: &Ident, desc: Data) {
        match self.tree.containers.get(&name.name) {
            Some(existing) if matches!(existing.kind, DataKind::View | DataKind::Reference) => {}
            Some(existing) if !existing.transient => {}
            Some(_) => {
                self.declare(name);
            }
            None => {
                self.decl_spans.insert(name.name.clone(), name.span);
                self.tree.containers.insert(name.name.clone(), desc);
            }
        }
    }

    fn connectors(
        &mut self,
        connectors: &[Connector],
    ) -> (IndexMap<String, Memlet>, IndexMap<String, Memlet>) {
        let mut inputs = IndexMap::new();
        let mut outputs = IndexMap::new();
        for c in connectors {
            let memlet = self.memlet(&c.memlet);
            let side = match c.direction {
                Direction::In => &mut inputs,
                Direction::Out => &mut outputs,
            };
            if side.insert(c.name.name.clone(), memlet).is_some() {
                self.report(Diagnostic::error(
                        Location::Source(c.name.span),
                        format!("duplicate connector '{}'", c.name.name),
                    )
                    .with_code(codes::E0004),
                );
            }
        }
        (inputs, outputs)
    }

    fn memlet(&mut self, r: &MemletRef) -> Memlet {
        self.check_container(&r.data);
        if let Some(s) = &r.subset {
            self.check_symbols(s.free_symbols(), r.span);
        }
        Memlet {
            data: Some(r.data.name.clone()),
            subset: r.subset.clone(),
            wcr: r.wcr.as_ref().map(|(_, op)| op.clone()),
            ..Memlet::default()
        }
    }

    // ── Checks ──────────────────────────────────────────────────────────

    fn check_container(&mut self, name: &Ident) {
        if self.tree.containers.contains_key(&name.name) {
            return;
        }
        self.report(Diagnostic::error(
                Location::Source(name.span),
                format!("undeclared container '{}'", name.name),
            )
            .with_code(codes::E0002)
            .with_hint("add it as a parameter or declare it with ndarray(...) or scalar(...)"),
        );
    }

    fn check_expr(&mut self, expr: &Expr, span: Span) {
        self.check_symbols(expr.free_symbols(), span);
    }

    fn check_symbols(&mut self, names: impl IntoIterator<Item = String>, span: Span) {
        for name in names {
            if self.scope.contains(&name) || self.assigned.contains(&name) {
                continue;
            }
            self.report(Diagnostic::error(
                    Location::Source(span),
                    format!("undeclared symbol '{name}'"),
                )
                .with_code(codes::E0003)
                .with_hint(format!("declare it with {name} = symbol(\"{name}\", int64)")),
            );
        }
    }

    fn report_unused(&mut self) {
        let unused: Vec<String> = self
            .tree
            .containers
            .iter()
            .filter(|(name, d)| d.transient && !self.tree.is_data_used(name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in unused {
            let at = self
                .decl_spans
                .get(&name)
                .map_or(Location::Program, |s| Location::Source(*s));
            self.diagnostics.push(
                Diagnostic::warning(at, format!("container '{name}' is declared but never used"))
                    .with_code(codes::W0001),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::emit_script;
    use crate::diag::DiagCode;
    use crate::schedule::verify_tree;

    const SCRIPT: &str = "\
N = symbol(\"N\", int64)

@program
def prog(A: float64[N], x: float64):
    T = ndarray([N], float64)
    for i in map[0:N]:
        with tasklet(\"t = a + x\"):
            a << A[i]
            x << x[0]
            t >> T[i]
    for k in loop(\"0\", \"k < N\", \"k + 1\"):
        s = scalar(float64)
        with tasklet(\"s = t\"):
            t << T[k]
            s >> s[0]
        with tasklet(\"a = s\"):
            s << s[0]
            a >> A(1, sum)[k]
    copy(src=T[0:N], dst=A[0:N], wcr=\"sum\")
    gblock:
        label s0:
        stateif \"x > 0\":
            goto exit
        goto s0
";

    fn codes_of(result: &ResolveResult) -> Vec<DiagCode> {
        result.diagnostics.iter().filter_map(|d| d.code).collect()
    }

    #[test]
    fn canonical_script_round_trips() {
        let result = read_script(SCRIPT);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert!(verify_tree(&result.tree).t2_declaration_placement);
        assert_eq!(emit_script(&result.tree), SCRIPT);
    }

    #[test]
    fn declarations_follow_uses() {
        let result = read_script(SCRIPT);
        let tree = &result.tree;
        assert_eq!(tree.declaration_site("T"), Some(tree.root()));
        let for_scope = tree.children(tree.root())[1];
        assert_eq!(tree.declaration_site("s"), Some(for_scope));
        assert_eq!(tree.args(), vec!["A", "x"]);
    }

    #[test]
    fn script_declaration_site_is_recomputed() {
        let src = "\
@program
def p(A: float64[10]):
    T = ndarray([10], float64)
    for i in map[0:10]:
        with tasklet(\"t = a\"):
            a << A[i]
            t >> T[i]
";
        let result = read_script(src);
        assert!(!result.has_errors());
        let map = result.tree.children(result.tree.root())[0];
        let leaf = result.tree.children(map)[0];
        assert_eq!(result.tree.declaration_site("T"), Some(leaf));
    }

    #[test]
    fn undeclared_container() {
        let result = read_script("@program\ndef p():\n    copy(src=A[0], dst=B[0])\n");
        assert_eq!(codes_of(&result), vec![codes::E0002, codes::E0002]);
    }

    #[test]
    fn undeclared_symbol_in_map_range() {
        let result = read_script(
            "@program\ndef p(A: float64[10]):\n    for i in map[0:M]:\n        with tasklet(\"\"):\n            a << A[i]\n",
        );
        assert_eq!(codes_of(&result), vec![codes::E0003]);
    }

    #[test]
    fn map_parameter_is_scoped() {
        let result = read_script(
            "@program\ndef p(A: float64[10]):\n    for i in map[0:10]:\n        pass\n    copy(src=A[i], dst=A[0])\n",
        );
        assert_eq!(codes_of(&result), vec![codes::E0003]);
    }

    #[test]
    fn duplicate_declaration() {
        let result = read_script(
            "@program\ndef p(A: float64[10]):\n    A = ndarray([10], float64)\n",
        );
        assert!(codes_of(&result).contains(&codes::E0004));
    }

    #[test]
    fn malformed_headers() {
        let result = read_script(
            "@program\ndef p():\n    for i, j in map[0:10]:\n        pass\n    else:\n        pass\n",
        );
        assert_eq!(codes_of(&result), vec![codes::E0005, codes::E0005]);
    }

    #[test]
    fn unknown_element_type() {
        let result = read_script("@program\ndef p(A: complex[10]):\n    pass\n");
        assert_eq!(codes_of(&result), vec![codes::E0006]);
    }

    #[test]
    fn syntax_error_reported_as_e0001() {
        let result = read_script("@program\ndef p(:\n");
        assert!(result.has_errors());
        assert!(codes_of(&result).iter().all(|c| *c == codes::E0001));
    }

    #[test]
    fn unused_declaration_warns() {
        let result = read_script("@program\ndef p():\n    T = ndarray([4], float64)\n");
        assert!(!result.has_errors());
        assert_eq!(codes_of(&result), vec![codes::W0001]);
    }
}
