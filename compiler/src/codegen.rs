// codegen.rs — Structured re-emission of schedule trees as scripts
//
// Writes a schedule tree back out in the indentation-structured,
// array-oriented notation read by `parser::parse`: symbol declarations, one
// `@program` function whose parameters are the non-transient containers,
// container declarations at the node that owns them, and one statement or
// block per tree node. Re-parsing and resolving the output yields a tree
// with the same canonical rendering.
//
// Preconditions: declarations were placed (`schedule::place_declarations`).
// Postconditions: the script parses without errors; 4-space indentation.
// Failure modes: none.
// Side effects: none.

use std::fmt::Write as _;

use indexmap::IndexMap;

use crate::data::{Data, DataKind};
use crate::id::TreeNodeId;
use crate::lexer::quote;
use crate::memlet::Memlet;
use crate::schedule::{ScheduleTree, TreeKind};
use crate::symbolic::Expr;
use crate::visit::Visitor;

const INDENT: &str = "    ";

// ── Public entry point ──────────────────────────────────────────────────────

pub fn emit_script(tree: &ScheduleTree) -> String {
    let mut emitter = ScriptEmitter {
        out: String::new(),
        depth: 0,
    };
    emitter.emit_header(tree);
    emitter.visit(tree, tree.root());
    emitter.out
}

// ── Emitter ─────────────────────────────────────────────────────────────────

struct ScriptEmitter {
    out: String,
    depth: usize,
}

impl ScriptEmitter {
    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn emit_header(&mut self, tree: &ScheduleTree) {
        for (name, dtype) in &tree.symbols {
            let _ = writeln!(self.out, "{name} = symbol({}, {dtype})", quote(name));
        }
        if !tree.symbols.is_empty() {
            self.out.push('\n');
        }
        let params: Vec<String> = tree
            .containers
            .iter()
            .filter(|(_, d)| !d.transient)
            .map(|(name, d)| param(name, d))
            .collect();
        let _ = writeln!(self.out, "@program\ndef {}({}):", tree.name, params.join(", "));
    }

    fn declarations(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        let Some(node) = tree.node(id) else { return };
        for (name, desc) in &node.declared {
            self.line(&declaration(name, desc));
        }
    }

    /// Header line, own declarations and children one level deeper.
    fn block(&mut self, tree: &ScheduleTree, id: TreeNodeId, header: &str) {
        self.line(header);
        self.depth += 1;
        self.body(tree, id);
        self.depth -= 1;
    }

    fn body(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        let declared = tree.node(id).is_some_and(|n| !n.declared.is_empty());
        if !declared && tree.children(id).is_empty() {
            self.line("pass");
            return;
        }
        self.declarations(tree, id);
        self.visit_children(tree, id);
    }

    /// A leaf statement, preceded by the declarations it owns.
    fn leaf(&mut self, tree: &ScheduleTree, id: TreeNodeId, text: &str) {
        self.declarations(tree, id);
        self.line(text);
    }

    fn code_block(
        &mut self,
        tree: &ScheduleTree,
        id: TreeNodeId,
        header: &str,
        inputs: &IndexMap<String, Memlet>,
        outputs: &IndexMap<String, Memlet>,
    ) {
        self.declarations(tree, id);
        self.line(header);
        self.depth += 1;
        if inputs.is_empty() && outputs.is_empty() {
            self.line("pass");
        }
        for (conn, m) in inputs {
            self.line(&format!("{conn} << {}", memlet_ref(m)));
        }
        for (conn, m) in outputs {
            self.line(&format!("{conn} >> {}", memlet_ref(m)));
        }
        self.depth -= 1;
    }

    fn header_of<'t>(tree: &'t ScheduleTree, id: TreeNodeId) -> Option<&'t TreeKind> {
        tree.kind(id)
    }
}

impl Visitor for ScriptEmitter {
    fn visit_root(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.depth = 1;
        self.body(tree, id);
        self.depth = 0;
    }

    fn visit_general_block(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.block(tree, id, "gblock:");
    }

    fn visit_for(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::For {
            var,
            init,
            condition,
            update,
        }) = Self::header_of(tree, id)
        {
            let header = format!(
                "for {var} in loop({}, {}, {}):",
                quote(init),
                quote(condition),
                quote(update)
            );
            self.block(tree, id, &header);
        }
    }

    fn visit_while(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::While { condition }) = Self::header_of(tree, id) {
            self.block(tree, id, &format!("while {}:", quote(condition)));
        }
    }

    fn visit_do_while(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::DoWhile { condition }) = Self::header_of(tree, id) {
            self.block(tree, id, &format!("do while {}:", quote(condition)));
        }
    }

    fn visit_if(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::If { condition }) = Self::header_of(tree, id) {
            self.block(tree, id, &format!("if {}:", quote(condition)));
        }
    }

    fn visit_elif(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::Elif { condition }) = Self::header_of(tree, id) {
            self.block(tree, id, &format!("elif {}:", quote(condition)));
        }
    }

    fn visit_else(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.block(tree, id, "else:");
    }

    fn visit_state_if(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::StateIf { condition }) = Self::header_of(tree, id) {
            self.block(tree, id, &format!("stateif {}:", quote(condition)));
        }
    }

    fn visit_map(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::Map { params, range }) = Self::header_of(tree, id) {
            self.block(tree, id, &format!("for {} in map[{range}]:", params.join(", ")));
        }
    }

    fn visit_pipeline(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::Pipeline { params, range }) = Self::header_of(tree, id) {
            self.block(tree, id, &format!("for {} in pipeline[{range}]:", params.join(", ")));
        }
    }

    fn visit_consume(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::Consume {
            pe_index,
            num_pes,
            condition,
            stream,
        }) = Self::header_of(tree, id)
        {
            let header = match condition {
                Some(c) => format!("for {pe_index} in consume({stream}, {num_pes}, {}):", quote(c)),
                None => format!("for {pe_index} in consume({stream}, {num_pes}):"),
            };
            self.block(tree, id, &header);
        }
    }

    fn visit_label(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::Label { name }) = tree.kind(id) {
            self.leaf(tree, id, &format!("label {name}:"));
        }
    }

    fn visit_goto(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::Goto { target }) = tree.kind(id) {
            let target = target.as_deref().unwrap_or("exit");
            self.leaf(tree, id, &format!("goto {target}"));
        }
    }

    fn visit_assign(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::Assign { name, value }) = tree.kind(id) {
            self.leaf(tree, id, &format!("assign {name} = {}", quote(value)));
        }
    }

    fn visit_break(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.leaf(tree, id, "break");
    }

    fn visit_continue(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        self.leaf(tree, id, "continue");
    }

    fn visit_tasklet(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::Tasklet {
            code,
            inputs,
            outputs,
        }) = tree.kind(id)
        {
            let header = format!("with tasklet({}):", quote(code));
            self.code_block(tree, id, &header, inputs, outputs);
        }
    }

    fn visit_library(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::Library {
            op,
            properties,
            inputs,
            outputs,
        }) = tree.kind(id)
        {
            let mut args = vec![quote(op)];
            args.extend(properties.iter().map(|(k, v)| format!("{k}={}", quote(v))));
            let header = format!("with library({}):", args.join(", "));
            self.code_block(tree, id, &header, inputs, outputs);
        }
    }

    fn visit_copy(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::Copy { target, memlet }) = tree.kind(id) {
            let dst = match &memlet.other_subset {
                Some(s) => format!("{target}[{s}]"),
                None => target.clone(),
            };
            let mut text = format!("copy(src={}, dst={dst}", source_ref(memlet));
            if let Some(op) = &memlet.wcr {
                let _ = write!(text, ", wcr={}", quote(op));
            }
            text.push(')');
            self.leaf(tree, id, &text);
        }
    }

    fn visit_dyn_scope_copy(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::DynScopeCopy { target, memlet }) = tree.kind(id) {
            self.leaf(tree, id, &format!("dscopy(src={}, dst={target})", source_ref(memlet)));
        }
    }

    fn visit_view(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::View {
            target,
            memlet,
            shape,
        }) = tree.kind(id)
        {
            let text = format!("{target} = view({}, [{}])", source_ref(memlet), exprs(shape));
            self.leaf(tree, id, &text);
        }
    }

    fn visit_nested_view(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::NestedView {
            target,
            memlet,
            shape,
        }) = tree.kind(id)
        {
            let text = format!("{target} = nview({}, [{}])", source_ref(memlet), exprs(shape));
            self.leaf(tree, id, &text);
        }
    }

    fn visit_ref_set(&mut self, tree: &ScheduleTree, id: TreeNodeId) {
        if let Some(TreeKind::RefSet { target, memlet }) = tree.kind(id) {
            self.leaf(tree, id, &format!("{target} = refset({})", source_ref(memlet)));
        }
    }
}

// ── Fragments ───────────────────────────────────────────────────────────────

fn exprs(items: &[Expr]) -> String {
    items
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn param(name: &str, desc: &Data) -> String {
    if desc.kind == DataKind::Scalar {
        format!("{name}: {}", desc.dtype)
    } else {
        format!("{name}: {}[{}]", desc.dtype, exprs(&desc.shape))
    }
}

fn declaration(name: &str, desc: &Data) -> String {
    if desc.kind == DataKind::Scalar {
        format!("{name} = scalar({})", desc.dtype)
    } else {
        format!("{name} = ndarray([{}], {})", exprs(&desc.shape), desc.dtype)
    }
}

/// `A[0:10]`, or the bare name for a whole-container memlet.
fn source_ref(memlet: &Memlet) -> String {
    let data = memlet.data_name().unwrap_or("");
    match &memlet.subset {
        Some(s) => format!("{data}[{s}]"),
        None => data.to_string(),
    }
}

/// A connector memlet, with the conflict multiplicity when reduced.
fn memlet_ref(memlet: &Memlet) -> String {
    let data = memlet.data_name().unwrap_or("");
    let mut out = data.to_string();
    if let Some(op) = &memlet.wcr {
        let n = memlet
            .subset
            .as_ref()
            .map(|s| s.num_elements())
            .unwrap_or_else(Expr::one);
        let _ = write!(out, "({n}, {op})");
    }
    if let Some(s) = &memlet.subset {
        let _ = write!(out, "[{s}]");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DType;
    use crate::schedule::place_declarations;
    use crate::subset::Range;

    fn m(data: &str, subset: &str) -> Memlet {
        Memlet::simple(data, subset).unwrap()
    }

    #[test]
    fn emits_header_declarations_and_blocks() {
        let mut tree = ScheduleTree::new("prog");
        tree.symbols.insert("N".into(), DType::Int64);
        tree.containers.insert(
            "A".into(),
            Data::array(DType::Float64, vec![Expr::sym("N")]),
        );
        tree.containers.insert("x".into(), Data::scalar(DType::Float64));
        tree.containers.insert(
            "T".into(),
            Data::array(DType::Float64, vec![Expr::sym("N")]).transient(),
        );
        let root = tree.root();
        let map = tree.add(
            root,
            TreeKind::Map {
                params: vec!["i".into()],
                range: Range::parse("0:N").unwrap(),
            },
        );
        tree.add(
            map,
            TreeKind::Tasklet {
                code: "t = a + x".into(),
                inputs: [("a".to_string(), m("A", "i")), ("x".to_string(), m("x", "0"))]
                    .into_iter()
                    .collect(),
                outputs: [("t".to_string(), m("T", "i"))].into_iter().collect(),
            },
        );
        tree.add(
            root,
            TreeKind::Copy {
                target: "A".into(),
                memlet: m("T", "0:N")
                    .with_other_subset(Range::parse("0:N").unwrap())
                    .with_wcr("sum"),
            },
        );
        tree.add(root, TreeKind::While { condition: "x > 0".into() });
        place_declarations(&mut tree);

        let expected = "\
N = symbol(\"N\", int64)

@program
def prog(A: float64[N], x: float64):
    T = ndarray([N], float64)
    for i in map[0:N]:
        with tasklet(\"t = a + x\"):
            a << A[i]
            x << x[0]
            t >> T[i]
    copy(src=T[0:N], dst=A[0:N], wcr=\"sum\")
    while \"x > 0\":
        pass
";
        assert_eq!(emit_script(&tree), expected);
    }

    #[test]
    fn empty_program_has_pass_body() {
        let tree = ScheduleTree::new("empty");
        assert_eq!(emit_script(&tree), "@program\ndef empty():\n    pass\n");
    }

    #[test]
    fn reduced_connector_carries_multiplicity() {
        assert_eq!(memlet_ref(&m("B", "0:10").with_wcr("sum")), "B(10, sum)[0:10]");
        assert_eq!(memlet_ref(&m("B", "3").with_wcr("max")), "B(1, max)[3]");
    }
}
