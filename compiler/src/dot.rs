// dot.rs — Graphviz DOT output for dataflow programs
//
// Transforms a Program into DOT format suitable for rendering with `dot` or
// other Graphviz layout engines. One cluster per state; every scope interior
// becomes a cluster nested inside its enclosing scope's cluster.
//
// Preconditions: scope entries and exits in each state pair up.
// Postconditions: returns a valid DOT string representing the program.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use indexmap::IndexMap;

use crate::data::Data;
use crate::graph::{NodeKind, Program, State};
use crate::id::{NodeId, StateId};
use crate::scope_index::ScopeIndex;

/// Emit the program as a Graphviz DOT string.
pub fn emit_dot(program: &Program) -> String {
    let mut buf = String::new();
    let _ = writeln!(buf, "digraph \"{}\" {{", escape(&program.name));
    let _ = writeln!(buf, "    compound=true;");
    let _ = writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];");
    let _ = writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];");

    for sid in program.state_ids() {
        let Some(state) = program.state(sid) else {
            continue;
        };
        let _ = writeln!(buf);
        let _ = writeln!(buf, "    subgraph cluster_{sid} {{");
        let start = if sid == program.start { " (start)" } else { "" };
        let _ = writeln!(buf, "        label=\"state: {}{start}\";", escape(&state.label));
        let _ = writeln!(buf, "        style=rounded;");
        let _ = writeln!(buf, "        color=gray50;");
        let _ = writeln!(buf, "        {} [shape=point, style=invis];", anchor(sid));
        let scopes = ScopeIndex::build(state);
        write_scope(&mut buf, sid, state, &scopes, &program.arrays, None, "        ");
        write_edges(&mut buf, sid, state, "        ");
        let _ = writeln!(buf, "    }}");
    }

    if !program.transitions.is_empty() {
        let _ = writeln!(buf);
        let _ = writeln!(buf, "    // Inter-state edges");
        for t in &program.transitions {
            let _ = writeln!(
                buf,
                "    {} -> {} [ltail=cluster_{}, lhead=cluster_{}, label=\"{}\", color=gray40];",
                anchor(t.src),
                anchor(t.dst),
                t.src,
                t.dst,
                escape(&transition_label(&t.condition, &t.assignments)),
            );
        }
    }

    let _ = writeln!(buf, "}}");
    buf
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Escape a string for use inside a quoted DOT attribute. Newlines become
/// DOT line breaks.
fn escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn anchor(sid: StateId) -> String {
    format!("{sid}_anchor")
}

/// Build the DOT node ID: `s<state>_n<node>`.
fn dot_node_id(sid: StateId, node: NodeId) -> String {
    format!("{sid}_{node}")
}

/// Condition first, then one assignment per line. Unconditional and
/// assignment-free transitions get an empty label.
fn transition_label(condition: &str, assignments: &IndexMap<String, String>) -> String {
    let mut parts = Vec::new();
    if condition != "1" {
        parts.push(condition.to_string());
    }
    for (name, value) in assignments {
        parts.push(format!("{name} = {value}"));
    }
    parts.join("\n")
}

/// Return DOT attributes string for a node.
fn node_attrs(kind: &NodeKind, arrays: &IndexMap<String, Data>) -> String {
    let (shape, color, label) = match kind {
        NodeKind::Access { data } => {
            let transient = arrays.get(data).is_some_and(|d| d.transient);
            let color = if transient { "lightyellow" } else { "lightsalmon" };
            ("ellipse", color, data.clone())
        }
        NodeKind::Tasklet { label, .. } => ("octagon", "lightblue", label.clone()),
        NodeKind::Library { label, op, .. } => ("box", "lightgreen", format!("{label}\n{op}")),
        NodeKind::Entry { info, .. } => (
            "trapezium",
            "gray90",
            format!("{}[{}]", info.label(), info.params().join(", ")),
        ),
        NodeKind::Exit { .. } => ("invtrapezium", "gray90", String::new()),
        NodeKind::Nested { label, program, .. } => (
            "box3d",
            "lavender",
            format!("{label}\n{} states", program.states.len()),
        ),
    };
    format!(
        "shape={shape}, style=filled, fillcolor={color}, label=\"{}\"",
        escape(&label)
    )
}

/// Write the nodes of one scope level, recursing into nested scopes.
fn write_scope(
    buf: &mut String,
    sid: StateId,
    state: &State,
    scopes: &ScopeIndex,
    arrays: &IndexMap<String, Data>,
    scope: Option<NodeId>,
    indent: &str,
) {
    for id in scopes.scope_children(state, scope) {
        let Some(node) = state.node(id) else {
            continue;
        };
        let Some(info) = node.scope_info() else {
            let _ = writeln!(
                buf,
                "{indent}{} [{}];",
                dot_node_id(sid, id),
                node_attrs(&node.kind, arrays)
            );
            continue;
        };
        let inner = format!("{indent}    ");
        let _ = writeln!(buf, "{indent}subgraph cluster_{sid}_{id} {{");
        let _ = writeln!(buf, "{inner}label=\"{}\";", escape(&info.range().to_string()));
        let _ = writeln!(buf, "{inner}style=dashed;");
        let _ = writeln!(buf, "{inner}color=gray70;");
        let _ = writeln!(
            buf,
            "{inner}{} [{}];",
            dot_node_id(sid, id),
            node_attrs(&node.kind, arrays)
        );
        write_scope(buf, sid, state, scopes, arrays, Some(id), &inner);
        if let Some(exit) = state.exit_node(id).and_then(|x| state.node(x)) {
            let _ = writeln!(
                buf,
                "{inner}{} [{}];",
                dot_node_id(sid, exit.id),
                node_attrs(&exit.kind, arrays)
            );
        }
        let _ = writeln!(buf, "{indent}}}");
    }
}

/// Memlet edges, labelled with their memlet. Empty edges are dashed.
fn write_edges(buf: &mut String, sid: StateId, state: &State, indent: &str) {
    for edge in state.edges() {
        let src = dot_node_id(sid, edge.src);
        let dst = dot_node_id(sid, edge.dst);
        if edge.memlet.is_empty() {
            let _ = writeln!(buf, "{indent}{src} -> {dst} [style=dashed];");
        } else {
            let _ = writeln!(
                buf,
                "{indent}{src} -> {dst} [label=\"{}\"];",
                escape(&edge.memlet.to_string())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DType;
    use crate::graph::MapKind;
    use crate::memlet::Memlet;
    use crate::subset::Range;
    use crate::symbolic::Expr;

    /// Two states: `A -> [map i: t] -> B`, then an empty state.
    fn program() -> Program {
        let mut p = Program::new("dot_test");
        p.add_array("A", Data::array(DType::Float64, vec![Expr::int(10)]));
        p.add_array("B", Data::array(DType::Float64, vec![Expr::int(10)]));
        let s0 = p.add_state("compute");
        let s1 = p.add_state("done");
        let s = p.state_mut(s0).unwrap();
        let a = s.add_access("A");
        let (me, mx) = s.add_map("m", &["i"], Range::parse("0:10").unwrap(), MapKind::Parallel);
        let t = s.add_tasklet("scale", "b = \"x\" * a", &["a"], &["b"]);
        let b = s.add_access("B");
        s.add_edge(a, None, me, Some("IN_0"), Memlet::simple("A", "0:10").unwrap());
        s.add_edge(me, Some("OUT_0"), t, Some("a"), Memlet::simple("A", "i").unwrap());
        s.add_edge(t, Some("b"), mx, Some("IN_0"), Memlet::simple("B", "i").unwrap());
        s.add_edge(mx, Some("OUT_0"), b, None, Memlet::simple("B", "0:10").unwrap());
        p.add_transition(s0, s1, "N > 0", &[("k", "k + 1")]);
        p
    }

    #[test]
    fn valid_dot_structure() {
        let dot = emit_dot(&program());
        assert!(dot.starts_with("digraph \"dot_test\" {"));
        assert!(dot.trim_end().ends_with('}'));
        assert_eq!(dot.matches('{').count(), dot.matches('}').count());
    }

    #[test]
    fn one_cluster_per_state_with_nested_scope() {
        let dot = emit_dot(&program());
        assert!(dot.contains("subgraph cluster_s0 {"));
        assert!(dot.contains("subgraph cluster_s1 {"));
        assert!(dot.contains("label=\"state: compute (start)\";"));
        // scope cluster sits inside the state cluster
        let state = dot.find("subgraph cluster_s0 {").unwrap();
        let scope = dot.find("subgraph cluster_s0_n1 {").unwrap();
        assert!(scope > state);
        assert!(dot.contains("        subgraph cluster_s0_n1 {"));
        assert!(dot.contains("shape=trapezium"));
        assert!(dot.contains("shape=invtrapezium"));
    }

    #[test]
    fn edges_carry_memlets() {
        let dot = emit_dot(&program());
        assert!(dot.contains("s0_n0 -> s0_n1 [label=\"A[0:10]\"];"));
        assert!(dot.contains("s0_n1 -> s0_n3 [label=\"A[i]\"];"));
    }

    #[test]
    fn inter_state_edges_show_condition_and_assignments() {
        let dot = emit_dot(&program());
        assert!(dot.contains(
            "s0_anchor -> s1_anchor [ltail=cluster_s0, lhead=cluster_s1, label=\"N > 0\\nk = k + 1\""
        ));
    }

    #[test]
    fn quotes_are_escaped() {
        let mut p = program();
        p.states[1].add_tasklet("say \"hi\"", "", &[], &[]);
        let dot = emit_dot(&p);
        assert!(dot.contains("label=\"say \\\"hi\\\"\""));
    }

    #[test]
    fn deterministic_output() {
        assert_eq!(emit_dot(&program()), emit_dot(&program()));
    }
}
