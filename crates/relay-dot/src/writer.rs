//! Deterministic DOT rendering.
//!
//! Output is stable for a given [`DotGraph`]: graph attributes first, then
//! nodes and edges in declaration order, attributes sorted by key. Parsing the
//! rendered text yields an equal graph (modulo source line numbers).

use std::fmt::Write;

use crate::ast::{Attrs, DotGraph};

/// Escape a string for use inside double quotes.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn is_plain_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !matches!(id, "graph" | "node" | "edge" | "subgraph" | "digraph" | "strict")
}

/// Render an id, quoting it when it is not a bare identifier.
pub fn render_id(id: &str) -> String {
    if is_plain_id(id) {
        id.to_string()
    } else {
        format!("\"{}\"", escape(id))
    }
}

fn render_attrs(attrs: &Attrs) -> String {
    attrs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render a graph as DOT text.
pub fn render(graph: &DotGraph) -> String {
    let mut out = String::new();
    if graph.name.is_empty() {
        out.push_str("digraph {\n");
    } else {
        let _ = writeln!(out, "digraph {} {{", render_id(&graph.name));
    }

    if !graph.attrs.is_empty() {
        let _ = writeln!(out, "    graph [{}]", render_attrs(&graph.attrs));
        out.push('\n');
    }

    for node in &graph.nodes {
        if node.attrs.is_empty() {
            let _ = writeln!(out, "    {}", render_id(&node.id));
        } else {
            let _ = writeln!(
                out,
                "    {} [{}]",
                render_id(&node.id),
                render_attrs(&node.attrs)
            );
        }
    }

    if !graph.nodes.is_empty() && !graph.edges.is_empty() {
        out.push('\n');
    }

    for edge in &graph.edges {
        let from = render_id(&edge.from);
        let to = render_id(&edge.to);
        if edge.attrs.is_empty() {
            let _ = writeln!(out, "    {from} -> {to}");
        } else {
            let _ = writeln!(out, "    {from} -> {to} [{}]", render_attrs(&edge.attrs));
        }
    }

    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AttributeValue, EdgeDef, NodeDef};

    #[test]
    fn quotes_ids_that_are_not_identifiers() {
        assert_eq!(render_id("build_api"), "build_api");
        assert_eq!(render_id("build-api"), "\"build-api\"");
        assert_eq!(render_id("2fast"), "\"2fast\"");
        assert_eq!(render_id("node"), "\"node\"");
    }

    #[test]
    fn escapes_quotes_backslashes_and_newlines() {
        assert_eq!(escape("say \"hi\"\\\nbye"), "say \\\"hi\\\"\\\\\\nbye");
    }

    #[test]
    fn renders_in_declaration_order() {
        let mut attrs = Attrs::new();
        attrs.insert("status".into(), AttributeValue::from("pending"));
        attrs.insert("kind".into(), AttributeValue::from("work"));
        let graph = DotGraph {
            name: "P".into(),
            attrs: [("checkpoint_seq".to_string(), AttributeValue::Integer(2))]
                .into_iter()
                .collect(),
            nodes: vec![
                NodeDef { id: "zeta".into(), attrs: Attrs::new(), line: 0 },
                NodeDef { id: "alpha".into(), attrs, line: 0 },
            ],
            edges: vec![EdgeDef {
                from: "zeta".into(),
                to: "alpha".into(),
                attrs: Attrs::new(),
                line: 0,
            }],
        };
        let expected = "digraph P {\n    graph [checkpoint_seq=2]\n\n    zeta\n    alpha [kind=\"work\", status=\"pending\"]\n\n    zeta -> alpha\n}\n";
        assert_eq!(render(&graph), expected);
    }
}
