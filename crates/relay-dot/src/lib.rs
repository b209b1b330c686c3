//! DOT parser and writer for the Graphviz subset used by Relay pipeline graphs.
//!
//! Parses `digraph Name { ... }` with nodes, edges, (flattened) subgraphs and
//! typed attributes into a [`DotGraph`], and renders a [`DotGraph`] back to
//! DOT text that Graphviz tooling can still read.
//!
//! # Example
//! ```
//! let dot = r#"digraph Pipeline { start; build; start -> build }"#;
//! let graph = relay_dot::parse(dot).unwrap();
//! assert_eq!(graph.name, "Pipeline");
//! assert_eq!(graph.edges.len(), 1);
//! let again = relay_dot::parse(&relay_dot::render(&graph)).unwrap();
//! assert_eq!(again.nodes.len(), 2);
//! ```

pub mod ast;
mod parser;
pub mod writer;

pub use ast::*;
pub use parser::parse;
pub use writer::render;
