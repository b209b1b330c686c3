use std::collections::BTreeMap;
use std::fmt;

/// Attribute map. Ordered so that rendering is deterministic.
pub type Attrs = BTreeMap<String, AttributeValue>;

/// A parsed `digraph`. Subgraphs are flattened into the top-level node and
/// edge lists with their scoped defaults already applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DotGraph {
    pub name: String,
    pub attrs: Attrs,
    /// Node statements in declaration order. A node id that appears in two
    /// node statements yields two entries.
    pub nodes: Vec<NodeDef>,
    pub edges: Vec<EdgeDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub id: String,
    pub attrs: Attrs,
    /// 1-based line of the node statement in the source (0 when built in code).
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    pub attrs: Attrs,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integers, plus strings holding an integer literal.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            AttributeValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            AttributeValue::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

/// Renders the value the way it is written in a DOT attribute list.
impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => write!(f, "\"{}\"", crate::writer::escape(s)),
            AttributeValue::Integer(i) => write!(f, "{i}"),
            AttributeValue::Float(x) => write!(f, "{x:?}"),
            AttributeValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}
