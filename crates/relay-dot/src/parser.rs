use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, not, opt, preceded, repeat, terminated};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::*;

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

fn expected(desc: &'static str) -> StrContext {
    StrContext::Expected(StrContextValue::Description(desc))
}

/// Strip `//`, `#` and `/* */` comments. Newlines inside block comments are
/// kept so that line numbers in error messages stay correct.
pub(crate) fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut line_start = true;

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                while chars.peek().is_some_and(|&n| n != '\n') {
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    if n == '\n' {
                        out.push('\n');
                    }
                    prev = n;
                }
            }
            // preprocessor-style line, ignored by graphviz too
            '#' if line_start => {
                while chars.peek().is_some_and(|&n| n != '\n') {
                    chars.next();
                }
            }
            '"' => {
                out.push('"');
                while let Some(n) = chars.next() {
                    out.push(n);
                    if n == '\\' {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else if n == '"' {
                        break;
                    }
                }
            }
            other => out.push(other),
        }
        if c == '\n' {
            line_start = true;
        } else if !c.is_whitespace() {
            line_start = false;
        }
    }
    out
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., is_ident_char),
    )
        .take()
        .parse_next(input)
}

/// Attribute keys may be dotted (`tool.command`).
fn attr_key(input: &mut &str) -> ModalResult<String> {
    let first = identifier.parse_next(input)?;
    let rest: Vec<&str> = repeat(0.., preceded('.', identifier)).parse_next(input)?;
    let mut key = first.to_string();
    for part in rest {
        key.push('.');
        key.push_str(part);
    }
    Ok(key)
}

/// Double-quoted string. `\n`, `\t`, `\\` and `\"` are unescaped; any other
/// escape is kept verbatim so graphviz label escapes (`\l`, `\N`) survive.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = winnow::token::any
            .context(expected("closing quote"))
            .parse_next(input)?;
        match c {
            '"' => break,
            '\\' => {
                let esc = winnow::token::any.parse_next(input)?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

fn numeral<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (opt(alt(('-', '+'))), digit1, opt(('.', digit1)))
        .take()
        .parse_next(input)
}

/// Node ids: identifier, quoted string, or numeral.
fn node_id(input: &mut &str) -> ModalResult<String> {
    alt((
        quoted_string,
        identifier.map(String::from),
        numeral.map(String::from),
    ))
    .parse_next(input)
}

fn boolean_value(input: &mut &str) -> ModalResult<bool> {
    terminated(
        alt((literal("true").value(true), literal("false").value(false))),
        not(take_while(1, is_ident_char)),
    )
    .parse_next(input)
}

fn float_value(input: &mut &str) -> ModalResult<f64> {
    let s: &str = (opt(alt(('-', '+'))), digit1, '.', digit1)
        .take()
        .parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

fn integer_value(input: &mut &str) -> ModalResult<i64> {
    let s: &str = terminated(
        (opt(alt(('-', '+'))), digit1).take(),
        not(take_while(1, is_ident_char)),
    )
    .parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

fn attr_value(input: &mut &str) -> ModalResult<AttributeValue> {
    alt((
        quoted_string.map(AttributeValue::String),
        boolean_value.map(AttributeValue::Boolean),
        float_value.map(AttributeValue::Float),
        integer_value.map(AttributeValue::Integer),
        // bare graphviz ids such as `shape=box`
        take_while(1.., |c: char| is_ident_char(c) || c == '.')
            .map(|s: &str| AttributeValue::String(s.to_string())),
    ))
    .parse_next(input)
}

fn attr(input: &mut &str) -> ModalResult<(String, AttributeValue)> {
    let key = attr_key.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '='.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let value = attr_value
        .context(expected("attribute value"))
        .parse_next(input)?;
    Ok((key, value))
}

/// `'[' attr ( (','|';')? attr )* ']'`
fn attr_block(input: &mut &str) -> ModalResult<Attrs> {
    let _ = '['.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let mut attrs = Attrs::new();
    while let Some((key, value)) = opt(attr).parse_next(input)? {
        attrs.insert(key, value);
        let _ = ws.parse_next(input)?;
        let _ = opt(alt((',', ';'))).parse_next(input)?;
        let _ = ws.parse_next(input)?;
    }

    let _ = ']'.context(expected("']'")).parse_next(input)?;
    Ok(attrs)
}

enum Statement {
    GraphAttrs(Attrs),
    NodeDefaults(Attrs),
    EdgeDefaults(Attrs),
    Node(String, Attrs),
    Edge(Vec<String>, Attrs),
    Subgraph(Vec<Located>),
    GraphAttrDecl(String, AttributeValue),
}

/// A statement plus the length of the input that remained when it started,
/// which is enough to recover its line number afterwards.
struct Located {
    stmt: Statement,
    rest_len: usize,
}

fn keyword_block(keyword: &'static str) -> impl FnMut(&mut &str) -> ModalResult<Attrs> {
    move |input: &mut &str| {
        let _ = literal(keyword).parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let attrs = attr_block.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        Ok(attrs)
    }
}

fn subgraph_stmt(input: &mut &str) -> ModalResult<Statement> {
    let _ = literal("subgraph").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(node_id).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'.context(expected("'}' closing subgraph")).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Subgraph(stmts))
}

fn node_or_edge_stmt(input: &mut &str) -> ModalResult<Statement> {
    let first = node_id.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if opt(literal("->")).parse_next(input)?.is_some() {
        let mut chain = vec![first];
        loop {
            let _ = ws.parse_next(input)?;
            let next = node_id
                .context(expected("edge target identifier"))
                .parse_next(input)?;
            chain.push(next);
            let _ = ws.parse_next(input)?;
            if opt(literal("->")).parse_next(input)?.is_none() {
                break;
            }
        }
        let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Edge(chain, attrs));
    }

    if opt(literal("--")).parse_next(input)?.is_some() {
        return Err(make_cut_error(
            "only directed edges (->); undirected edges (--) are not supported",
        ));
    }

    if let Some(attrs) = opt(attr_block).parse_next(input)? {
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Node(first, attrs));
    }

    // `key = value` at statement level is a graph attribute
    if opt('=').parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let val = attr_value
            .context(expected("graph attribute value"))
            .parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::GraphAttrDecl(first, val));
    }

    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Node(first, Attrs::new()))
}

fn statement(input: &mut &str) -> ModalResult<Located> {
    let _ = ws.parse_next(input)?;
    let rest_len = input.len();
    let stmt = alt((
        keyword_block("graph").map(Statement::GraphAttrs),
        keyword_block("node").map(Statement::NodeDefaults),
        keyword_block("edge").map(Statement::EdgeDefaults),
        subgraph_stmt,
        node_or_edge_stmt,
    ))
    .parse_next(input)?;
    Ok(Located { stmt, rest_len })
}

fn statements(input: &mut &str) -> ModalResult<Vec<Located>> {
    let mut stmts = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if input.is_empty() || input.starts_with('}') {
            break;
        }
        stmts.push(statement.parse_next(input)?);
    }
    Ok(stmts)
}

/// Maps "input remaining" lengths back to 1-based line numbers.
struct LineIndex<'a> {
    source: &'a str,
}

impl LineIndex<'_> {
    fn line_at(&self, rest_len: usize) -> usize {
        let consumed = self.source.len().saturating_sub(rest_len);
        self.source[..consumed].matches('\n').count() + 1
    }
}

/// Fold statements into `graph`, applying node/edge defaults in scope.
/// Subgraph scopes inherit the parent defaults and are flattened.
fn flatten(
    stmts: Vec<Located>,
    parent_node_defaults: &Attrs,
    parent_edge_defaults: &Attrs,
    graph: &mut DotGraph,
    lines: &LineIndex<'_>,
) {
    let mut node_defaults = parent_node_defaults.clone();
    let mut edge_defaults = parent_edge_defaults.clone();

    for Located { stmt, rest_len } in stmts {
        match stmt {
            Statement::GraphAttrs(attrs) => graph.attrs.extend(attrs),
            Statement::GraphAttrDecl(key, val) => {
                graph.attrs.insert(key, val);
            }
            Statement::NodeDefaults(attrs) => node_defaults.extend(attrs),
            Statement::EdgeDefaults(attrs) => edge_defaults.extend(attrs),
            Statement::Node(id, attrs) => {
                let mut merged = node_defaults.clone();
                merged.extend(attrs);
                graph.nodes.push(NodeDef {
                    id,
                    attrs: merged,
                    line: lines.line_at(rest_len),
                });
            }
            Statement::Edge(chain, attrs) => {
                let line = lines.line_at(rest_len);
                // A -> B -> C => (A,B), (B,C)
                for pair in chain.windows(2) {
                    let mut merged = edge_defaults.clone();
                    merged.extend(attrs.clone());
                    graph.edges.push(EdgeDef {
                        from: pair[0].clone(),
                        to: pair[1].clone(),
                        attrs: merged,
                        line,
                    });
                }
            }
            Statement::Subgraph(inner) => {
                flatten(inner, &node_defaults, &edge_defaults, graph, lines);
            }
        }
    }
}

fn parse_digraph(input: &mut &str) -> ModalResult<(String, Vec<Located>)> {
    let _ = ws.parse_next(input)?;

    if input.starts_with("strict") {
        return Err(make_cut_error("'digraph' keyword (strict graphs are not supported)"));
    }
    if input.starts_with("graph") {
        return Err(make_cut_error("'digraph' keyword (undirected graphs are not supported)"));
    }

    let _ = literal("digraph")
        .context(StrContext::Expected(StrContextValue::StringLiteral("digraph")))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = opt(node_id).parse_next(input)?.unwrap_or_default();
    let _ = ws.parse_next(input)?;
    let _ = '{'.context(expected("'{'")).parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'.context(expected("'}' closing digraph")).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    Ok((name, stmts))
}

/// Parse DOT source into a [`DotGraph`].
pub fn parse(input: &str) -> relay_types::Result<DotGraph> {
    let stripped = strip_comments(input);
    let mut remaining = stripped.as_str();
    let lines = LineIndex { source: &stripped };

    let parsed = parse_digraph.parse_next(&mut remaining).map_err(|e| {
        let consumed = stripped.len() - remaining.len();
        let prefix = &stripped[..consumed];
        let line = prefix.matches('\n').count() + 1;
        let col = match prefix.rfind('\n') {
            Some(pos) => prefix[pos + 1..].chars().count() + 1,
            None => prefix.chars().count() + 1,
        };
        let snippet: String = remaining.chars().take(40).collect();
        relay_types::RelayError::ParseError {
            line,
            col,
            message: e.to_string(),
            source_snippet: (!snippet.is_empty()).then_some(snippet),
        }
    })?;

    if !remaining.trim().is_empty() {
        let snippet: String = remaining.chars().take(40).collect();
        return Err(relay_types::RelayError::ParseError {
            line: lines.line_at(remaining.len()),
            col: 1,
            message: "trailing content after closing '}'".into(),
            source_snippet: Some(snippet),
        });
    }

    let (name, stmts) = parsed;
    let mut graph = DotGraph {
        name,
        ..DotGraph::default()
    };
    flatten(stmts, &Attrs::new(), &Attrs::new(), &mut graph, &lines);
    tracing::debug!(
        name = %graph.name,
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        "Parsed DOT graph"
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_line_and_block_comments() {
        let src = "a // trailing\n/* block\nspans */ b\n# pragma\nc";
        assert_eq!(strip_comments(src), "a \n\n b\n\nc");
    }

    #[test]
    fn strip_keeps_comment_markers_inside_strings() {
        let src = r#"x [label="http://host/*not*/"]"#;
        assert_eq!(strip_comments(src), src);
    }

    #[test]
    fn strip_preserves_non_ascii() {
        let src = "n [acceptance=\"résumé ✓\"]";
        assert_eq!(strip_comments(src), src);
    }

    #[test]
    fn boolean_does_not_swallow_identifier_prefix() {
        let mut input = "true_north";
        assert!(boolean_value.parse_next(&mut input).is_err());
        let mut input = "trueish";
        let v = attr_value.parse_next(&mut input).unwrap();
        assert_eq!(v, AttributeValue::String("trueish".into()));
    }

    #[test]
    fn integer_value_rejects_trailing_letters() {
        let mut input = "30s";
        let v = attr_value.parse_next(&mut input).unwrap();
        assert_eq!(v, AttributeValue::String("30s".into()));
    }

    #[test]
    fn line_numbers_recorded_for_statements() {
        let g = parse("digraph G {\n  a [kind=\"start\"]\n\n  b\n  a -> b\n}").unwrap();
        assert_eq!(g.nodes[0].line, 2);
        assert_eq!(g.nodes[1].line, 4);
        assert_eq!(g.edges[0].line, 5);
    }
}
