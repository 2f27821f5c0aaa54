//! # Message Validation
//!
//! The drain loop can judge each message it consumes with a
//! [`MessagePredicate`]. Any `Fn(&str) -> bool` qualifies; [`XPathRule`] is
//! the rule used by validate scenarios.
//!
//! ## XPath rule semantics
//!
//! Given a filter path/value and a target path/value:
//!
//! 1. If the filter node exists and its text does **not** contain the filter
//!    value, the message is outside the test and passes.
//! 2. Otherwise the target node's text must equal the target value exactly.
//! 3. A missing target node fails.
//!
//! A body that is not well-formed XML fails and is logged.
//!
//! ## Supported paths
//!
//! A practical subset of XPath 1.0 location paths:
//!
//! - absolute child steps (`/Envelope/Header/Id`) and relative paths, which
//!   are resolved from the document root
//! - descendant steps (`//Id`, `/Envelope//Id`)
//! - `*` for any element
//! - positional predicates (`Item[2]`) and attribute equality
//!   (`Item[@type='debit']`)
//! - terminal `@attr` and `text()` steps
//!
//! Positional predicates count among siblings, so `//Item[2]` is an `Item`
//! that is the second `Item` child of its parent. Element text is the
//! concatenation of every descendant text node; a `text()` step yields the
//! first selected text node. Bodies may carry a DOCTYPE.

use roxmltree::{Document, Node, NodeId, ParsingOptions};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Decides whether a consumed message body is valid.
pub trait MessagePredicate: Send + Sync {
    fn evaluate(&self, body: &str) -> bool;
}

impl<F> MessagePredicate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn evaluate(&self, body: &str) -> bool {
        self(body)
    }
}

/// Path expression rejected by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("empty step in path '{0}'")]
    EmptyStep(String),
    #[error("unterminated predicate in path '{0}'")]
    UnterminatedPredicate(String),
    #[error("unsupported predicate '[{0}]'")]
    UnsupportedPredicate(String),
    #[error("'{0}' must be the last step of a path")]
    NotTerminal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeTest {
    Name(String),
    AnyElement,
    Text,
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    Position(usize),
    AttributeEquals(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

/// Compiled location path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePath {
    source: String,
    steps: Vec<Step>,
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for NodePath {
    type Err = PathError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let source = path.trim();
        if source.is_empty() {
            return Err(PathError::Empty);
        }

        let mut steps = Vec::new();
        let mut rest = source;
        let mut axis = Axis::Child;
        loop {
            if let Some(stripped) = rest.strip_prefix("//") {
                axis = Axis::Descendant;
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix('/') {
                rest = stripped;
            }

            let end = step_end(rest).ok_or_else(|| PathError::UnterminatedPredicate(source.into()))?;
            let (raw, remainder) = rest.split_at(end);
            if raw.is_empty() {
                return Err(PathError::EmptyStep(source.into()));
            }
            steps.push(parse_step(raw, axis)?);

            if remainder.is_empty() {
                break;
            }
            rest = remainder;
            axis = Axis::Child;
        }

        if let Some(position) = steps
            .iter()
            .position(|s| matches!(s.test, NodeTest::Text | NodeTest::Attribute(_)))
        {
            if position + 1 != steps.len() {
                return Err(PathError::NotTerminal(source.into()));
            }
        }

        Ok(Self {
            source: source.to_string(),
            steps,
        })
    }
}

/// Byte offset where the current step ends: the next `/` outside brackets.
fn step_end(rest: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (index, c) in rest.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.checked_sub(1)?,
            '/' if depth == 0 => return Some(index),
            _ => {}
        }
    }
    (depth == 0).then_some(rest.len())
}

fn parse_step(raw: &str, axis: Axis) -> Result<Step, PathError> {
    let (name, mut predicates_src) = match raw.find('[') {
        Some(index) => raw.split_at(index),
        None => (raw, ""),
    };

    let test = match name.trim() {
        "*" => NodeTest::AnyElement,
        "text()" => NodeTest::Text,
        other => match other.strip_prefix('@') {
            Some(attribute) => NodeTest::Attribute(attribute.to_string()),
            None => NodeTest::Name(other.to_string()),
        },
    };

    let mut predicates = Vec::new();
    while let Some(open) = predicates_src.strip_prefix('[') {
        let close = open
            .find(']')
            .ok_or_else(|| PathError::UnterminatedPredicate(raw.into()))?;
        predicates.push(parse_predicate(open[..close].trim())?);
        predicates_src = &open[close + 1..];
    }
    if !predicates_src.trim().is_empty() {
        return Err(PathError::UnsupportedPredicate(predicates_src.into()));
    }

    Ok(Step {
        axis,
        test,
        predicates,
    })
}

fn parse_predicate(body: &str) -> Result<Predicate, PathError> {
    if let Ok(position) = body.parse::<usize>() {
        if position >= 1 {
            return Ok(Predicate::Position(position));
        }
    }
    if let Some((name, value)) = body.strip_prefix('@').and_then(|b| b.split_once('=')) {
        let value = value.trim();
        let unquoted = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')));
        if let Some(unquoted) = unquoted {
            return Ok(Predicate::AttributeEquals(
                name.trim().to_string(),
                unquoted.to_string(),
            ));
        }
    }
    Err(PathError::UnsupportedPredicate(body.into()))
}

/// Concatenated text of every text node below `node`.
fn inner_text(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

impl NodePath {
    /// Text of the first node the path selects in `document`.
    pub fn select_text(&self, document: &Document<'_>) -> Option<String> {
        let mut context = vec![document.root()];

        for step in &self.steps {
            // `//step` is `descendant-or-self::node()/step`: the step and its
            // predicates apply to the children of every node on the way down.
            let parents: Vec<Node<'_, '_>> = match step.axis {
                Axis::Child => context.clone(),
                Axis::Descendant => {
                    let mut seen: HashSet<NodeId> = HashSet::new();
                    context
                        .iter()
                        .flat_map(|node| node.descendants())
                        .filter(|n| seen.insert(n.id()))
                        .collect()
                }
            };

            match &step.test {
                NodeTest::Text => {
                    let first = match step.axis {
                        Axis::Child => context.iter().flat_map(|n| n.children()).find(|n| n.is_text()),
                        Axis::Descendant => context
                            .iter()
                            .flat_map(|n| n.descendants().skip(1))
                            .find(|n| n.is_text()),
                    };
                    return first.and_then(|n| n.text()).map(str::to_string);
                }
                NodeTest::Attribute(name) => {
                    return parents
                        .iter()
                        .find_map(|n| n.attribute(name.as_str()).map(str::to_string));
                }
                NodeTest::Name(_) | NodeTest::AnyElement => {}
            }

            let mut next = Vec::new();
            for parent in &parents {
                let mut matched: Vec<Node<'_, '_>> = parent
                    .children()
                    .filter(|n| n.is_element() && step.matches_name(n))
                    .collect();
                for predicate in &step.predicates {
                    matched = match predicate {
                        Predicate::AttributeEquals(name, value) => matched
                            .into_iter()
                            .filter(|n| n.attribute(name.as_str()) == Some(value.as_str()))
                            .collect(),
                        Predicate::Position(position) => {
                            matched.into_iter().skip(position - 1).take(1).collect()
                        }
                    };
                }
                next.extend(matched);
            }

            if next.is_empty() {
                return None;
            }
            next.sort_by_key(|n| n.range().start);
            context = next;
        }

        context.first().map(|node| inner_text(*node))
    }
}

impl Step {
    fn matches_name(&self, node: &Node<'_, '_>) -> bool {
        match &self.test {
            NodeTest::Name(name) => node.tag_name().name() == name,
            NodeTest::AnyElement => true,
            NodeTest::Text | NodeTest::Attribute(_) => false,
        }
    }
}

/// Filter/target rule applied to XML message bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XPathRule {
    filter: Option<NodePath>,
    filter_value: String,
    target: NodePath,
    target_value: String,
}

impl XPathRule {
    /// Compile a rule. An empty filter path disables the filter, so every
    /// message is checked against the target.
    pub fn new(
        filter_path: &str,
        filter_value: &str,
        target_path: &str,
        target_value: &str,
    ) -> Result<Self, PathError> {
        let filter = if filter_path.trim().is_empty() {
            None
        } else {
            Some(filter_path.parse()?)
        };
        Ok(Self {
            filter,
            filter_value: filter_value.to_string(),
            target: target_path.parse()?,
            target_value: target_value.to_string(),
        })
    }

    pub fn validate(&self, body: &str) -> bool {
        let options = ParsingOptions {
            allow_dtd: true,
            ..ParsingOptions::default()
        };
        let document = match Document::parse_with_options(body, options) {
            Ok(document) => document,
            Err(e) => {
                warn!("Message body is not well-formed XML: {}", e);
                return false;
            }
        };

        if let Some(filter) = &self.filter {
            if let Some(text) = filter.select_text(&document) {
                if !text.contains(&self.filter_value) {
                    return true;
                }
            }
        }

        self.target
            .select_text(&document)
            .is_some_and(|text| text == self.target_value)
    }
}

impl MessagePredicate for XPathRule {
    fn evaluate(&self, body: &str) -> bool {
        self.validate(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYMENT: &str = r#"<Document>
  <Header><TestId>LOADTEST-42</TestId></Header>
  <Payment type="credit" id="p1"><Status>ACCP</Status><Amount>10</Amount></Payment>
  <Payment type="debit" id="p2"><Status>RJCT</Status><Amount>20</Amount></Payment>
</Document>"#;

    fn text(path: &str, xml: &str) -> Option<String> {
        let document = Document::parse(xml).unwrap();
        path.parse::<NodePath>().unwrap().select_text(&document)
    }

    #[test]
    fn test_absolute_and_descendant_paths() {
        assert_eq!(text("/Document/Header/TestId", PAYMENT).as_deref(), Some("LOADTEST-42"));
        assert_eq!(text("//TestId", PAYMENT).as_deref(), Some("LOADTEST-42"));
        assert_eq!(text("/Document//Status", PAYMENT).as_deref(), Some("ACCP"));
        assert_eq!(text("Document/Header/TestId", PAYMENT).as_deref(), Some("LOADTEST-42"));
        assert_eq!(text("/Document/Missing", PAYMENT), None);
    }

    #[test]
    fn test_predicates_and_terminal_steps() {
        assert_eq!(text("//Payment[2]/Status", PAYMENT).as_deref(), Some("RJCT"));
        assert_eq!(
            text("//Payment[@type='debit']/Amount", PAYMENT).as_deref(),
            Some("20")
        );
        assert_eq!(text("/Document/Payment/@id", PAYMENT).as_deref(), Some("p1"));
        assert_eq!(text("//Payment[2]/@id", PAYMENT).as_deref(), Some("p2"));
        assert_eq!(text("/Document/*/TestId/text()", PAYMENT).as_deref(), Some("LOADTEST-42"));
    }

    #[test]
    fn test_descendant_position_counts_siblings() {
        const NESTED: &str = "<a><b><Item>x</Item></b><c><Item>y</Item><Item>z</Item></c></a>";
        assert_eq!(text("//Item[2]", NESTED).as_deref(), Some("z"));
        assert_eq!(text("//Item[1]", NESTED).as_deref(), Some("x"));
        assert_eq!(text("//Item[3]", NESTED), None);
        assert_eq!(text("/a/b//Item[2]", NESTED), None);
        assert_eq!(
            text("//Item[2]", "<a><b><Item>x</Item></b><c><Item>y</Item></c></a>"),
            None
        );
    }

    #[test]
    fn test_text_step_follows_axis() {
        const MIXED: &str = "<a><b>inner</b>tail</a>";
        assert_eq!(text("//text()", "<a><b>hi</b></a>").as_deref(), Some("hi"));
        assert_eq!(text("/a/text()", "<a><b>hi</b></a>"), None);
        assert_eq!(text("/a/text()", MIXED).as_deref(), Some("tail"));
        assert_eq!(text("/a//text()", MIXED).as_deref(), Some("inner"));
    }

    #[test]
    fn test_descendant_matches_in_document_order() {
        let xml = "<a><b><Item>first</Item></b><Item>second</Item></a>";
        assert_eq!(text("//Item", xml).as_deref(), Some("first"));
    }

    #[test]
    fn test_rule_accepts_doctype() {
        let rule = XPathRule::new("", "", "//Status", "OK").unwrap();
        assert!(rule.validate("<!DOCTYPE Order><Order><Status>OK</Status></Order>"));
    }

    #[test]
    fn test_inner_text_concatenates_descendants() {
        assert_eq!(text("/Document/Payment", PAYMENT).as_deref(), Some("ACCP10"));
    }

    #[test]
    fn test_path_parse_errors() {
        assert_eq!("".parse::<NodePath>(), Err(PathError::Empty));
        assert!(matches!("/a[1".parse::<NodePath>(), Err(PathError::UnterminatedPredicate(_))));
        assert!(matches!("/a[last()]".parse::<NodePath>(), Err(PathError::UnsupportedPredicate(_))));
        assert!(matches!("/a/@id/b".parse::<NodePath>(), Err(PathError::NotTerminal(_))));
        assert!(matches!("/a///b".parse::<NodePath>(), Err(PathError::EmptyStep(_))));
    }

    #[test]
    fn test_rule_checks_target_when_filter_matches() {
        let rule = XPathRule::new("//TestId", "LOADTEST", "//Payment[1]/Status", "ACCP").unwrap();
        assert!(rule.validate(PAYMENT));

        let rule = XPathRule::new("//TestId", "LOADTEST", "//Payment[2]/Status", "ACCP").unwrap();
        assert!(!rule.validate(PAYMENT));
    }

    #[test]
    fn test_rule_passes_messages_outside_the_filter() {
        let rule = XPathRule::new("//TestId", "OTHER-RUN", "//Status", "NEVER").unwrap();
        assert!(rule.validate(PAYMENT));
    }

    #[test]
    fn test_rule_fails_when_target_missing() {
        let rule = XPathRule::new("//TestId", "LOADTEST", "//Missing", "x").unwrap();
        assert!(!rule.validate(PAYMENT));

        // Without a filter node the target is still checked.
        let rule = XPathRule::new("//NoSuchFilter", "x", "//Amount", "10").unwrap();
        assert!(rule.validate(PAYMENT));
    }

    #[test]
    fn test_rule_without_filter_and_malformed_body() {
        let rule = XPathRule::new("", "", "//Amount", "10").unwrap();
        assert!(rule.validate(PAYMENT));
        assert!(!rule.validate("<Document><Amount>10</Document>"));
        assert!(!rule.validate("plain text"));
    }

    #[test]
    fn test_closures_are_predicates() {
        let predicate = |body: &str| body.starts_with("<Document>");
        assert!(predicate.evaluate(PAYMENT));
        assert!(!predicate.evaluate("nope"));
    }
}
