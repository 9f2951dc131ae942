#![forbid(unsafe_code)]

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Nesting depth past which parsers fail closed instead of recursing.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Leaf { id: String },
    And { children: Vec<Node> },
    Or { children: Vec<Node> },
    Not { child: Box<Node> },
}

impl Node {
    #[must_use]
    pub fn leaf(id: impl Into<String>) -> Self {
        Self::Leaf { id: id.into() }
    }

    #[must_use]
    pub fn and(children: Vec<Node>) -> Self {
        Self::And { children }
    }

    #[must_use]
    pub fn or(children: Vec<Node>) -> Self {
        Self::Or { children }
    }

    #[must_use]
    pub fn not(child: Node) -> Self {
        Self::Not {
            child: Box::new(child),
        }
    }

    /// Short-circuiting evaluation: AND stops at the first false child,
    /// OR at the first true child.
    #[must_use]
    pub fn evaluate(&self, active: &ActiveSet) -> bool {
        self.evaluate_with(&mut |id| active.contains(id))
    }

    /// Same traversal with an injectable membership probe, so callers
    /// (and tests) can observe exactly which leaves get consulted.
    pub fn evaluate_with(&self, probe: &mut impl FnMut(&str) -> bool) -> bool {
        match self {
            Self::Leaf { id } => probe(id),
            Self::And { children } => children.iter().all(|child| child.evaluate_with(probe)),
            Self::Or { children } => children.iter().any(|child| child.evaluate_with(probe)),
            Self::Not { child } => !child.evaluate_with(probe),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSet {
    ids: HashSet<String>,
}

impl ActiveSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ids: HashSet::new(),
        }
    }

    #[must_use]
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Query-parameter surface: comma-separated identifiers, each token
    /// trimmed, empty tokens dropped, duplicates harmless.
    #[must_use]
    pub fn from_csv(csv: &str) -> Self {
        Self::from_ids(
            csv.split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty()),
        )
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character: '{0}'")]
    UnexpectedCharacter(char),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("operator keyword used where an identifier is expected: {0}")]
    KeywordAsIdentifier(String),
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    #[error("{0} requires at least one child")]
    MissingChildren(&'static str),
    #[error("expected ')'")]
    ExpectedCloseParen,
    #[error("trailing tokens after expression")]
    TrailingTokens,
    #[error("expression nesting exceeds depth limit ({MAX_DEPTH})")]
    TooDeep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Word(String),
}

impl Token {
    fn render(&self) -> String {
        match self {
            Self::LParen => "(".to_owned(),
            Self::RParen => ")".to_owned(),
            Self::Word(word) => word.clone(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '(' {
            chars.next();
            tokens.push(Token::LParen);
        } else if c == ')' {
            chars.next();
            tokens.push(Token::RParen);
        } else if c.is_ascii_alphanumeric() {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
        } else {
            return Err(SyntaxError::UnexpectedCharacter(c));
        }
    }
    Ok(tokens)
}

fn is_operator(word: &str) -> bool {
    word.eq_ignore_ascii_case("AND")
        || word.eq_ignore_ascii_case("OR")
        || word.eq_ignore_ascii_case("NOT")
}

struct TokenCursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenCursor {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next_token(&mut self) -> Result<Token, SyntaxError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(SyntaxError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn peek_operator(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn skip(&mut self) {
        self.pos += 1;
    }

    fn finished(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

/// Canonical surface syntax: `A AND (B OR NOT C)`. Precedence NOT > AND > OR,
/// left-associative, operators case-insensitive, identifiers case-sensitive.
pub fn parse_infix(input: &str) -> Result<Node, SyntaxError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(SyntaxError::Empty);
    }
    let mut cursor = TokenCursor::new(tokens);
    let node = parse_or_list(&mut cursor, 0)?;
    if !cursor.finished() {
        return Err(SyntaxError::TrailingTokens);
    }
    Ok(node)
}

fn parse_or_list(cursor: &mut TokenCursor, depth: usize) -> Result<Node, SyntaxError> {
    let mut children = vec![parse_and_list(cursor, depth)?];
    while cursor.peek_operator("OR") {
        cursor.skip();
        children.push(parse_and_list(cursor, depth)?);
    }
    // Single-operand lists collapse to the operand itself so that
    // equivalent inputs serialize to identical bytes.
    Ok(match children.len() {
        1 => children.remove(0),
        _ => Node::Or { children },
    })
}

fn parse_and_list(cursor: &mut TokenCursor, depth: usize) -> Result<Node, SyntaxError> {
    let mut children = vec![parse_not(cursor, depth)?];
    while cursor.peek_operator("AND") {
        cursor.skip();
        children.push(parse_not(cursor, depth)?);
    }
    Ok(match children.len() {
        1 => children.remove(0),
        _ => Node::And { children },
    })
}

fn parse_not(cursor: &mut TokenCursor, depth: usize) -> Result<Node, SyntaxError> {
    if cursor.peek_operator("NOT") {
        cursor.skip();
        return Ok(Node::not(parse_primary(cursor, depth)?));
    }
    parse_primary(cursor, depth)
}

fn parse_primary(cursor: &mut TokenCursor, depth: usize) -> Result<Node, SyntaxError> {
    if depth >= MAX_DEPTH {
        return Err(SyntaxError::TooDeep);
    }
    match cursor.next_token()? {
        Token::LParen => {
            let node = parse_or_list(cursor, depth + 1)?;
            match cursor.next_token() {
                Ok(Token::RParen) => Ok(node),
                _ => Err(SyntaxError::ExpectedCloseParen),
            }
        }
        Token::RParen => Err(SyntaxError::UnexpectedToken(")".to_owned())),
        Token::Word(word) if is_operator(&word) => Err(SyntaxError::KeywordAsIdentifier(word)),
        Token::Word(word) => Ok(Node::Leaf { id: word }),
    }
}

/// Legacy surface syntax: fully-parenthesized prefix notation
/// `(AND A (OR B (NOT C)))`. No collapse rule — nesting is preserved
/// exactly as written.
pub fn parse_prefix(input: &str) -> Result<Node, SyntaxError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(SyntaxError::Empty);
    }
    let mut cursor = TokenCursor::new(tokens);
    let node = parse_prefix_node(&mut cursor, 0)?;
    if !cursor.finished() {
        return Err(SyntaxError::TrailingTokens);
    }
    Ok(node)
}

fn parse_prefix_node(cursor: &mut TokenCursor, depth: usize) -> Result<Node, SyntaxError> {
    if depth >= MAX_DEPTH {
        return Err(SyntaxError::TooDeep);
    }
    match cursor.next_token()? {
        Token::LParen => {
            let op = match cursor.next_token()? {
                Token::Word(word) => word,
                other => return Err(SyntaxError::UnexpectedToken(other.render())),
            };
            if op.eq_ignore_ascii_case("AND") {
                let children = parse_prefix_children(cursor, depth, "AND")?;
                Ok(Node::And { children })
            } else if op.eq_ignore_ascii_case("OR") {
                let children = parse_prefix_children(cursor, depth, "OR")?;
                Ok(Node::Or { children })
            } else if op.eq_ignore_ascii_case("NOT") {
                let child = parse_prefix_node(cursor, depth + 1)?;
                match cursor.next_token() {
                    Ok(Token::RParen) => Ok(Node::not(child)),
                    _ => Err(SyntaxError::ExpectedCloseParen),
                }
            } else {
                Err(SyntaxError::UnknownOperator(op))
            }
        }
        Token::RParen => Err(SyntaxError::UnexpectedToken(")".to_owned())),
        Token::Word(word) if is_operator(&word) => Err(SyntaxError::KeywordAsIdentifier(word)),
        Token::Word(word) => Ok(Node::Leaf { id: word }),
    }
}

fn parse_prefix_children(
    cursor: &mut TokenCursor,
    depth: usize,
    op: &'static str,
) -> Result<Vec<Node>, SyntaxError> {
    let mut children = Vec::new();
    loop {
        match cursor.peek() {
            Some(Token::RParen) => {
                cursor.skip();
                break;
            }
            Some(_) => children.push(parse_prefix_node(cursor, depth + 1)?),
            None => return Err(SyntaxError::UnexpectedEnd),
        }
    }
    if children.is_empty() {
        return Err(SyntaxError::MissingChildren(op));
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::{ActiveSet, Node, SyntaxError, parse_infix, parse_prefix};

    fn active(ids: &[&str]) -> ActiveSet {
        ActiveSet::from_ids(ids.iter().copied())
    }

    #[test]
    fn infix_precedence_binds_not_then_and_then_or() {
        let node = parse_infix("A AND B OR NOT C").expect("parse");
        assert_eq!(
            node,
            Node::or(vec![
                Node::and(vec![Node::leaf("A"), Node::leaf("B")]),
                Node::not(Node::leaf("C")),
            ])
        );
    }

    #[test]
    fn infix_parentheses_override_precedence() {
        let node = parse_infix("A AND (B OR NOT C)").expect("parse");
        assert_eq!(
            node,
            Node::and(vec![
                Node::leaf("A"),
                Node::or(vec![Node::leaf("B"), Node::not(Node::leaf("C"))]),
            ])
        );
    }

    #[test]
    fn infix_single_operand_list_collapses_to_the_operand() {
        assert_eq!(parse_infix("A").expect("bare"), Node::leaf("A"));
        assert_eq!(parse_infix("(A)").expect("wrapped"), Node::leaf("A"));
        assert_eq!(parse_infix("((A))").expect("nested"), Node::leaf("A"));
    }

    #[test]
    fn infix_operators_are_case_insensitive_identifiers_are_not() {
        let node = parse_infix("a and A").expect("parse");
        assert_eq!(node, Node::and(vec![Node::leaf("a"), Node::leaf("A")]));
        assert!(node.evaluate(&active(&["a", "A"])));
        assert!(!node.evaluate(&active(&["a"])));
    }

    #[test]
    fn infix_rejects_malformed_inputs() {
        assert_eq!(parse_infix(""), Err(SyntaxError::Empty));
        assert_eq!(parse_infix("   "), Err(SyntaxError::Empty));
        assert_eq!(parse_infix("A AND"), Err(SyntaxError::UnexpectedEnd));
        assert_eq!(parse_infix("(A"), Err(SyntaxError::ExpectedCloseParen));
        assert_eq!(parse_infix("NOT"), Err(SyntaxError::UnexpectedEnd));
        assert_eq!(
            parse_infix("A AND OR"),
            Err(SyntaxError::KeywordAsIdentifier("OR".to_owned()))
        );
        assert_eq!(parse_infix("A B"), Err(SyntaxError::TrailingTokens));
        assert_eq!(parse_infix("A ) B"), Err(SyntaxError::TrailingTokens));
        assert_eq!(parse_infix("A & B"), Err(SyntaxError::UnexpectedCharacter('&')));
    }

    #[test]
    fn prefix_preserves_explicit_nesting_without_collapse() {
        let node = parse_prefix("(AND A (OR B (NOT C)))").expect("parse");
        assert_eq!(
            node,
            Node::and(vec![
                Node::leaf("A"),
                Node::or(vec![Node::leaf("B"), Node::not(Node::leaf("C"))]),
            ])
        );
        assert_eq!(
            parse_prefix("(OR A)").expect("one child"),
            Node::or(vec![Node::leaf("A")])
        );
    }

    #[test]
    fn prefix_operators_accept_any_case() {
        let node = parse_prefix("(and A (not B))").expect("parse");
        assert_eq!(
            node,
            Node::and(vec![Node::leaf("A"), Node::not(Node::leaf("B"))])
        );
    }

    #[test]
    fn prefix_rejects_malformed_inputs() {
        assert_eq!(parse_prefix(""), Err(SyntaxError::Empty));
        assert_eq!(
            parse_prefix("(AND)"),
            Err(SyntaxError::MissingChildren("AND"))
        );
        assert_eq!(parse_prefix("(OR)"), Err(SyntaxError::MissingChildren("OR")));
        assert_eq!(parse_prefix("(NOT)"), Err(SyntaxError::UnexpectedToken(")".to_owned())));
        assert_eq!(
            parse_prefix("(NOT A B)"),
            Err(SyntaxError::ExpectedCloseParen)
        );
        assert_eq!(
            parse_prefix("(XOR A B)"),
            Err(SyntaxError::UnknownOperator("XOR".to_owned()))
        );
        assert_eq!(parse_prefix("(AND A B) C"), Err(SyntaxError::TrailingTokens));
        assert_eq!(parse_prefix("(AND A"), Err(SyntaxError::UnexpectedEnd));
    }

    #[test]
    fn deeply_nested_input_fails_closed_instead_of_recursing() {
        let deep = format!("{}A{}", "(".repeat(4096), ")".repeat(4096));
        assert_eq!(parse_infix(&deep), Err(SyntaxError::TooDeep));

        let deep_prefix = format!("{}A{}", "(NOT ".repeat(4096), ")".repeat(4096));
        assert_eq!(parse_prefix(&deep_prefix), Err(SyntaxError::TooDeep));
    }

    #[test]
    fn tree_evaluation_follows_boolean_semantics() {
        let node = parse_infix("A AND (B OR NOT C)").expect("parse");
        assert!(node.evaluate(&active(&["A", "B"])));
        assert!(node.evaluate(&active(&["A"])));
        assert!(!node.evaluate(&active(&["A", "C"])));
        assert!(!node.evaluate(&active(&["B"])));
    }

    #[test]
    fn and_stops_probing_after_the_first_false_child() {
        let node = parse_infix("A AND B AND C").expect("parse");
        let mut probed = Vec::new();
        let result = node.evaluate_with(&mut |id| {
            probed.push(id.to_owned());
            false
        });
        assert!(!result);
        assert_eq!(probed, vec!["A".to_owned()]);
    }

    #[test]
    fn or_stops_probing_after_the_first_true_child() {
        let node = parse_infix("A OR B OR C").expect("parse");
        let mut probed = Vec::new();
        let result = node.evaluate_with(&mut |id| {
            probed.push(id.to_owned());
            true
        });
        assert!(result);
        assert_eq!(probed, vec!["A".to_owned()]);
    }

    #[test]
    fn active_set_csv_trims_tokens_and_drops_empties() {
        let set = ActiveSet::from_csv(" A , B ,, C ,");
        assert_eq!(set.len(), 3);
        assert!(set.contains("A"));
        assert!(set.contains("B"));
        assert!(set.contains("C"));
        assert!(!set.contains(" A "));

        assert!(ActiveSet::from_csv("").is_empty());
        assert!(ActiveSet::from_csv(" , ,").is_empty());
    }

    #[test]
    fn node_serde_shape_is_tagged_by_kind() {
        let node = Node::not(Node::leaf("A"));
        let json = serde_json::to_value(&node).expect("serialize");
        assert_eq!(json["kind"], "not");
        assert_eq!(json["child"]["kind"], "leaf");
        assert_eq!(json["child"]["id"], "A");
        let back: Node = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, node);
    }
}
