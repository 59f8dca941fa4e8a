// src/guard.rs
//
// The guard language is deliberately closed: status atoms on upstream nodes,
// branch-label equality for `route` outputs, `!`, `&&`, `||` and parentheses.
// Nothing else evaluates, so a guard can never reach into arbitrary state.
//
//   expr   := or
//   or     := and ( "||" and )*
//   and    := unary ( "&&" unary )*
//   unary  := "!" unary | atom
//   atom   := ident "." status | ident ".branch" "==" string | "(" expr ")"
//   status := "succeeded" | "failed" | "skipped"

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStatus {
    Succeeded,
    Failed,
    Skipped,
    /// The node has no recorded result. Counts as "not succeeded".
    Unknown,
}

/// What a guard is allowed to see: terminal upstream statuses and route
/// branch labels. The engine implements this over its results map.
pub trait GuardScope {
    fn status(&self, node: &str) -> GuardStatus;
    fn branch(&self, node: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Guard {
    Status { node: String, status: StatusAtom },
    Branch { node: String, label: String },
    Not(Box<Guard>),
    And(Box<Guard>, Box<Guard>),
    Or(Box<Guard>, Box<Guard>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusAtom {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GuardParseError {
    #[error("unexpected end of guard expression")]
    UnexpectedEnd,
    #[error("unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("unknown status `{0}`, expected succeeded/failed/skipped")]
    UnknownStatus(String),
    #[error("unterminated string literal")]
    UnterminatedString,
}

impl Guard {
    pub fn parse(input: &str) -> Result<Guard, GuardParseError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        match parser.peek() {
            None => Ok(expr),
            Some(tok) => Err(GuardParseError::UnexpectedToken(tok.text())),
        }
    }

    pub fn eval(&self, scope: &dyn GuardScope) -> bool {
        match self {
            Guard::Status { node, status } => {
                let actual = scope.status(node);
                match status {
                    StatusAtom::Succeeded => actual == GuardStatus::Succeeded,
                    StatusAtom::Failed => actual == GuardStatus::Failed,
                    StatusAtom::Skipped => actual == GuardStatus::Skipped,
                }
            }
            Guard::Branch { node, label } => scope.branch(node).as_deref() == Some(label),
            Guard::Not(inner) => !inner.eval(scope),
            Guard::And(a, b) => a.eval(scope) && b.eval(scope),
            Guard::Or(a, b) => a.eval(scope) || b.eval(scope),
        }
    }

    /// Node ids this guard reads, for dependency checks.
    pub fn referenced_nodes(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out.dedup();
        out
    }

    fn collect_refs(&self, out: &mut Vec<String>) {
        match self {
            Guard::Status { node, .. } | Guard::Branch { node, .. } => out.push(node.clone()),
            Guard::Not(inner) => inner.collect_refs(out),
            Guard::And(a, b) | Guard::Or(a, b) => {
                a.collect_refs(out);
                b.collect_refs(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Dot,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    LParen,
    RParen,
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Str(s) => format!("\"{s}\""),
            Token::Dot => ".".into(),
            Token::Bang => "!".into(),
            Token::AndAnd => "&&".into(),
            Token::OrOr => "||".into(),
            Token::EqEq => "==".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, GuardParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Bang);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(GuardParseError::UnexpectedToken("&".into()));
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(GuardParseError::UnexpectedToken("|".into()));
                }
                tokens.push(Token::OrOr);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(GuardParseError::UnexpectedToken("=".into()));
                }
                tokens.push(Token::EqEq);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err(GuardParseError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            other => return Err(GuardParseError::UnexpectedToken(other.to_string())),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), GuardParseError> {
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            Some(tok) => Err(GuardParseError::UnexpectedToken(tok.text())),
            None => Err(GuardParseError::UnexpectedEnd),
        }
    }

    fn or_expr(&mut self) -> Result<Guard, GuardParseError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.and_expr()?;
            left = Guard::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Guard, GuardParseError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.unary()?;
            left = Guard::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Guard, GuardParseError> {
        if self.peek() == Some(&Token::Bang) {
            self.next();
            return Ok(Guard::Not(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Guard, GuardParseError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(node)) => {
                self.expect(Token::Dot)?;
                match self.next() {
                    Some(Token::Ident(field)) if field == "branch" => {
                        self.expect(Token::EqEq)?;
                        match self.next() {
                            Some(Token::Str(label)) => Ok(Guard::Branch { node, label }),
                            Some(tok) => Err(GuardParseError::UnexpectedToken(tok.text())),
                            None => Err(GuardParseError::UnexpectedEnd),
                        }
                    }
                    Some(Token::Ident(status)) => {
                        let status = match status.as_str() {
                            "succeeded" => StatusAtom::Succeeded,
                            "failed" => StatusAtom::Failed,
                            "skipped" => StatusAtom::Skipped,
                            other => return Err(GuardParseError::UnknownStatus(other.to_string())),
                        };
                        Ok(Guard::Status { node, status })
                    }
                    Some(tok) => Err(GuardParseError::UnexpectedToken(tok.text())),
                    None => Err(GuardParseError::UnexpectedEnd),
                }
            }
            Some(tok) => Err(GuardParseError::UnexpectedToken(tok.text())),
            None => Err(GuardParseError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapScope {
        statuses: HashMap<String, GuardStatus>,
        branches: HashMap<String, String>,
    }

    impl MapScope {
        fn new() -> Self {
            Self { statuses: HashMap::new(), branches: HashMap::new() }
        }

        fn with_status(mut self, node: &str, status: GuardStatus) -> Self {
            self.statuses.insert(node.to_string(), status);
            self
        }

        fn with_branch(mut self, node: &str, label: &str) -> Self {
            self.branches.insert(node.to_string(), label.to_string());
            self
        }
    }

    impl GuardScope for MapScope {
        fn status(&self, node: &str) -> GuardStatus {
            self.statuses.get(node).copied().unwrap_or(GuardStatus::Unknown)
        }

        fn branch(&self, node: &str) -> Option<String> {
            self.branches.get(node).cloned()
        }
    }

    #[test]
    fn parses_simple_status_atom() {
        let guard = Guard::parse("n1.succeeded").unwrap();
        assert_eq!(
            guard,
            Guard::Status { node: "n1".into(), status: StatusAtom::Succeeded }
        );
    }

    #[test]
    fn precedence_not_binds_tighter_than_and_than_or() {
        let guard = Guard::parse("!a.failed && b.succeeded || c.skipped").unwrap();
        // (((!a.failed) && b.succeeded) || c.skipped)
        match guard {
            Guard::Or(left, _) => match *left {
                Guard::And(not, _) => assert!(matches!(*not, Guard::Not(_))),
                other => panic!("expected And on the left, got {:?}", other),
            },
            other => panic!("expected Or at the top, got {:?}", other),
        }
    }

    #[test]
    fn evaluates_against_scope() {
        let scope = MapScope::new()
            .with_status("n1", GuardStatus::Succeeded)
            .with_status("n2", GuardStatus::Failed);

        assert!(Guard::parse("n1.succeeded").unwrap().eval(&scope));
        assert!(Guard::parse("n2.failed").unwrap().eval(&scope));
        assert!(!Guard::parse("n2.succeeded").unwrap().eval(&scope));
        assert!(Guard::parse("n1.succeeded && !n2.succeeded").unwrap().eval(&scope));
        assert!(Guard::parse("(n1.failed || n2.failed) && n1.succeeded").unwrap().eval(&scope));
    }

    #[test]
    fn unknown_node_is_not_succeeded() {
        let scope = MapScope::new();
        assert!(!Guard::parse("ghost.succeeded").unwrap().eval(&scope));
        assert!(!Guard::parse("ghost.failed").unwrap().eval(&scope));
    }

    #[test]
    fn branch_equality() {
        let scope = MapScope::new()
            .with_status("r1", GuardStatus::Succeeded)
            .with_branch("r1", "high");

        assert!(Guard::parse("r1.branch == \"high\"").unwrap().eval(&scope));
        assert!(!Guard::parse("r1.branch == 'low'").unwrap().eval(&scope));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(Guard::parse("n1.").is_err());
        assert!(Guard::parse("n1.running").is_err());
        assert!(Guard::parse("n1.succeeded &&").is_err());
        assert!(Guard::parse("(n1.succeeded").is_err());
        assert!(Guard::parse("n1.branch == high").is_err());
        assert!(Guard::parse("n1.succeeded n2.failed").is_err());
    }

    #[test]
    fn referenced_nodes_lists_reads() {
        let guard = Guard::parse("a.succeeded && (b.failed || a.skipped)").unwrap();
        let mut refs = guard.referenced_nodes();
        refs.sort();
        refs.dedup();
        assert_eq!(refs, vec!["a".to_string(), "b".to_string()]);
    }
}
