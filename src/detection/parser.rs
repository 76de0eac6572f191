use std::{fmt, sync::Arc};

use thiserror::Error;

use super::{
    clauses::{BoundClause, ClauseRegistry},
    lexer::Token,
};

/// One atomic clause. `clause` is `None` when no registered shape recognised the
/// text; such atoms evaluate as unsupported.
#[derive(Clone)]
pub struct Atom {
    pub text: String,
    pub clause: Option<Arc<dyn BoundClause>>,
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("text", &self.text)
            .field("kind", &self.clause.as_ref().map(|c| c.clause_type()))
            .finish()
    }
}

impl Atom {
    pub fn unsupported(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            clause: None,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.clause.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Atom(Atom),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    pub fn atoms(&self) -> Vec<&Atom> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a Atom>) {
        match self {
            Expr::Atom(atom) => out.push(atom),
            Expr::Not(inner) => inner.collect_atoms(out),
            Expr::And(children) | Expr::Or(children) => {
                for child in children {
                    child.collect_atoms(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected {0} at token {1}")]
    Unexpected(&'static str, usize),
    #[error("missing closing parenthesis")]
    UnclosedGroup,
    #[error("trailing tokens after expression")]
    Trailing,
}

/// Parses `Or := And (OR And)*`, `And := Unary (AND Unary)*`,
/// `Unary := NOT Unary | "(" Or ")" | Clause`, binding every clause through the
/// registry.
pub fn parse(tokens: &[Token], registry: &ClauseRegistry) -> Result<Expr, ParseError> {
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        registry,
    };
    let expr = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(ParseError::Trailing);
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    registry: &'a ClauseRegistry,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut children = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.pos += 1;
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            Expr::Or(children)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut children = vec![self.parse_unary()?];
        while matches!(self.peek(), Some(Token::And)) {
            self.pos += 1;
            children.push(self.parse_unary()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            Expr::And(children)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let at = self.pos;
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(ParseError::UnclosedGroup),
                }
            }
            Some(Token::Clause(text)) => {
                self.pos += 1;
                Ok(Expr::Atom(Atom {
                    text: text.clone(),
                    clause: self.registry.bind(text),
                }))
            }
            Some(Token::And) => Err(ParseError::Unexpected("AND", at)),
            Some(Token::Or) => Err(ParseError::Unexpected("OR", at)),
            Some(Token::RParen) => Err(ParseError::Unexpected("')'", at)),
            None => Err(ParseError::Unexpected("end of input", at)),
        }
    }
}
