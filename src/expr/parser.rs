//! Pratt parser producing the expression AST.

use super::lexer::{tokenize, Token};
use super::ExprError;
use crate::core::types::Value;

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    fn from_token(token: &Token) -> Option<Self> {
        Some(match token {
            Token::OrOr => Self::Or,
            Token::AndAnd => Self::And,
            Token::EqEq => Self::Eq,
            Token::NotEq => Self::Ne,
            Token::Lt => Self::Lt,
            Token::Le => Self::Le,
            Token::Gt => Self::Gt,
            Token::Ge => Self::Ge,
            Token::In => Self::In,
            Token::Plus => Self::Add,
            Token::Minus => Self::Sub,
            Token::Star => Self::Mul,
            Token::Slash => Self::Div,
            Token::Percent => Self::Rem,
            _ => return None,
        })
    }

    /// Left binding power. Relations share one level.
    fn precedence(&self) -> u8 {
        match self {
            Self::Or => 2,
            Self::And => 3,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge | Self::In => 4,
            Self::Add | Self::Sub => 5,
            Self::Mul | Self::Div | Self::Rem => 6,
        }
    }
}

/// Expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        target: Option<Box<Expr>>,
        function: String,
        args: Vec<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
}

impl Expr {
    /// Visit every identifier the expression reads.
    pub fn identifiers(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ident(name) => out.push(name.clone()),
            Expr::Member(target, _) => target.identifiers(out),
            Expr::Index(target, index) => {
                target.identifiers(out);
                index.identifiers(out);
            }
            Expr::Call { target, args, .. } => {
                if let Some(t) = target {
                    t.identifiers(out);
                }
                args.iter().for_each(|a| a.identifiers(out));
            }
            Expr::Unary(_, e) => e.identifiers(out),
            Expr::Binary(_, l, r) => {
                l.identifiers(out);
                r.identifiers(out);
            }
            Expr::Ternary(c, t, e) => {
                c.identifiers(out);
                t.identifiers(out);
                e.identifiers(out);
            }
            Expr::List(items) => items.iter().for_each(|i| i.identifiers(out)),
            Expr::Map(entries) => entries.iter().for_each(|(k, v)| {
                k.identifiers(out);
                v.identifiers(out);
            }),
        }
    }
}

/// Nesting limit for pathological inputs.
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    depth: usize,
}

/// Parse a full expression.
pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source).map_err(|(e, offset)| ExprError::Lex {
        offset,
        message: e.to_string(),
    })?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.len(),
        depth: 0,
    };
    let expr = parser.expression()?;
    if let Some((token, offset)) = parser.peek_with_offset() {
        return Err(ExprError::Parse {
            offset,
            message: format!("unexpected trailing token {}", token),
        });
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_with_offset(&self) -> Option<(Token, usize)> {
        self.tokens.get(self.pos).cloned()
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, o)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        if self.eat(&expected) {
            return Ok(());
        }
        Err(self.error(format!("expected {}", expected)))
    }

    fn error(&self, message: String) -> ExprError {
        let message = match self.peek() {
            Some(t) => format!("{}, found {}", message, t),
            None => format!("{}, found end of input", message),
        };
        ExprError::Parse {
            offset: self.offset(),
            message,
        }
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply".to_string()));
        }
        let result = self.ternary();
        self.depth -= 1;
        result
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.binary(0)?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then = self.expression()?;
        self.expect(Token::Colon)?;
        let otherwise = self.expression()?;
        Ok(Expr::Ternary(
            Box::new(cond),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        while let Some(op) = self.peek().and_then(BinaryOp::from_token) {
            let prec = op.precedence();
            if prec <= min_prec {
                break;
            }
            self.pos += 1;
            let right = self.binary(prec)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Bang) {
            let e = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(e)));
        }
        if self.eat(&Token::Minus) {
            let e = self.unary()?;
            return Ok(match e {
                Expr::Literal(Value::Int(i)) => Expr::Literal(Value::Int(-i)),
                Expr::Literal(Value::Float(x)) => Expr::Literal(Value::Float(-x)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let field = match self.peek() {
                    Some(Token::Ident(name)) => name.clone(),
                    Some(Token::Int(i)) => i.to_string(),
                    _ => return Err(self.error("expected field name after '.'".to_string())),
                };
                self.pos += 1;
                if self.eat(&Token::LParen) {
                    let args = self.arguments(Token::RParen)?;
                    expr = Expr::Call {
                        target: Some(Box::new(expr)),
                        function: field,
                        args,
                    };
                } else {
                    expr = Expr::Member(Box::new(expr), field);
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(x)) => Ok(Expr::Literal(Value::Float(x))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let args = self.arguments(Token::RParen)?;
                    Ok(Expr::Call {
                        target: None,
                        function: name,
                        args,
                    })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let e = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(e)
            }
            Some(Token::LBracket) => Ok(Expr::List(self.arguments(Token::RBracket)?)),
            Some(Token::LBrace) => self.map_literal(),
            Some(token) => Err(ExprError::Parse {
                offset,
                message: format!("unexpected token {}", token),
            }),
            None => Err(ExprError::Parse {
                offset,
                message: "unexpected end of input".to_string(),
            }),
        }
    }

    /// Comma separated expressions up to `close`; a trailing comma is allowed.
    fn arguments(&mut self, close: Token) -> Result<Vec<Expr>, ExprError> {
        let mut items = Vec::new();
        while !self.eat(&close) {
            items.push(self.expression()?);
            if !self.eat(&Token::Comma) {
                self.expect(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn map_literal(&mut self) -> Result<Expr, ExprError> {
        let mut entries = Vec::new();
        while !self.eat(&Token::RBrace) {
            let key = self.expression()?;
            self.expect(Token::Colon)?;
            let value = self.expression()?;
            entries.push((key, value));
            if !self.eat(&Token::Comma) {
                self.expect(Token::RBrace)?;
                break;
            }
        }
        Ok(Expr::Map(entries))
    }
}
