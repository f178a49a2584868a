//! Small arithmetic expression language for derived attributes and aggregates.
//!
//! Supports numbers, single-quoted strings, identifiers (dotted references
//! allowed), `+ - * / %`, unary minus and parentheses.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

use crate::error::{CubistError, Result};
use crate::sql_ast::{SqlBinaryOperator, SqlExpr};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Neg(Box<Expr>),
    Binary {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArithOp::Add => "+",
            ArithOp::Subtract => "-",
            ArithOp::Multiply => "*",
            ArithOp::Divide => "/",
            ArithOp::Modulo => "%",
        };
        f.write_str(s)
    }
}

impl Expr {
    /// Identifiers referenced by the expression.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ident(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(inner) => inner.collect_variables(out),
            Expr::Binary { left, right, .. } => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
        }
    }

    /// Rewrite every identifier through `f`.
    pub fn map_idents<F>(self, f: &F) -> Expr
    where
        F: Fn(String) -> String,
    {
        match self {
            Expr::Literal(v) => Expr::Literal(v),
            Expr::Ident(name) => Expr::Ident(f(name)),
            Expr::Neg(inner) => Expr::Neg(Box::new(inner.map_idents(f))),
            Expr::Binary { op, left, right } => Expr::Binary {
                op,
                left: Box::new(left.map_idents(f)),
                right: Box::new(right.map_idents(f)),
            },
        }
    }

    /// Compile to SQL, resolving identifiers through `resolve`. Division is
    /// guarded against a zero divisor.
    pub fn to_sql<F>(&self, resolve: &mut F) -> Result<SqlExpr>
    where
        F: FnMut(&str) -> Result<SqlExpr>,
    {
        Ok(match self {
            Expr::Literal(v) => SqlExpr::Literal(v.clone()),
            Expr::Ident(name) => resolve(name)?,
            Expr::Neg(inner) => SqlExpr::Negate(Box::new(inner.to_sql(resolve)?)),
            Expr::Binary { op, left, right } => {
                let left = left.to_sql(resolve)?;
                let right = right.to_sql(resolve)?;
                match op {
                    ArithOp::Add => SqlExpr::binary(SqlBinaryOperator::Add, left, right),
                    ArithOp::Subtract => SqlExpr::binary(SqlBinaryOperator::Subtract, left, right),
                    ArithOp::Multiply => SqlExpr::binary(SqlBinaryOperator::Multiply, left, right),
                    ArithOp::Divide => SqlExpr::safe_divide(left, right),
                    ArithOp::Modulo => SqlExpr::binary(SqlBinaryOperator::Modulo, left, right),
                }
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Value),
    Str(String),
    Ident(String),
    Op(ArithOp),
    LParen,
    RParen,
}

pub fn parse_expr(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source: input,
    };
    let expr = parser.parse_sum()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Op(ArithOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(ArithOp::Subtract));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(ArithOp::Multiply));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(ArithOp::Divide));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Op(ArithOp::Modulo));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                        None => {
                            return Err(CubistError::Model(format!(
                                "unterminated string in expression '{input}'"
                            )))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(parse_number(&text, input)?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text.ends_with('.') {
                    return Err(CubistError::Model(format!(
                        "invalid identifier '{text}' in expression '{input}'"
                    )));
                }
                tokens.push(Token::Ident(text));
            }
            other => {
                return Err(CubistError::Model(format!(
                    "unexpected character '{other}' in expression '{input}'"
                )))
            }
        }
    }
    Ok(tokens)
}

fn parse_number(text: &str, source: &str) -> Result<Value> {
    if let Ok(v) = text.parse::<i64>() {
        return Ok(Value::from(v));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| {
            CubistError::Model(format!("invalid number '{text}' in expression '{source}'"))
        })
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> CubistError {
        CubistError::Model(format!("{msg} in expression '{}'", self.source))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_sum(&mut self) -> Result<Expr> {
        let mut left = self.parse_product()?;
        while let Some(Token::Op(op @ (ArithOp::Add | ArithOp::Subtract))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_product()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(op @ (ArithOp::Multiply | ArithOp::Divide | ArithOp::Modulo))) =
            self.peek()
        {
            let op = *op;
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Op(ArithOp::Subtract)) = self.peek() {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Literal(v)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_sum()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(_) => Err(self.error("unexpected token")),
            None => Err(self.error("unexpected end")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DuckDbDialect;
    use crate::sql_ast::SqlRenderer;

    #[test]
    fn compiles_division_with_guard() {
        let expr = parse_expr("(a - b) / c").unwrap();
        let sql = expr
            .to_sql(&mut |name: &str| Ok(SqlExpr::column(Some("t"), name)))
            .unwrap();
        assert_eq!(
            SqlRenderer::new(&DuckDbDialect).render_expr(&sql),
            "((\"t\".\"a\" - \"t\".\"b\") / nullif(\"t\".\"c\", 0))"
        );
    }

    #[test]
    fn compile_propagates_resolution_errors() {
        let expr = parse_expr("a + 1").unwrap();
        let err = expr
            .to_sql(&mut |name: &str| Err(CubistError::NoSuchAttribute(name.to_string())))
            .unwrap_err();
        assert!(matches!(err, CubistError::NoSuchAttribute(n) if n == "a"));
    }

    #[test]
    fn parses_precedence() {
        let expr = parse_expr("a + b * 2").unwrap();
        match expr {
            Expr::Binary {
                op: ArithOp::Add,
                right,
                ..
            } => assert!(matches!(
                *right,
                Expr::Binary {
                    op: ArithOp::Multiply,
                    ..
                }
            )),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn collects_dotted_variables() {
        let expr = parse_expr("(date.year * 100) + month - -1").unwrap();
        let vars: Vec<_> = expr.variables().into_iter().collect();
        assert_eq!(vars, vec!["date.year".to_string(), "month".to_string()]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_expr("a +").is_err());
        assert!(parse_expr("a $ b").is_err());
        assert!(parse_expr("(a").is_err());
        assert!(parse_expr("'open").is_err());
    }

    #[test]
    fn string_literal_with_escape() {
        assert_eq!(
            parse_expr("'it''s'").unwrap(),
            Expr::Literal(Value::String("it's".to_string()))
        );
    }
}
