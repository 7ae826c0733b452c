//! Compile-time evaluation of constant values.
//!
//! Supports integer, boolean and string literals, unary `-` and `!`, the
//! binary operators `+ - * / %` with the usual precedence, parentheses, and
//! names of constants declared earlier in the same unit.

use std::collections::HashMap;
use std::fmt;

use kiln_cache::CompileError;

use crate::token::{Token, TokenKind};

/// An evaluated constant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
    /// String value.
    Str(String),
}

impl Value {
    /// The type name of the value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "Int",
            Value::Bool(_) => "Bool",
            Value::Str(_) => "Str",
        }
    }

    /// Returns `true` if a constant declared as `ty` may hold this value.
    pub fn fits(&self, ty: &str) -> bool {
        matches!(
            (self, ty),
            (Value::Int(_), "Int" | "Long") | (Value::Bool(_), "Bool") | (Value::Str(_), "Str")
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// Evaluates a constant expression.
///
/// `known` holds the constants already evaluated in this unit.
pub fn evaluate(
    tokens: &[Token],
    line: usize,
    known: &HashMap<String, Value>,
) -> Result<Value, CompileError> {
    let mut eval = Evaluator {
        tokens,
        pos: 0,
        line,
        known,
    };
    let value = eval.expr()?;
    if eval.pos < tokens.len() {
        return Err(eval.error(format!(
            "unexpected '{}' in constant expression",
            tokens[eval.pos].kind
        )));
    }
    Ok(value)
}

struct Evaluator<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: usize,
    known: &'a HashMap<String, Value>,
}

impl Evaluator<'_> {
    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::at_line(self.line, msg)
    }

    fn peek_punct(&self) -> Option<char> {
        match self.tokens.get(self.pos).map(|t| &t.kind) {
            Some(TokenKind::Punct(c)) => Some(*c),
            _ => None,
        }
    }

    fn expr(&mut self) -> Result<Value, CompileError> {
        let mut lhs = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek_punct() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Value, CompileError> {
        let mut lhs = self.unary()?;
        while let Some(op @ ('*' | '/' | '%')) = self.peek_punct() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Value, CompileError> {
        match self.peek_punct() {
            Some('-') => {
                self.pos += 1;
                match self.unary()? {
                    Value::Int(v) => v
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| self.error("integer overflow in constant expression")),
                    other => Err(self.error(format!("cannot negate a {}", other.type_name()))),
                }
            }
            Some('!') => {
                self.pos += 1;
                match self.unary()? {
                    Value::Bool(v) => Ok(Value::Bool(!v)),
                    other => Err(self.error(format!("cannot apply '!' to a {}", other.type_name()))),
                }
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Value, CompileError> {
        let Some(token) = self.tokens.get(self.pos) else {
            return Err(self.error("incomplete constant expression"));
        };
        self.pos += 1;
        match &token.kind {
            TokenKind::Int(v) => Ok(Value::Int(*v)),
            TokenKind::Str(s) => Ok(Value::Str(s.clone())),
            TokenKind::Ident(w) if w == "true" => Ok(Value::Bool(true)),
            TokenKind::Ident(w) if w == "false" => Ok(Value::Bool(false)),
            TokenKind::Ident(name) => self
                .known
                .get(name)
                .cloned()
                .ok_or_else(|| self.error(format!("'{name}' is not a constant of this unit"))),
            TokenKind::Punct('(') => {
                let value = self.expr()?;
                if self.peek_punct() != Some(')') {
                    return Err(self.error("expected ')' in constant expression"));
                }
                self.pos += 1;
                Ok(value)
            }
            other => Err(self.error(format!("'{other}' is not allowed in a constant expression"))),
        }
    }

    fn binary(&self, op: char, lhs: Value, rhs: Value) -> Result<Value, CompileError> {
        match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                let result = match op {
                    '+' => a.checked_add(b),
                    '-' => a.checked_sub(b),
                    '*' => a.checked_mul(b),
                    '/' | '%' if b == 0 => {
                        return Err(self.error("division by zero in constant expression"))
                    }
                    '/' => a.checked_div(b),
                    _ => a.checked_rem(b),
                };
                result
                    .map(Value::Int)
                    .ok_or_else(|| self.error("integer overflow in constant expression"))
            }
            (Value::Str(a), Value::Str(b)) if op == '+' => Ok(Value::Str(a + &b)),
            (a, b) => Err(self.error(format!(
                "cannot apply '{op}' to {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }
}
