//! Lexical analyzer for kiln source text.
//!
//! Whitespace and `#` line comments are skipped. `module::name` is lexed as a
//! single [`TokenKind::Path`] token so the parser never has to reassemble it.

use kiln_cache::CompileError;

use crate::token::{Token, TokenKind};

/// Lexes `source` into tokens, stopping at the first lexical error.
pub fn lex(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut lexer = Lexer {
        source: source.as_bytes(),
        pos: 0,
        line: 1,
    };
    lexer.lex_all()
}

struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: usize,
}

impl Lexer<'_> {
    fn lex_all(&mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            if self.pos >= self.source.len() {
                return Ok(tokens);
            }
            let line = self.line;
            let kind = self.next_kind()?;
            tokens.push(Token { kind, line });
        }
    }

    fn peek(&self) -> u8 {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> u8 {
        self.source.get(self.pos + offset).copied().unwrap_or(0)
    }

    fn advance(&mut self) -> u8 {
        let b = self.source[self.pos];
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        b
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::at_line(self.line, msg)
    }

    fn skip_whitespace_and_comments(&mut self) {
        while self.pos < self.source.len() {
            match self.peek() {
                b if b.is_ascii_whitespace() => {
                    self.advance();
                }
                b'#' => {
                    while self.pos < self.source.len() && self.peek() != b'\n' {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn next_kind(&mut self) -> Result<TokenKind, CompileError> {
        let b = self.peek();
        if b.is_ascii_alphabetic() || b == b'_' {
            let first = self.ident();
            if self.peek() == b':' && self.peek_at(1) == b':' {
                self.pos += 2;
                let b = self.peek();
                if !(b.is_ascii_alphabetic() || b == b'_') {
                    return Err(self.error(format!("expected a name after '{first}::'")));
                }
                let second = self.ident();
                return Ok(TokenKind::Path(first, second));
            }
            return Ok(TokenKind::Ident(first));
        }
        if b.is_ascii_digit() {
            return self.number();
        }
        match b {
            b'"' => self.string(),
            b'-' if self.peek_at(1) == b'>' => {
                self.pos += 2;
                Ok(TokenKind::Arrow)
            }
            b'@' => {
                self.advance();
                Ok(TokenKind::At)
            }
            b'(' | b')' | b'{' | b'}' | b',' | b':' | b'=' | b'+' | b'-' | b'*' | b'/' | b'<'
            | b'>' | b';' | b'!' | b'%' | b'.' | b'[' | b']' | b'&' | b'|' => {
                self.advance();
                Ok(TokenKind::Punct(b as char))
            }
            _ => {
                let c = std::str::from_utf8(&self.source[self.pos..])
                    .ok()
                    .and_then(|s| s.chars().next())
                    .unwrap_or(char::REPLACEMENT_CHARACTER);
                Err(self.error(format!("unexpected character '{c}'")))
            }
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.source[start..self.pos]).into_owned()
    }

    fn number(&mut self) -> Result<TokenKind, CompileError> {
        let start = self.pos;
        while self.peek().is_ascii_digit() || self.peek() == b'_' {
            self.pos += 1;
        }
        let digits: String = self.source[start..self.pos]
            .iter()
            .filter(|b| **b != b'_')
            .map(|b| *b as char)
            .collect();
        digits
            .parse()
            .map(TokenKind::Int)
            .map_err(|_| self.error(format!("integer literal '{digits}' out of range")))
    }

    fn string(&mut self) -> Result<TokenKind, CompileError> {
        let start_line = self.line;
        self.advance();
        let mut bytes = Vec::new();
        loop {
            if self.pos >= self.source.len() {
                return Err(CompileError::at_line(start_line, "unterminated string literal"));
            }
            match self.advance() {
                b'"' => break,
                b'\\' => {
                    if self.pos >= self.source.len() {
                        return Err(CompileError::at_line(start_line, "unterminated string literal"));
                    }
                    bytes.push(match self.advance() {
                        b'n' => b'\n',
                        b't' => b'\t',
                        other => other,
                    });
                }
                other => bytes.push(other),
            }
        }
        Ok(TokenKind::Str(String::from_utf8_lossy(&bytes).into_owned()))
    }
}
