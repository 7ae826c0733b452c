//! Recursive-descent parser producing a [`SourceFile`].

use kiln_cache::{CompileError, Visibility};

use crate::ast::{Item, ItemKind, Param, SourceFile, TypeRef};
use crate::lexer::lex;
use crate::token::{is_keyword, Token, TokenKind};

/// Parses one source unit.
pub fn parse(source: &str) -> Result<SourceFile, CompileError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_file()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse_file(&mut self) -> Result<SourceFile, CompileError> {
        let mut items = Vec::new();
        while !self.at_end() {
            items.push(self.parse_item()?);
        }
        Ok(SourceFile { items })
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Line of the current token, or of the last one at end of input.
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::at_line(self.line(), msg)
    }

    fn found(&self) -> String {
        match self.peek() {
            Some(t) => format!("'{}'", t.kind),
            None => "end of input".to_string(),
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), CompileError> {
        match self.peek() {
            Some(t) if t.is_punct(c) => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error(format!("expected '{c}', found {}", self.found()))),
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek().is_some_and(|t| t.is_punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_ident(word)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_name(&mut self, what: &str) -> Result<String, CompileError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Ident(name)) if !is_keyword(name) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(format!("expected {what}, found {}", self.found()))),
        }
    }

    fn parse_item(&mut self) -> Result<Item, CompileError> {
        let mut annotations = Vec::new();
        while self.peek().is_some_and(|t| t.kind == TokenKind::At) {
            self.pos += 1;
            annotations.push(self.expect_name("an annotation name")?);
        }

        let visibility = if self.eat_ident("pub") {
            Visibility::Public
        } else if self.eat_ident("internal") {
            Visibility::Internal
        } else {
            Visibility::Private
        };

        let line = self.line();
        let (name, kind) = if self.eat_ident("fn") {
            let name = self.expect_name("a function name")?;
            return self.parse_function(annotations, visibility, name, line);
        } else if self.eat_ident("const") {
            let name = self.expect_name("a constant name")?;
            self.expect_punct(':')?;
            let ty = self.parse_type()?;
            self.expect_punct('=')?;
            let value = self.rest_of_line(line)?;
            (name, ItemKind::Constant { ty, value })
        } else if self.eat_ident("type") {
            let name = self.expect_name("a type name")?;
            self.expect_punct('=')?;
            let definition = self.parse_type()?;
            (name, ItemKind::Type { definition })
        } else if !annotations.is_empty() && self.at_end() {
            return Err(self.error("annotation is not followed by a declaration"));
        } else {
            return Err(self.error(format!(
                "expected 'fn', 'const' or 'type', found {}",
                self.found()
            )));
        };

        Ok(Item {
            annotations,
            visibility,
            name,
            kind,
            line,
        })
    }

    fn parse_function(
        &mut self,
        annotations: Vec<String>,
        visibility: Visibility,
        name: String,
        line: usize,
    ) -> Result<Item, CompileError> {
        self.expect_punct('(')?;
        let mut params = Vec::new();
        while !self.eat_punct(')') {
            let param_name = self.expect_name("a parameter name")?;
            self.expect_punct(':')?;
            let ty = self.parse_type()?;
            let default = if self.eat_punct('=') {
                Some(self.default_value()?)
            } else {
                None
            };
            params.push(Param {
                name: param_name,
                ty,
                default,
            });
            if !self.eat_punct(',') {
                self.expect_punct(')')?;
                break;
            }
        }

        let ret = if self.peek().is_some_and(|t| t.kind == TokenKind::Arrow) {
            self.pos += 1;
            Some(self.parse_type()?)
        } else {
            None
        };

        let body = self.block()?;
        Ok(Item {
            annotations,
            visibility,
            name,
            kind: ItemKind::Function { params, ret, body },
            line,
        })
    }

    fn parse_type(&mut self) -> Result<TypeRef, CompileError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Ident(name)) if !is_keyword(name) => {
                let ty = TypeRef::Named(name.clone());
                self.pos += 1;
                Ok(ty)
            }
            Some(TokenKind::Path(module, name)) => {
                let ty = TypeRef::Qualified {
                    module: module.clone(),
                    name: name.clone(),
                };
                self.pos += 1;
                Ok(ty)
            }
            _ => Err(self.error(format!("expected a type, found {}", self.found()))),
        }
    }

    /// Tokens of a default value, up to the next `,` or `)` outside parentheses.
    fn default_value(&mut self) -> Result<Vec<Token>, CompileError> {
        let mut depth = 0usize;
        let mut tokens = Vec::new();
        while let Some(token) = self.peek() {
            if depth == 0 && (token.is_punct(',') || token.is_punct(')')) {
                break;
            }
            if token.is_punct('(') {
                depth += 1;
            } else if token.is_punct(')') {
                depth -= 1;
            }
            if let Some(token) = self.bump() {
                tokens.push(token);
            }
        }
        if tokens.is_empty() {
            return Err(self.error("expected a default value"));
        }
        Ok(tokens)
    }

    /// Tokens between a `{` and its matching `}`.
    fn block(&mut self) -> Result<Vec<Token>, CompileError> {
        let open_line = self.line();
        self.expect_punct('{')?;
        let mut depth = 1usize;
        let mut tokens = Vec::new();
        while let Some(token) = self.bump() {
            if token.is_punct('{') {
                depth += 1;
            } else if token.is_punct('}') {
                depth -= 1;
                if depth == 0 {
                    return Ok(tokens);
                }
            }
            tokens.push(token);
        }
        Err(CompileError::at_line(open_line, "unclosed '{'"))
    }

    /// Remaining tokens on `line`; constants end at the end of their line.
    fn rest_of_line(&mut self, line: usize) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();
        while self.peek().is_some_and(|t| t.line == line) {
            if let Some(token) = self.bump() {
                tokens.push(token);
            }
        }
        if tokens.is_empty() {
            return Err(CompileError::at_line(line, "expected a constant value"));
        }
        Ok(tokens)
    }
}
