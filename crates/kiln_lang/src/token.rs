//! Token types for kiln source text.

use std::fmt;

/// One lexical token kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// A plain identifier or keyword.
    Ident(String),
    /// A qualified `module::name` path.
    Path(String, String),
    /// An integer literal.
    Int(i64),
    /// A string literal, unescaped.
    Str(String),
    /// `->`
    Arrow,
    /// `@`
    At,
    /// Any other single punctuation character.
    Punct(char),
}

/// A token with its 1-based source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    /// The token kind.
    pub kind: TokenKind,
    /// 1-based line the token starts on.
    pub line: usize,
}

impl Token {
    /// Returns `true` if this is the identifier `word`.
    pub fn is_ident(&self, word: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(w) if w == word)
    }

    /// Returns `true` if this is the punctuation `c`.
    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }
}

/// Words with a fixed meaning that never name a declaration.
pub const KEYWORDS: &[&str] = &[
    "pub", "internal", "fn", "const", "type", "let", "if", "else", "return", "true", "false",
];

/// Returns `true` if `word` is a keyword.
pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

/// Built-in type names; they never produce references.
pub const BUILTIN_TYPES: &[&str] = &["Int", "Long", "Bool", "Str", "Unit"];

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(w) => f.write_str(w),
            TokenKind::Path(m, n) => write!(f, "{m}::{n}"),
            TokenKind::Int(v) => write!(f, "{v}"),
            TokenKind::Str(s) => write!(f, "{s:?}"),
            TokenKind::Arrow => f.write_str("->"),
            TokenKind::At => f.write_str("@"),
            TokenKind::Punct(c) => write!(f, "{c}"),
        }
    }
}
