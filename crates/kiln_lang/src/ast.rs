//! Syntax tree of one kiln source unit.

use std::fmt;

use kiln_cache::Visibility;

use crate::token::Token;

/// A parsed source unit.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SourceFile {
    /// Declarations in source order.
    pub items: Vec<Item>,
}

/// One declaration with its leading annotations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    /// Annotation names in source order, without `@`.
    pub annotations: Vec<String>,
    /// Declared visibility.
    pub visibility: Visibility,
    /// Declared name.
    pub name: String,
    /// What is declared.
    pub kind: ItemKind,
    /// Line of the declaration keyword.
    pub line: usize,
}

/// The declaration-specific part of an [`Item`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemKind {
    /// `fn name(params) -> ret { body }`
    Function {
        /// Parameters in order.
        params: Vec<Param>,
        /// Declared result type; `Unit` when omitted.
        ret: Option<TypeRef>,
        /// Tokens between the braces.
        body: Vec<Token>,
    },
    /// `const NAME: Type = value`
    Constant {
        /// Declared type.
        ty: TypeRef,
        /// Tokens of the value expression.
        value: Vec<Token>,
    },
    /// `type Name = Type`
    Type {
        /// The aliased type.
        definition: TypeRef,
    },
}

impl ItemKind {
    /// The keyword introducing this kind of declaration.
    pub fn keyword(&self) -> &'static str {
        match self {
            ItemKind::Function { .. } => "fn",
            ItemKind::Constant { .. } => "const",
            ItemKind::Type { .. } => "type",
        }
    }
}

/// A function parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Parameter type.
    pub ty: TypeRef,
    /// Tokens of the default value, if one is declared.
    pub default: Option<Vec<Token>>,
}

/// A reference to a type by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeRef {
    /// A built-in or same-module type.
    Named(String),
    /// A type of another module.
    Qualified {
        /// Owning module.
        module: String,
        /// Type name.
        name: String,
    },
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::Qualified { module, name } => write!(f, "{module}::{name}"),
        }
    }
}
