//! The kiln source language: a small declaration language compiled one unit
//! at a time.
//!
//! A unit is a sequence of `fn`, `const` and `type` declarations, each with
//! an optional visibility (`pub`, `internal`, or private by default) and
//! leading `@annotations`. Declarations of other modules are named with
//! `module::name`. [`KilnCompiler`] implements [`kiln_cache::UnitCompiler`]
//! for this language.

#![warn(missing_docs)]

pub mod ast;
mod compile;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod project;
pub mod token;

pub use compile::{KilnCompiler, DEBUG_OPTION};
pub use lexer::lex;
pub use parser::parse;
pub use project::{module_graph, ProjectError};

/// File extension of kiln source units.
pub const SOURCE_EXTENSION: &str = "kl";
