//! Low-level primitives and utilities
//!
//! This module contains line-oriented lexing and the incremental syntax
//! state tracking used for highlighting.

pub mod highlighter;
pub mod lexer;
