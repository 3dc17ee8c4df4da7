//! Core text model
//!
//! This module contains the storage layers of a buffer (file mapping, line
//! index, edit overlay) and the undo history built on top of them.

pub mod backing_store;
pub mod buffer;
pub mod document;
pub mod encoding;
pub mod history;
pub mod line_index;
pub mod overlay;
pub mod rope;
pub mod search;
