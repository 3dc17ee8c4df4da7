//! Virtual text buffer engine.
//!
//! Opens files of any size instantly by mapping them into memory and
//! indexing lines in the background, keeps edits in a rope that covers only
//! the touched lines, and tracks undo history and syntax highlighting
//! state incrementally.

pub mod config;
pub mod error;
pub mod model;
pub mod primitives;
pub mod services;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use model::buffer::{Record, ReplaceAll, VirtualBuffer};
pub use model::document::Line;
pub use model::encoding::Encoding;
pub use model::line_index::{IndexFinished, IndexProgress, LineEndingMode};
pub use model::search::{SearchMatch, SearchOptions};
