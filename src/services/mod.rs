//! Background services
//!
//! Work that runs off the owner thread and reports back through channels.

pub mod index_worker;
