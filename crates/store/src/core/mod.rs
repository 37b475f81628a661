//! Core storage traits.
//!
//! - [`Backend`] - a database engine the store runs against
//! - [`ResourceStorage`] - versioned writes and reads of logical resources

pub mod backend;
pub mod storage;

pub use backend::{Backend, BackendKind};
pub use storage::ResourceStorage;
