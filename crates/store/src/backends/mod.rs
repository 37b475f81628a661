//! Database backend implementations.
//!
//! Each backend owns a connection pool and the transaction boundary around
//! the engine-independent code in [`crate::store`], [`crate::search`] and
//! [`crate::remote`].

pub mod sqlite;
