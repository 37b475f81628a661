//! Tenant identity.
//!
//! A store instance serves exactly one tenant: the tenant owns its own
//! database (or schema), and every index message names the tenant it was
//! produced for. Messages addressed to another tenant are dropped.

mod id;

pub use id::TenantId;
