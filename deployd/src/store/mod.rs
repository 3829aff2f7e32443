//! Durable state store backed by redb
//!
//! Every entity is stored as JSON under a `&str` key. Multi-step updates
//! (state transitions, lease compare-and-set, log appends) run inside a
//! single write transaction, which redb serializes.

/// Convert any `Display` error into a `StorageError` carrying some context.
macro_rules! map_err {
    ($context:expr) => {
        |e| $crate::errors::DeploydError::StorageError(format!("{}: {}", $context, e))
    };
}

mod deployments;
mod leases;
mod state;
pub mod tables;

pub use state::StateStore;
