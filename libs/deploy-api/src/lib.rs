//! Wire models for the deployd HTTP API
//!
//! Request bodies, query strings and the response envelopes shared by the
//! server and its clients.

pub mod models;

pub use models::*;
