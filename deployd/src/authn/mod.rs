//! Caller authentication

pub mod caller_token;
