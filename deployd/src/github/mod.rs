//! GitHub integration: push webhooks, the REST API and repository analysis

pub mod analysis;
pub mod client;
pub mod webhook;
