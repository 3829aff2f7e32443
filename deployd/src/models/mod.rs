//! Domain models persisted by the state store

pub mod analysis;
pub mod deployment;
pub mod lease;
pub mod repository;
pub mod ssh_key;
pub mod web_server;
