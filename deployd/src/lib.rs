//! deployd library
//!
//! Deployment orchestration for SSH-reachable web servers: credential and
//! repository registries, the webhook gateway, the deployment state machine
//! and the remote executor.

pub mod app;
pub mod authn;
pub mod credentials;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod github;
pub mod logs;
pub mod models;
pub mod server;
pub mod services;
pub mod storage;
pub mod store;
pub mod utils;
pub mod workers;
