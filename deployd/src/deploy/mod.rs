//! Deployment lifecycle and remote execution

pub mod commands;
pub mod executor;
pub mod fsm;
pub mod lease;
pub mod log_pump;
pub mod manager;
pub mod port_guard;
pub mod queue;
pub mod remote;
