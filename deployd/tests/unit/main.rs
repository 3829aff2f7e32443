//! Integration tests over the in-memory store and scripted remote hosts

mod support;
mod test_deployments;
mod test_fsm;
mod test_router;
mod test_webhook;
