//! Credential material: at-rest encryption and SSH key pairs

pub mod cipher;
pub mod keys;
