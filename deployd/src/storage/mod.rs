//! Local storage: data directory layout and settings file

pub mod layout;
pub mod settings;
