//! Persistent configuration

pub mod layout;
pub mod settings;
