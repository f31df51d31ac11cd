//! Deployment module

pub mod coordinator;
pub mod executor;
pub mod gate;
pub mod launcher;
