//! Deploy Hook Library
//!
//! Receives signed push webhooks and runs a deployment command, at most one
//! at a time.

pub mod app;
pub mod authn;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
