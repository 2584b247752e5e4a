#![recursion_limit = "384"]
// Needed for the larger select! blocks in the session supervisor

pub mod api;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod policy;
pub mod rib;
pub mod server;
pub mod session;
pub mod utils;
