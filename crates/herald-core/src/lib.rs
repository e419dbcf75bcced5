//! Core domain + application logic for Herald, the target-account monitor.
//!
//! This crate is intentionally transport-agnostic. The social platform, the text
//! generator and persistence live behind ports (traits) implemented in adapter crates.

pub mod admission;
pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod filter;
pub mod generation;
pub mod ledger;
pub mod logging;
pub mod mentions;
pub mod poller;
pub mod query;
pub mod registry;
pub mod responder;
pub mod scheduler;
pub mod social;
pub mod store;
pub mod thread;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
