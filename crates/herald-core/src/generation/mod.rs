//! Text-generation abstractions.

pub mod bounded;
pub mod port;
pub mod types;
