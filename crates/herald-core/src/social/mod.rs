//! Social platform abstractions (X today).

pub mod bounded;
pub mod port;
pub mod types;
