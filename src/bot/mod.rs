//! Chat-facing orchestration layer. Not part of the classification core;
//! exists so the crate is a runnable binary.

pub mod bootstrap;
pub mod group;
pub mod private;
pub mod rate_limit;
pub mod transport;
