//! Logging integration
//!
//! This module wires the crate's `tracing` events to a subscriber.

pub mod logging;

pub use logging::init_tracing;
