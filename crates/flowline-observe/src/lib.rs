//! Observability setup for Flowline binaries.
//!
//! Library crates only emit `tracing` events; installing a subscriber is the
//! job of the composition root, which calls into this crate once at startup.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};
