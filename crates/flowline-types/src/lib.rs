//! Shared domain types for Flowline.
//!
//! This crate contains the data model shared by the engine, the scheduler and
//! the binaries: workflow and job definitions, runtime instances, execution
//! errors, emitted events and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod retry;
pub mod workflow;
