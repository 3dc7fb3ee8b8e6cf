//! Core types shared by the erp-flow crates.
//!
//! This crate provides the strongly-typed identifiers for workflow definitions
//! and executions plus the `Result` alias used at public API boundaries.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ExecutionId, ParseIdError, WorkflowId};
