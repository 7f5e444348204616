//! Clients for the external collaborators of the job subsystem.
//!
//! This crate provides:
//! - The execution engine contract (`run`/`status`) and its HTTP client
//! - The clip synthesis contract and its HTTP client
//!
//! Both are trait-fronted so the control plane and runner can be exercised
//! against doubles.

pub mod error;
pub mod executions;
pub mod synthesis;

pub use error::{EngineError, EngineResult};
pub use executions::{
    ExecutionClient, ExecutionConfig, ExecutionEngine, ExecutionRef, ExecutionStatus,
};
pub use synthesis::{ClipSynthesizer, SynthesisClient, SynthesisConfig, SynthesisRequest};
