//! Control plane for background media jobs.
//!
//! This crate provides:
//! - JobOrchestrator: admission (one active job per project/type),
//!   dispatch to the execution engine, status, cancel, list
//! - StateReconciler: three-way correction of job records and project
//!   projections against blob storage and engine verdicts
//! - ReconcileSweep: the periodic correction + retention loop
//! - AdmissionLock: the Redis lock serializing admission sequences

pub mod admission;
pub mod error;
pub mod orchestrator;
pub mod reconciler;
pub mod sweep;

pub use admission::{AdmissionGuard, AdmissionLock};
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{JobOrchestrator, OrchestratorConfig};
pub use reconciler::{decide, Correction, StateReconciler};
pub use sweep::ReconcileSweep;
