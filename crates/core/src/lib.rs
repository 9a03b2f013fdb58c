//! Domain types and pure logic for the generation job orchestrator.
//!
//! Nothing in this crate performs I/O. The queue, reconciler and progress
//! aggregator in `genqueue-pipeline` build on the types and formulas here.

pub mod error;
pub mod job;
pub mod job_events;
pub mod naming;
pub mod progress;
pub mod reconcile;
pub mod scheduling;
pub mod types;
