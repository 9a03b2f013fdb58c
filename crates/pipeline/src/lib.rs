//! The job orchestration core.
//!
//! [`orchestrator::Orchestrator`] is the composition root: it owns a
//! priority [`queue::JobQueue`], a [`executor::JobExecutor`] that submits
//! jobs and waits on the [`monitor::JobMonitor`] status reconciler, and a
//! [`progress::ProgressAggregator`] that turns lifecycle events into
//! throughput and ETA telemetry.

pub mod config;
pub mod detectors;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod store;
pub mod workflow;
