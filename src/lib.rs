//! Conductor orchestrates multi-step agent protocols.
//!
//! A protocol run is a persisted sequence of step runs driven through a
//! status state machine. The [`orchestrator::Orchestrator`] owns the
//! lifecycle: it plans steps from an on-disk spec, dispatches execution and
//! quality jobs through [`dispatch::Dispatcher`], applies loop and trigger
//! policies after each step finishes and closes the protocol once every step
//! reaches a terminal status. State lives behind the [`store::Store`] trait
//! with embedded SQLite and remote libsql backends.

pub mod budget;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod spec;
pub mod store;
pub mod telemetry;

pub use errors::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
