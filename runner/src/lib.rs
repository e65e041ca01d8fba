//! Orchestration of external CFD engine runs: jobs are driven through prepare, mesh, solve and
//! post-process stages, batches of a parameter sweep share the mesh of their first member.

pub mod batch;
pub mod case;
pub mod config;
pub mod database;
pub mod executors;
pub mod ingest;
pub mod job;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod workspace;

pub use orchestrator::{Access, Orchestrator, OrchestratorError};
