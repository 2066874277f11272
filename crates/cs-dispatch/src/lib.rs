//! Evaluation job dispatch.
//!
//! The [`JobDispatcher`] runs solver invocations on an [`ExecutionBackend`]
//! with a bounded number of jobs in flight, per-job timeouts, retries and
//! failure classification, and appends every finished evaluation to a JSONL
//! result log.

pub mod backend;
pub mod job;
pub mod local;
pub mod slurm;
pub mod sim;
pub mod dispatcher;
pub mod journal;

pub use backend::*;
pub use job::*;
pub use local::*;
pub use slurm::*;
pub use sim::*;
pub use dispatcher::*;
pub use journal::*;
