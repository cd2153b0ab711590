//! Streaming runtime (the critical path).
//!
//! Owns the Team State for one run, drives the graph orchestrator, and
//! translates its stream into persisted Events and Messages. One run per
//! container; the gateway only ever reads what this writes.

mod runtime;

pub use runtime::{run_session, RuntimeConfig, RuntimeDeps};
