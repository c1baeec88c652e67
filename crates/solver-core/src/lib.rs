//! Solve orchestration for the build solver.
//!
//! A [`Solver`] turns a [`SolveRequest`](solver_types::SolveRequest) into a
//! job on the underlying engine, hands frontends and worker operations an
//! [`LlbBridge`] to call back into while the job solves, exports the result
//! and its cache provenance, and reports every phase as a progress vertex.
//! References held by a result are released in the background once the
//! solve returns.

pub mod bridge;
pub mod error;
pub mod release;
pub mod solver;
pub mod status;
pub mod utils;
pub mod vertex;

pub use bridge::{BridgeOpt, LlbBridge, ResolveWorkerFn};
pub use error::CoreError;
pub use release::{ReleasePool, ReleaseStats};
pub use solver::{ExporterRequest, Solver, SolverBuilder};
pub use vertex::{notify_completed, notify_started, one_off_progress, run_in_vertex_context};
