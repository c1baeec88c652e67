//! Minimal job engine behind the solve orchestrator.
//!
//! The engine owns the registry of live jobs, loads serialized definitions
//! into vertex graphs, and builds them depth first: each vertex is looked up
//! in the cache by digest and otherwise resolved into a worker operation
//! through the resolver callback supplied at construction. Every vertex is
//! reported on the job's progress log.

pub mod cache;
pub mod job;
pub mod loader;
pub mod progress;

pub use cache::{ChainExporter, InMemoryCacheManager};
pub use job::{Builder, Job, JobSolver, ResolveOpFn, SolverOpt};
pub use loader::load;
pub use progress::ProgressLog;
