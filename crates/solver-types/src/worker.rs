//! Worker backend interfaces.

use async_trait::async_trait;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use crate::{BuildResult, Context, FrontendBridge, OpVertex, Platform, SolverResult};

/// An executable operation resolved from a graph vertex.
#[async_trait]
pub trait Op: Send + Sync {
	async fn exec(
		&self,
		ctx: &Context,
		inputs: Vec<Arc<dyn SolverResult>>,
	) -> BuildResult<Arc<dyn SolverResult>>;
}

/// A backend that executes operations and owns the snapshots they produce.
pub trait Worker: Send + Sync + Debug {
	fn id(&self) -> String;

	/// Platforms this worker can produce results for.
	fn platforms(&self) -> Vec<Platform>;

	/// Resolves `vertex` into an executable operation. The bridge lets the
	/// operation call back into the solver, e.g. to run nested builds.
	fn resolve_op(
		&self,
		vertex: &OpVertex,
		bridge: Arc<dyn FrontendBridge>,
	) -> BuildResult<Arc<dyn Op>>;

	fn as_any(&self) -> &dyn Any;
}
