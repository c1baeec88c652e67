//! Worker backends for the build solver.
//!
//! This crate provides the worker registry used by the solver, the
//! [`WorkerRef`] result type every worker-produced output is wrapped in, and
//! the converter the cache export path uses to unwrap it again.

use async_trait::async_trait;
use solver_types::{
	BuildError, BuildResult, Context, ImmutableRef, ResultConverter, SolverResult, Worker,
};
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

/// Re-export implementations
pub mod implementations {
	pub mod local;
}

/// A result produced by a worker: the snapshot plus the worker that owns it.
#[derive(Debug)]
pub struct WorkerRef {
	pub immutable_ref: Arc<dyn ImmutableRef>,
	pub worker_id: String,
}

impl WorkerRef {
	pub fn new(immutable_ref: Arc<dyn ImmutableRef>, worker_id: impl Into<String>) -> Self {
		Self {
			immutable_ref,
			worker_id: worker_id.into(),
		}
	}

	pub fn into_result(self) -> Arc<dyn SolverResult> {
		Arc::new(self)
	}
}

#[async_trait]
impl SolverResult for WorkerRef {
	fn id(&self) -> String {
		format!("{}::{}", self.worker_id, self.immutable_ref.id())
	}

	fn clone_ref(&self) -> Arc<dyn SolverResult> {
		Arc::new(WorkerRef {
			immutable_ref: self.immutable_ref.clone_ref(),
			worker_id: self.worker_id.clone(),
		})
	}

	async fn release(&self, ctx: &Context) -> BuildResult<()> {
		self.immutable_ref.release(ctx).await
	}

	fn sys(&self) -> &dyn Any {
		self
	}
}

/// Unwraps a solver result into the worker snapshot behind it.
pub fn as_worker_ref(result: &dyn SolverResult) -> BuildResult<&WorkerRef> {
	result
		.sys()
		.downcast_ref::<WorkerRef>()
		.ok_or_else(|| BuildError::InvalidReference(result.id()))
}

/// Converter handed to cache exporters. The returned handle is borrowed
/// from the result and must not be released by the exporter.
pub fn worker_ref_converter() -> ResultConverter {
	Arc::new(|result: &dyn SolverResult| {
		as_worker_ref(result).map(|worker_ref| worker_ref.immutable_ref.clone())
	})
}

/// Registry of available workers. Built once at startup.
#[derive(Debug, Default)]
pub struct WorkerController {
	workers: Vec<Arc<dyn Worker>>,
	default: Option<String>,
}

impl WorkerController {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a worker. The first worker added becomes the default unless one
	/// is chosen with [`WorkerController::with_default`].
	pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> BuildResult<Self> {
		let id = worker.id();
		if self.workers.iter().any(|w| w.id() == id) {
			return Err(BuildError::Conflict(format!("worker {} already registered", id)));
		}
		debug!("Registered worker {} ({} platforms)", id, worker.platforms().len());
		self.workers.push(worker);
		Ok(self)
	}

	pub fn with_default(mut self, id: impl Into<String>) -> Self {
		self.default = Some(id.into());
		self
	}

	pub fn get_default(&self) -> BuildResult<Arc<dyn Worker>> {
		let worker = match &self.default {
			Some(id) => self.workers.iter().find(|w| &w.id() == id),
			None => self.workers.first(),
		};
		worker
			.cloned()
			.ok_or_else(|| BuildError::NotFound("no default worker".to_string()))
	}

	pub fn get(&self, id: &str) -> BuildResult<Arc<dyn Worker>> {
		self.workers
			.iter()
			.find(|w| w.id() == id)
			.cloned()
			.ok_or_else(|| BuildError::NotFound(format!("worker {}", id)))
	}

	pub fn list(&self) -> &[Arc<dyn Worker>] {
		&self.workers
	}
}

#[cfg(test)]
mod tests {
	use super::implementations::local::LocalWorker;
	use super::*;
	use solver_types::Platform;

	#[test]
	fn test_empty_controller_has_no_default() {
		let wc = WorkerController::new();
		let err = wc.get_default().unwrap_err();
		assert!(err.is_not_found());
	}

	#[test]
	fn test_first_worker_is_default() {
		let wc = WorkerController::new()
			.with_worker(Arc::new(LocalWorker::new("a", vec![Platform::host()])))
			.unwrap()
			.with_worker(Arc::new(LocalWorker::new("b", vec![Platform::host()])))
			.unwrap();
		assert_eq!(wc.get_default().unwrap().id(), "a");

		let wc = wc.with_default("b");
		assert_eq!(wc.get_default().unwrap().id(), "b");
		assert!(wc.get("c").is_err());
	}

	#[test]
	fn test_duplicate_worker_rejected() {
		let res = WorkerController::new()
			.with_worker(Arc::new(LocalWorker::new("a", vec![])))
			.unwrap()
			.with_worker(Arc::new(LocalWorker::new("a", vec![])));
		assert!(matches!(res, Err(BuildError::Conflict(_))));
	}

	#[tokio::test]
	async fn test_converter_rejects_foreign_results() {
		#[derive(Debug)]
		struct Foreign;

		#[async_trait]
		impl SolverResult for Foreign {
			fn id(&self) -> String {
				"foreign".to_string()
			}
			fn clone_ref(&self) -> Arc<dyn SolverResult> {
				Arc::new(Foreign)
			}
			async fn release(&self, _ctx: &Context) -> BuildResult<()> {
				Ok(())
			}
			fn sys(&self) -> &dyn Any {
				self
			}
		}

		let convert = worker_ref_converter();
		assert!(matches!(
			convert(&Foreign),
			Err(BuildError::InvalidReference(_))
		));

		let worker = LocalWorker::new("w", vec![]);
		let result = worker.snapshot(Default::default());
		let converted = convert(result.as_ref()).unwrap();
		assert_eq!(result.id(), format!("w::{}", converted.id()));
	}
}
