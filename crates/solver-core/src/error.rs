// solver-core/src/error.rs

use solver_types::BuildError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
	#[error("Configuration error: {0}")]
	Configuration(String),

	#[error("Job error: {0}")]
	Job(String),

	#[error("Solve error: {0}")]
	Solve(String),

	#[error("invalid reference: {0}")]
	InvalidReference(String),

	#[error("Export error in {exporter}: {source}")]
	Export {
		exporter: String,
		#[source]
		source: BuildError,
	},

	#[error("Cache export error: {0}")]
	CacheExport(String),

	#[error("Job not found: {0}")]
	JobNotFound(String),

	#[error("Operation cancelled")]
	Cancelled,
}

impl CoreError {
	/// Wraps a collaborator error for one phase. Cancellation keeps its own
	/// variant whatever the phase.
	pub(crate) fn phase(e: BuildError, wrap: impl FnOnce(String) -> CoreError) -> CoreError {
		match e {
			BuildError::Cancelled => CoreError::Cancelled,
			other => wrap(other.to_string()),
		}
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(self, CoreError::Cancelled)
	}
}
