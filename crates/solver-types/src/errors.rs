//! Error types shared by every collaborator interface.

use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Error, Debug)]
pub enum BuildError {
	#[error("Not found: {0}")]
	NotFound(String),

	#[error("Conflict: {0}")]
	Conflict(String),

	#[error("Invalid definition: {0}")]
	InvalidDefinition(String),

	#[error("Invalid reference: {0}")]
	InvalidReference(String),

	#[error("Worker error: {0}")]
	Worker(String),

	#[error("Frontend error: {0}")]
	Frontend(String),

	#[error("Cache error: {0}")]
	Cache(String),

	#[error("Export error: {0}")]
	Export(String),

	#[error("Operation cancelled")]
	Cancelled,

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	Serialization(String),
}

impl From<serde_json::Error> for BuildError {
	fn from(e: serde_json::Error) -> Self {
		BuildError::Serialization(e.to_string())
	}
}

impl BuildError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, BuildError::NotFound(_))
	}
}
