//! Content exporter interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{BuildResult, Context, ImmutableRef};

/// The validated content of a solve, handed to an exporter.
#[derive(Debug, Clone, Default)]
pub struct ExportSource {
	pub reference: Option<Arc<dyn ImmutableRef>>,
	pub refs: Option<HashMap<String, Option<Arc<dyn ImmutableRef>>>>,
	pub metadata: HashMap<String, Vec<u8>>,
}

/// A configured exporter ready to run once.
#[async_trait]
pub trait ExporterInstance: Send + Sync {
	/// Name shown as the export phase in progress output.
	fn name(&self) -> String;

	async fn export(&self, ctx: &Context, source: ExportSource)
		-> BuildResult<HashMap<String, String>>;
}

/// What the caller gets back from a solve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveResponse {
	pub exporter_response: HashMap<String, String>,
}
