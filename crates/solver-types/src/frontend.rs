//! Solve requests, frontends, and the bridge they call back into.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{BuildResult, CacheManager, Context, Definition, FrontendResult, Platform, Worker};

/// What to build: either a graph definition or a frontend reference with
/// its options, plus remote caches to import from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolveRequest {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub definition: Option<Definition>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub frontend: Option<String>,
	#[serde(default)]
	pub frontend_opt: HashMap<String, String>,
	#[serde(default)]
	pub import_cache_refs: Vec<String>,
}

impl SolveRequest {
	pub fn with_definition(definition: Definition) -> Self {
		Self {
			definition: Some(definition),
			..Default::default()
		}
	}

	pub fn with_frontend(frontend: impl Into<String>, opts: HashMap<String, String>) -> Self {
		Self {
			frontend: Some(frontend.into()),
			frontend_opt: opts,
			..Default::default()
		}
	}

	pub fn import_cache(mut self, cache_ref: impl Into<String>) -> Self {
		self.import_cache_refs.push(cache_ref.into());
		self
	}
}

/// The solver surface available to frontends and operations while a job
/// is being solved.
#[async_trait]
pub trait FrontendBridge: Send + Sync {
	async fn solve(&self, ctx: &Context, req: SolveRequest) -> BuildResult<FrontendResult>;

	fn resolve_worker(&self) -> BuildResult<Arc<dyn Worker>>;

	async fn resolve_cache_importer(
		&self,
		ctx: &Context,
		cache_ref: &str,
	) -> BuildResult<Arc<dyn CacheManager>>;

	fn platforms(&self) -> Vec<Platform>;
}

/// Turns frontend-specific options into a build result.
#[async_trait]
pub trait Frontend: Send + Sync {
	async fn solve(
		&self,
		ctx: &Context,
		bridge: Arc<dyn FrontendBridge>,
		opts: &HashMap<String, String>,
	) -> BuildResult<FrontendResult>;
}
