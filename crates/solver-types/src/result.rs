//! Solve results and the references they hold.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::{BuildResult, Context, ExportableCacheKey};

/// An immutable snapshot owned by a worker backend.
#[async_trait]
pub trait ImmutableRef: Send + Sync + Debug {
	fn id(&self) -> String;

	/// Returns a new handle to the same snapshot that must be released on
	/// its own.
	fn clone_ref(&self) -> Arc<dyn ImmutableRef>;

	async fn release(&self, ctx: &Context) -> BuildResult<()>;

	fn as_any(&self) -> &dyn Any;
}

/// The output of one solved operation.
#[async_trait]
pub trait SolverResult: Send + Sync + Debug {
	fn id(&self) -> String;

	/// Returns a new handle to the same output that must be released on
	/// its own.
	fn clone_ref(&self) -> Arc<dyn SolverResult>;

	async fn release(&self, ctx: &Context) -> BuildResult<()>;

	/// The backend-specific value behind this result, for downcasting.
	fn sys(&self) -> &dyn Any;
}

/// A result together with the cache keys it can be exported under.
#[derive(Clone)]
pub struct CachedResult {
	result: Arc<dyn SolverResult>,
	cache_keys: Vec<ExportableCacheKey>,
}

impl CachedResult {
	pub fn new(result: Arc<dyn SolverResult>, cache_keys: Vec<ExportableCacheKey>) -> Self {
		Self { result, cache_keys }
	}

	pub fn id(&self) -> String {
		self.result.id()
	}

	pub fn result(&self) -> &Arc<dyn SolverResult> {
		&self.result
	}

	pub fn sys(&self) -> &dyn Any {
		self.result.sys()
	}

	/// Keys in preference order. All keys of one result share the same
	/// export chain.
	pub fn cache_keys(&self) -> &[ExportableCacheKey] {
		&self.cache_keys
	}

	/// A second handle to the same output with the same keys.
	pub fn clone_ref(&self) -> CachedResult {
		CachedResult {
			result: self.result.clone_ref(),
			cache_keys: self.cache_keys.clone(),
		}
	}

	pub async fn release(&self, ctx: &Context) -> BuildResult<()> {
		self.result.release(ctx).await
	}
}

impl Debug for CachedResult {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CachedResult")
			.field("result", &self.result)
			.field("cache_keys", &self.cache_keys.len())
			.finish()
	}
}

/// What a frontend or a graph build hands back to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct FrontendResult {
	pub reference: Option<CachedResult>,
	pub refs: Option<HashMap<String, Option<CachedResult>>>,
	pub metadata: HashMap<String, Vec<u8>>,
}

impl FrontendResult {
	pub fn single(reference: CachedResult) -> Self {
		Self {
			reference: Some(reference),
			..Default::default()
		}
	}

	pub fn add_ref(&mut self, name: impl Into<String>, reference: Option<CachedResult>) {
		self.refs
			.get_or_insert_with(HashMap::new)
			.insert(name.into(), reference);
	}

	pub fn add_meta(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
		self.metadata.insert(key.into(), value.into());
	}

	/// Every held reference: the primary one first, then the named ones in
	/// key order. Empty named slots are skipped.
	pub fn all_refs(&self) -> Vec<&CachedResult> {
		let mut out: Vec<&CachedResult> = self.reference.iter().collect();
		if let Some(refs) = &self.refs {
			let mut names: Vec<&String> = refs.keys().collect();
			names.sort();
			out.extend(names.into_iter().filter_map(|name| refs[name].as_ref()));
		}
		out
	}

	pub fn each_ref<F>(&self, mut f: F) -> BuildResult<()>
	where
		F: FnMut(&CachedResult) -> BuildResult<()>,
	{
		for r in self.all_refs() {
			f(r)?;
		}
		Ok(())
	}
}
