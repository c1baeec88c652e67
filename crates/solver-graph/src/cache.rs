//! Default in-memory cache and the exporter behind each cache key.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use solver_types::{
	BuildError, BuildResult, CacheExportMode, CacheExportOpt, CacheExporter, CacheKeyExporter,
	CacheManager, CacheRecord, Context, Digest, SolverResult,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Keeps one handle per cached result for the lifetime of the manager.
pub struct InMemoryCacheManager {
	id: String,
	entries: DashMap<Digest, (CacheRecord, Arc<dyn SolverResult>)>,
}

impl InMemoryCacheManager {
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			entries: DashMap::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Drops every entry and releases the handles held for them.
	pub async fn prune(&self, ctx: &Context) -> BuildResult<usize> {
		let digests: Vec<Digest> = self.entries.iter().map(|e| e.key().clone()).collect();
		let mut pruned = 0;
		for digest in digests {
			if let Some((_, (_, result))) = self.entries.remove(&digest) {
				result.release(ctx).await?;
				pruned += 1;
			}
		}
		Ok(pruned)
	}
}

#[async_trait]
impl CacheManager for InMemoryCacheManager {
	fn id(&self) -> String {
		self.id.clone()
	}

	async fn query(&self, _ctx: &Context, digest: &Digest) -> BuildResult<Option<CacheRecord>> {
		Ok(self.entries.get(digest).map(|e| e.value().0.clone()))
	}

	async fn load(&self, _ctx: &Context, record: &CacheRecord) -> BuildResult<Arc<dyn SolverResult>> {
		self.entries
			.get(&record.digest)
			.map(|e| e.value().1.clone_ref())
			.ok_or_else(|| BuildError::NotFound(format!("cache record {}", record.digest)))
	}

	async fn save(
		&self,
		ctx: &Context,
		record: CacheRecord,
		result: Arc<dyn SolverResult>,
	) -> BuildResult<()> {
		if self.entries.contains_key(&record.digest) {
			// Keep the first result for a digest; the extra handle is ours to drop.
			return result.release(ctx).await;
		}
		debug!("Cache {} saved {}", self.id, record.digest);
		self.entries.insert(record.digest.clone(), (record, result));
		Ok(())
	}
}

/// Exports the chain of records behind one cache key: the dependencies
/// first, then the key's own record.
pub struct ChainExporter {
	record: CacheRecord,
	result: Arc<dyn SolverResult>,
	deps: Vec<Arc<ChainExporter>>,
}

impl ChainExporter {
	pub fn new(
		record: CacheRecord,
		result: Arc<dyn SolverResult>,
		deps: Vec<Arc<ChainExporter>>,
	) -> Self {
		Self {
			record,
			result,
			deps,
		}
	}

	fn export_chain<'a>(
		&'a self,
		ctx: &'a Context,
		target: &'a dyn CacheExporter,
		opt: &'a CacheExportOpt,
		root: bool,
		visited: &'a mut HashSet<Digest>,
	) -> BoxFuture<'a, BuildResult<Vec<CacheRecord>>> {
		Box::pin(async move {
			if !visited.insert(self.record.digest.clone()) {
				return Ok(Vec::new());
			}

			let mut exported = Vec::new();
			for dep in &self.deps {
				exported.extend(dep.export_chain(ctx, target, opt, false, visited).await?);
			}

			let with_result = match opt.mode {
				CacheExportMode::Max => true,
				CacheExportMode::Min => root,
				CacheExportMode::RemoteOnly => false,
			};
			let result = if with_result {
				Some((opt.convert)(self.result.as_ref())?)
			} else {
				None
			};

			let mut record = self.record.clone();
			record.result_id = result.as_ref().map(|r| r.id());
			target.add_record(ctx, record.clone(), result).await?;
			exported.push(record);
			Ok(exported)
		})
	}
}

#[async_trait]
impl CacheKeyExporter for ChainExporter {
	async fn export_to(
		&self,
		ctx: &Context,
		target: &dyn CacheExporter,
		opt: &CacheExportOpt,
	) -> BuildResult<Vec<CacheRecord>> {
		let mut visited = HashSet::new();
		self.export_chain(ctx, target, opt, true, &mut visited).await
	}
}
