//! Cache provenance interfaces: local cache managers, remote cache
//! exporters, and importers that hydrate cache managers from a remote source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::{BuildResult, Context, Digest, ImmutableRef, SolverResult, Worker};

/// How much provenance a cache export carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheExportMode {
	/// Only the final result of each exported chain.
	#[default]
	Min,
	/// Every intermediate result in the chain.
	Max,
	/// Records only; no result content.
	RemoteOnly,
}

impl fmt::Display for CacheExportMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Min => write!(f, "min"),
			Self::Max => write!(f, "max"),
			Self::RemoteOnly => write!(f, "remote-only"),
		}
	}
}

impl FromStr for CacheExportMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"min" => Ok(Self::Min),
			"max" => Ok(Self::Max),
			"remote-only" => Ok(Self::RemoteOnly),
			other => Err(format!("invalid cache export mode: {}", other)),
		}
	}
}

/// A single link in a cache chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
	pub digest: Digest,
	#[serde(default)]
	pub deps: Vec<Digest>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result_id: Option<String>,
}

impl CacheRecord {
	pub fn new(digest: Digest, deps: Vec<Digest>) -> Self {
		Self {
			digest,
			deps,
			result_id: None,
		}
	}
}

/// Maps a solver result into the reference type a cache exporter stores.
pub type ResultConverter =
	Arc<dyn Fn(&dyn SolverResult) -> BuildResult<Arc<dyn ImmutableRef>> + Send + Sync>;

#[derive(Clone)]
pub struct CacheExportOpt {
	pub convert: ResultConverter,
	pub mode: CacheExportMode,
}

/// A remote cache destination.
#[async_trait]
pub trait CacheExporter: Send + Sync {
	fn name(&self) -> String;

	async fn add_record(
		&self,
		ctx: &Context,
		record: CacheRecord,
		result: Option<Arc<dyn ImmutableRef>>,
	) -> BuildResult<()>;

	/// Flushes everything added so far to the destination.
	async fn finalize(&self, ctx: &Context) -> BuildResult<()>;
}

/// Knows how to write the chain behind one cache key into an exporter.
#[async_trait]
pub trait CacheKeyExporter: Send + Sync {
	async fn export_to(
		&self,
		ctx: &Context,
		target: &dyn CacheExporter,
		opt: &CacheExportOpt,
	) -> BuildResult<Vec<CacheRecord>>;
}

#[derive(Clone)]
pub struct ExportableCacheKey {
	pub digest: Digest,
	pub exporter: Arc<dyn CacheKeyExporter>,
}

impl fmt::Debug for ExportableCacheKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ExportableCacheKey")
			.field("digest", &self.digest)
			.finish_non_exhaustive()
	}
}

/// Stores and looks up results by cache key digest.
#[async_trait]
pub trait CacheManager: Send + Sync {
	fn id(&self) -> String;

	async fn query(&self, ctx: &Context, digest: &Digest) -> BuildResult<Option<CacheRecord>>;

	/// Returns a fresh handle for a record previously returned by `query`.
	async fn load(&self, ctx: &Context, record: &CacheRecord) -> BuildResult<Arc<dyn SolverResult>>;

	async fn save(
		&self,
		ctx: &Context,
		record: CacheRecord,
		result: Arc<dyn SolverResult>,
	) -> BuildResult<()>;
}

/// Turns a remote cache reference into a cache manager.
#[async_trait]
pub trait CacheImporter: Send + Sync {
	async fn resolve(
		&self,
		ctx: &Context,
		reference: &str,
		worker: Arc<dyn Worker>,
	) -> BuildResult<Arc<dyn CacheManager>>;
}

/// Picks an importer for `(type, reference)`.
pub type ResolveCacheImporterFn =
	Arc<dyn Fn(&str, &str) -> BuildResult<Arc<dyn CacheImporter>> + Send + Sync>;

/// Splits `type:reference`. A reference without a known type prefix keeps
/// an empty type so the resolver applies its default.
pub fn parse_cache_ref(cache_ref: &str) -> (&str, &str) {
	match cache_ref.split_once(':') {
		Some((typ, reference))
			if !typ.is_empty() && typ.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') =>
		{
			(typ, reference)
		}
		_ => ("", cache_ref),
	}
}
