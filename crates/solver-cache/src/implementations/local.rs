//! Directory-backed remote cache.
//!
//! Layout:
//! - `index.json`: every exported record with its dependencies and, when
//!   the record carries content, the digest of its blob
//! - `blobs/<hex>.json`: the file tree of one exported result

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solver_types::{
	BuildError, BuildResult, CacheExporter, CacheImporter, CacheManager, CacheRecord, Context,
	Digest, ImmutableRef, SolverResult, Worker,
};
use solver_worker::implementations::local::{Files, LocalSnapshot, LocalWorker};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
	pub digest: Digest,
	#[serde(default)]
	pub deps: Vec<Digest>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub blob: Option<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndex {
	pub version: u32,
	pub records: Vec<IndexEntry>,
}

impl CacheIndex {
	pub async fn read(dir: &Path) -> BuildResult<Option<CacheIndex>> {
		match fs::read(dir.join(INDEX_FILE)).await {
			Ok(data) => {
				let index: CacheIndex = serde_json::from_slice(&data)?;
				if index.version != INDEX_VERSION {
					return Err(BuildError::Cache(format!(
						"unsupported cache index version {}",
						index.version
					)));
				}
				Ok(Some(index))
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}
}

fn blob_path(dir: &Path, digest: &Digest) -> PathBuf {
	dir.join(BLOBS_DIR).join(format!("{}.json", digest.encoded()))
}

/// Writes `data` next to `path` first and renames it into place.
async fn write_atomic(path: &Path, data: &[u8]) -> BuildResult<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}
	let temp_path = path.with_extension("tmp");
	fs::write(&temp_path, data).await?;
	fs::rename(&temp_path, path).await?;
	Ok(())
}

/// Blob file contents: path to hex-encoded bytes.
type Blob = BTreeMap<String, String>;

fn encode_blob(files: &Files) -> BuildResult<Vec<u8>> {
	let blob: Blob = files
		.iter()
		.map(|(path, content)| (path.clone(), hex::encode(content)))
		.collect();
	Ok(serde_json::to_vec(&blob)?)
}

fn decode_blob(data: &[u8]) -> BuildResult<Files> {
	let blob: Blob = serde_json::from_slice(data)?;
	blob.into_iter()
		.map(|(path, content)| {
			hex::decode(&content)
				.map(|bytes| (path, bytes))
				.map_err(|e| BuildError::Cache(format!("corrupt cache blob: {}", e)))
		})
		.collect()
}

#[derive(Default)]
struct PendingExport {
	records: BTreeMap<Digest, IndexEntry>,
	blobs: HashMap<Digest, Vec<u8>>,
}

/// Collects records during a solve and writes them out on finalize.
pub struct LocalCacheExporter {
	dir: PathBuf,
	pending: Mutex<PendingExport>,
}

impl LocalCacheExporter {
	pub fn new(dir: PathBuf) -> Self {
		Self {
			dir,
			pending: Mutex::new(PendingExport::default()),
		}
	}
}

#[async_trait]
impl CacheExporter for LocalCacheExporter {
	fn name(&self) -> String {
		"local".to_string()
	}

	async fn add_record(
		&self,
		_ctx: &Context,
		record: CacheRecord,
		result: Option<Arc<dyn ImmutableRef>>,
	) -> BuildResult<()> {
		let blob = match &result {
			Some(reference) => {
				let data = encode_blob(LocalSnapshot::files_of(reference.as_ref())?)?;
				Some((Digest::from_bytes(&data), data))
			}
			None => None,
		};

		let mut guard = self.pending.lock().await;
		let pending = &mut *guard;
		let entry = pending
			.records
			.entry(record.digest.clone())
			.or_insert_with(|| IndexEntry {
				digest: record.digest.clone(),
				deps: record.deps.clone(),
				blob: None,
			});
		if let Some((digest, data)) = blob {
			entry.blob = Some(digest.clone());
			pending.blobs.insert(digest, data);
		}
		Ok(())
	}

	async fn finalize(&self, _ctx: &Context) -> BuildResult<()> {
		let pending = std::mem::take(&mut *self.pending.lock().await);

		// Records already in the directory stay unless re-exported.
		let mut records: BTreeMap<Digest, IndexEntry> = match CacheIndex::read(&self.dir).await? {
			Some(index) => index
				.records
				.into_iter()
				.map(|entry| (entry.digest.clone(), entry))
				.collect(),
			None => BTreeMap::new(),
		};

		for (digest, data) in &pending.blobs {
			write_atomic(&blob_path(&self.dir, digest), data).await?;
		}
		records.extend(pending.records);

		let index = CacheIndex {
			version: INDEX_VERSION,
			records: records.into_values().collect(),
		};
		write_atomic(&self.dir.join(INDEX_FILE), &serde_json::to_vec_pretty(&index)?).await?;
		info!(
			"Exported {} cache records ({} blobs) to {}",
			index.records.len(),
			pending.blobs.len(),
			self.dir.display()
		);
		Ok(())
	}
}

#[derive(Debug, Default)]
pub struct LocalCacheImporter;

impl LocalCacheImporter {
	pub fn new() -> Self {
		Self
	}
}

#[async_trait]
impl CacheImporter for LocalCacheImporter {
	async fn resolve(
		&self,
		_ctx: &Context,
		reference: &str,
		worker: Arc<dyn Worker>,
	) -> BuildResult<Arc<dyn CacheManager>> {
		let dir = PathBuf::from(reference);
		let records = match CacheIndex::read(&dir).await? {
			Some(index) => index
				.records
				.into_iter()
				.map(|entry| (entry.digest.clone(), entry))
				.collect(),
			None => {
				warn!("No cache index in {}; importing nothing", dir.display());
				HashMap::new()
			}
		};
		debug!("Imported {} cache records from {}", records.len(), dir.display());

		Ok(Arc::new(ImportedCache {
			id: format!("local:{}", reference),
			dir,
			records,
			worker,
		}))
	}
}

/// Read-only view of an exported cache directory. Loaded results become
/// new snapshots on the importing worker.
struct ImportedCache {
	id: String,
	dir: PathBuf,
	records: HashMap<Digest, IndexEntry>,
	worker: Arc<dyn Worker>,
}

#[async_trait]
impl CacheManager for ImportedCache {
	fn id(&self) -> String {
		self.id.clone()
	}

	async fn query(&self, _ctx: &Context, digest: &Digest) -> BuildResult<Option<CacheRecord>> {
		// Records exported without content cannot produce a result.
		Ok(self.records.get(digest).and_then(|entry| {
			entry.blob.as_ref().map(|blob| CacheRecord {
				digest: entry.digest.clone(),
				deps: entry.deps.clone(),
				result_id: Some(blob.to_string()),
			})
		}))
	}

	async fn load(&self, _ctx: &Context, record: &CacheRecord) -> BuildResult<Arc<dyn SolverResult>> {
		let blob = self
			.records
			.get(&record.digest)
			.and_then(|entry| entry.blob.clone())
			.ok_or_else(|| BuildError::NotFound(format!("cache record {}", record.digest)))?;
		let data = fs::read(blob_path(&self.dir, &blob)).await?;
		if Digest::from_bytes(&data) != blob {
			return Err(BuildError::Cache(format!("blob {} failed verification", blob)));
		}

		let worker = self
			.worker
			.as_any()
			.downcast_ref::<LocalWorker>()
			.ok_or_else(|| {
				BuildError::InvalidReference(format!(
					"worker {} cannot load local cache blobs",
					self.worker.id()
				))
			})?;
		Ok(worker.snapshot(decode_blob(&data)?))
	}

	async fn save(
		&self,
		_ctx: &Context,
		record: CacheRecord,
		result: Arc<dyn SolverResult>,
	) -> BuildResult<()> {
		result.release(&Context::background()).await.ok();
		Err(BuildError::Cache(format!(
			"imported cache {} is read-only (record {})",
			self.id, record.digest
		)))
	}
}
