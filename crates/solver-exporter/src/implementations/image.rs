//! Records solve results as images in an in-process store.
//!
//! An image is identified by the digest of its manifest, which lists the
//! content digest of every file per reference plus the result metadata.
//! Exporting the same content twice yields the same digest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use solver_types::{
	BuildError, BuildResult, Context, Digest, ExportSource, ExporterInstance, ImmutableRef,
};
use solver_worker::implementations::local::LocalSnapshot;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

pub const IMAGE_DIGEST_KEY: &str = "containerimage.digest";
pub const IMAGE_NAME_KEY: &str = "image.name";

/// Layer name used for the primary reference in a manifest.
const PRIMARY_LAYER: &str = "";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
	/// Per reference name, the digest of every file.
	pub layers: BTreeMap<String, BTreeMap<String, Digest>>,
	/// Hex-encoded metadata values.
	pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
	pub digest: Digest,
	pub name: Option<String>,
	pub manifest: ImageManifest,
	pub created_at: DateTime<Utc>,
}

/// Images exported so far, by digest, plus a name index.
#[derive(Debug, Default)]
pub struct ImageStore {
	images: DashMap<Digest, ImageRecord>,
	names: DashMap<String, Digest>,
}

impl ImageStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, digest: &Digest) -> Option<ImageRecord> {
		self.images.get(digest).map(|r| r.value().clone())
	}

	pub fn resolve(&self, name: &str) -> Option<ImageRecord> {
		let digest = self.names.get(name)?.value().clone();
		self.get(&digest)
	}

	pub fn len(&self) -> usize {
		self.images.len()
	}

	pub fn is_empty(&self) -> bool {
		self.images.is_empty()
	}

	fn insert(&self, record: ImageRecord) {
		if let Some(name) = &record.name {
			self.names.insert(name.clone(), record.digest.clone());
		}
		self.images.insert(record.digest.clone(), record);
	}
}

pub struct ImageExporter {
	name: Option<String>,
	store: Arc<ImageStore>,
}

impl ImageExporter {
	pub fn new(name: Option<String>, store: Arc<ImageStore>) -> Self {
		Self { name, store }
	}

	fn layer(reference: &dyn ImmutableRef) -> BuildResult<BTreeMap<String, Digest>> {
		Ok(LocalSnapshot::files_of(reference)?
			.iter()
			.map(|(path, content)| (path.clone(), Digest::from_bytes(content)))
			.collect())
	}

	fn manifest(source: &ExportSource) -> BuildResult<ImageManifest> {
		let mut layers = BTreeMap::new();
		if let Some(reference) = &source.reference {
			layers.insert(PRIMARY_LAYER.to_string(), Self::layer(reference.as_ref())?);
		}
		if let Some(refs) = &source.refs {
			for (name, reference) in refs {
				if let Some(reference) = reference {
					layers.insert(name.clone(), Self::layer(reference.as_ref())?);
				}
			}
		}
		if layers.is_empty() {
			return Err(BuildError::Export(
				"image exporter needs at least one reference".to_string(),
			));
		}

		let metadata = source
			.metadata
			.iter()
			.map(|(k, v)| (k.clone(), hex::encode(v)))
			.collect();
		Ok(ImageManifest { layers, metadata })
	}
}

#[async_trait]
impl ExporterInstance for ImageExporter {
	fn name(&self) -> String {
		"image".to_string()
	}

	async fn export(
		&self,
		_ctx: &Context,
		source: ExportSource,
	) -> BuildResult<HashMap<String, String>> {
		let manifest = Self::manifest(&source)?;
		let digest = Digest::from_bytes(serde_json::to_vec(&manifest)?);

		self.store.insert(ImageRecord {
			digest: digest.clone(),
			name: self.name.clone(),
			manifest,
			created_at: Utc::now(),
		});
		info!(
			"Exported image {}{}",
			digest,
			self.name
				.as_deref()
				.map(|n| format!(" as {}", n))
				.unwrap_or_default()
		);

		let mut response = HashMap::new();
		response.insert(IMAGE_DIGEST_KEY.to_string(), digest.to_string());
		if let Some(name) = &self.name {
			response.insert(IMAGE_NAME_KEY.to_string(), name.clone());
		}
		Ok(response)
	}
}
