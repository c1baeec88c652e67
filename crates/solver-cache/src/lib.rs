//! Remote cache exporters and importers for the build solver.
//!
//! Cache provenance leaves the solver through a [`CacheExporter`] and comes
//! back through a [`CacheImporter`] that turns a cache reference into a
//! read-only cache manager. The `local` backend keeps both sides in a
//! directory holding an `index.json` and one blob per exported result.

use solver_types::{
	parse_cache_ref, BuildError, BuildResult, CacheExporter, CacheImporter, ResolveCacheImporterFn,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Re-export implementations
pub mod implementations {
	pub mod local;
}

pub use implementations::local::{CacheIndex, LocalCacheExporter, LocalCacheImporter};

pub const LOCAL_CACHE: &str = "local";

/// Resolver for `--cache-from` style references. References without a
/// type prefix are treated as local directories.
pub fn local_importer_resolver() -> ResolveCacheImporterFn {
	Arc::new(|typ: &str, _reference: &str| match typ {
		"" | LOCAL_CACHE => Ok(Arc::new(LocalCacheImporter::new()) as Arc<dyn CacheImporter>),
		other => Err(BuildError::NotFound(format!("unknown cache importer: {}", other))),
	})
}

/// Creates the cache exporter for a `type:reference` cache reference.
pub fn create_cache_exporter(cache_ref: &str) -> BuildResult<Arc<dyn CacheExporter>> {
	match parse_cache_ref(cache_ref) {
		("" | LOCAL_CACHE, dir) if !dir.is_empty() => {
			Ok(Arc::new(LocalCacheExporter::new(PathBuf::from(dir))))
		}
		("" | LOCAL_CACHE, _) => Err(BuildError::Cache(
			"local cache export requires a directory".to_string(),
		)),
		(other, _) => Err(BuildError::NotFound(format!("unknown cache exporter: {}", other))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_resolvers_accept_local_only() {
		let resolve = local_importer_resolver();
		assert!(resolve("local", "/tmp/c").is_ok());
		assert!(resolve("", "/tmp/c").is_ok());
		assert!(resolve("registry", "example/app").is_err());

		assert_eq!(create_cache_exporter("local:/tmp/c").unwrap().name(), "local");
		assert!(create_cache_exporter("local:").is_err());
		assert!(create_cache_exporter("s3:bucket").is_err());
	}
}
