//! Content exporters for the build solver.
//!
//! An exporter takes the snapshots a solve produced and puts them
//! somewhere: the `local` exporter copies their files into a directory and
//! the `image` exporter records them as an image in an [`ImageStore`].

use solver_types::{BuildError, BuildResult, ExporterInstance};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Re-export implementations
pub mod implementations {
	pub mod image;
	pub mod local;
}

pub use implementations::image::{ImageExporter, ImageRecord, ImageStore};
pub use implementations::local::LocalExporter;

pub const LOCAL_EXPORTER: &str = "local";
pub const IMAGE_EXPORTER: &str = "image";

/// Creates the exporter called `name`.
///
/// `local` requires a `dest` attribute; `image` takes an optional `name`.
pub fn create_exporter(
	name: &str,
	attrs: &HashMap<String, String>,
	images: Arc<ImageStore>,
) -> BuildResult<Arc<dyn ExporterInstance>> {
	match name {
		LOCAL_EXPORTER => {
			let dest = attrs.get("dest").ok_or_else(|| {
				BuildError::Export("local exporter requires a dest attribute".to_string())
			})?;
			Ok(Arc::new(LocalExporter::new(PathBuf::from(dest))))
		}
		IMAGE_EXPORTER => Ok(Arc::new(ImageExporter::new(
			attrs.get("name").cloned(),
			images,
		))),
		other => Err(BuildError::NotFound(format!("exporter not found: {}", other))),
	}
}
