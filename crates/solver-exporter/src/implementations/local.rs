//! Exports snapshot files into a local directory.
//!
//! The primary reference is written to the destination itself; each named
//! reference goes into a sub-directory of the same name.

use async_trait::async_trait;
use solver_types::{BuildError, BuildResult, Context, ExportSource, ExporterInstance, ImmutableRef};
use solver_worker::implementations::local::LocalSnapshot;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

pub struct LocalExporter {
	dest: PathBuf,
}

impl LocalExporter {
	pub fn new(dest: PathBuf) -> Self {
		Self { dest }
	}

	/// Joins a relative path below `base`, refusing anything that would
	/// escape it.
	fn safe_join(base: &Path, relative: &str) -> BuildResult<PathBuf> {
		let relative = Path::new(relative);
		let escapes = relative
			.components()
			.any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
		if escapes || relative.as_os_str().is_empty() {
			return Err(BuildError::Export(format!(
				"refusing to write outside destination: {}",
				relative.display()
			)));
		}
		Ok(base.join(relative))
	}

	async fn write_snapshot(&self, dir: &Path, reference: &dyn ImmutableRef) -> BuildResult<usize> {
		let files = LocalSnapshot::files_of(reference)?;
		fs::create_dir_all(dir).await?;
		for (path, content) in files {
			let target = Self::safe_join(dir, path)?;
			if let Some(parent) = target.parent() {
				fs::create_dir_all(parent).await?;
			}
			fs::write(&target, content).await?;
		}
		debug!("Wrote {} files to {}", files.len(), dir.display());
		Ok(files.len())
	}
}

#[async_trait]
impl ExporterInstance for LocalExporter {
	fn name(&self) -> String {
		"local".to_string()
	}

	async fn export(
		&self,
		_ctx: &Context,
		source: ExportSource,
	) -> BuildResult<HashMap<String, String>> {
		let mut written = 0;
		if let Some(reference) = &source.reference {
			written += self.write_snapshot(&self.dest, reference.as_ref()).await?;
		}
		if let Some(refs) = &source.refs {
			let mut names: Vec<&String> = refs.keys().collect();
			names.sort();
			for name in names {
				let Some(reference) = &refs[name] else {
					continue;
				};
				let dir = Self::safe_join(&self.dest, name)?;
				written += self.write_snapshot(&dir, reference.as_ref()).await?;
			}
		}

		info!("Exported {} files to {}", written, self.dest.display());
		let mut response = HashMap::new();
		response.insert("local.dest".to_string(), self.dest.display().to_string());
		response.insert("local.files".to_string(), written.to_string());
		Ok(response)
	}
}
