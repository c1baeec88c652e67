//! Configuration types for the solver.

use crate::serde_helpers::{
	deserialize_millis, deserialize_platforms, serialize_millis, serialize_platforms,
};
use serde::{Deserialize, Serialize};
use solver_types::{CacheExportMode, Platform};
use std::time::Duration;

/// Complete solver configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SolverConfig {
	/// Solver identity and release/status tuning
	#[serde(default)]
	pub solver: SolverSettings,
	/// Registered workers, as `[[worker]]` tables
	#[serde(default = "default_workers", rename = "worker")]
	pub workers: Vec<WorkerConfig>,
	/// Frontends available to solve requests
	#[serde(default)]
	pub frontends: FrontendsConfig,
	/// Remote cache defaults
	#[serde(default)]
	pub cache: CacheConfig,
}

impl Default for SolverConfig {
	fn default() -> Self {
		Self {
			solver: SolverSettings::default(),
			workers: default_workers(),
			frontends: FrontendsConfig::default(),
			cache: CacheConfig::default(),
		}
	}
}

impl SolverConfig {
	/// The worker marked `default`, else the first one.
	pub fn default_worker(&self) -> Option<&WorkerConfig> {
		self.workers
			.iter()
			.find(|w| w.default)
			.or_else(|| self.workers.first())
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SolverSettings {
	/// Solver name, used in logs
	pub name: String,
	/// Fallback log filter when `RUST_LOG` is unset
	pub log_level: String,
	/// Tasks releasing references after each solve
	pub release_workers: usize,
	/// Pending release batches before submissions spill into extra tasks
	pub release_queue_size: usize,
	/// How long a status request waits for a job id to be registered
	#[serde(
		rename = "status_grace_ms",
		deserialize_with = "deserialize_millis",
		serialize_with = "serialize_millis"
	)]
	pub status_grace: Duration,
}

impl Default for SolverSettings {
	fn default() -> Self {
		Self {
			name: "buildsolve".to_string(),
			log_level: "info".to_string(),
			release_workers: 4,
			release_queue_size: 256,
			status_grace: Duration::from_secs(1),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkerConfig {
	pub id: String,
	/// Platforms the worker advertises; empty means the host platform
	#[serde(
		default,
		deserialize_with = "deserialize_platforms",
		serialize_with = "serialize_platforms"
	)]
	pub platforms: Vec<Platform>,
	#[serde(default)]
	pub default: bool,
}

impl WorkerConfig {
	pub fn platforms_or_host(&self) -> Vec<Platform> {
		if self.platforms.is_empty() {
			vec![Platform::host()]
		} else {
			self.platforms.clone()
		}
	}
}

fn default_workers() -> Vec<WorkerConfig> {
	vec![WorkerConfig {
		id: "local".to_string(),
		platforms: Vec::new(),
		default: true,
	}]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FrontendsConfig {
	pub enabled: Vec<String>,
}

impl Default for FrontendsConfig {
	fn default() -> Self {
		Self {
			enabled: vec!["definition.v0".to_string(), "multiplatform.v0".to_string()],
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
	/// Importer type for cache references without a `type:` prefix
	pub import_type: String,
	/// Export mode used when a request does not pick one
	pub export_mode: CacheExportMode,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			import_type: "local".to_string(),
			export_mode: CacheExportMode::Min,
		}
	}
}
