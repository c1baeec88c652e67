//! Configuration loading for the build solver.
//!
//! Configuration is read from a TOML (or JSON) file, with `${VAR}` and
//! `${VAR:-fallback}` references substituted from the environment before
//! parsing. `BUILDSOLVE_*` variables then override individual settings.

use regex::Regex;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub mod serde_helpers;
pub mod types;

pub use types::*;

pub const DEFAULT_ENV_PREFIX: &str = "BUILDSOLVE_";

/// Files checked by [`load_config`] when no path is given.
const DEFAULT_LOCATIONS: [&str; 2] = ["./buildsolve.toml", "./config/buildsolve.toml"];

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

/// Configuration loader with environment variable substitution
pub struct ConfigLoader {
	file_path: Option<PathBuf>,
	env_prefix: String,
}

impl Default for ConfigLoader {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: DEFAULT_ENV_PREFIX.to_string(),
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_path_buf());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	/// Loads the file (or the defaults when none was given), applies
	/// environment overrides and validates the result.
	pub async fn load(&self) -> Result<SolverConfig, ConfigError> {
		let mut config = match &self.file_path {
			Some(path) => self.load_from_file(path).await?,
			None => {
				debug!("No configuration file given; using defaults");
				SolverConfig::default()
			}
		};

		self.apply_env_overrides(&mut config)?;
		validate_config(&config)?;

		Ok(config)
	}

	async fn load_from_file(&self, path: &Path) -> Result<SolverConfig, ConfigError> {
		info!("Loading configuration from {}", path.display());
		let content = tokio::fs::read_to_string(path).await.map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				ConfigError::FileNotFound(path.display().to_string())
			} else {
				ConfigError::IoError(e)
			}
		})?;

		let substituted = substitute_env_vars(&content)?;

		match path.extension().and_then(|s| s.to_str()) {
			Some("json") => serde_json::from_str(&substituted)
				.map_err(|e| ConfigError::ParseError(e.to_string())),
			_ => toml::from_str(&substituted).map_err(|e| ConfigError::ParseError(e.to_string())),
		}
	}

	fn env_var(&self, key: &str) -> Option<String> {
		env::var(format!("{}{}", self.env_prefix, key)).ok()
	}

	fn apply_env_overrides(&self, config: &mut SolverConfig) -> Result<(), ConfigError> {
		if let Some(name) = self.env_var("NAME") {
			config.solver.name = name;
		}

		if let Some(log_level) = self.env_var("LOG_LEVEL") {
			config.solver.log_level = log_level;
		}

		if let Some(workers) = self.env_var("RELEASE_WORKERS") {
			config.solver.release_workers = workers.parse().map_err(|e| {
				ConfigError::ValidationError(format!("Invalid release worker count: {}", e))
			})?;
		}

		if let Some(grace) = self.env_var("STATUS_GRACE_MS") {
			let millis: u64 = grace.parse().map_err(|e| {
				ConfigError::ValidationError(format!("Invalid status grace: {}", e))
			})?;
			config.solver.status_grace = std::time::Duration::from_millis(millis);
		}

		if let Some(enabled) = self.env_var("FRONTENDS") {
			config.frontends.enabled = enabled
				.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(String::from)
				.collect();
		}

		Ok(())
	}
}

/// Replaces `${VAR}` and `${VAR:-fallback}` with environment values.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
	let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
		.map_err(|e| ConfigError::ParseError(e.to_string()))?;

	let mut result = String::with_capacity(content.len());
	let mut last = 0;
	for cap in re.captures_iter(content) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match (env::var(var_name.as_str()), cap.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(fallback)) => fallback.as_str().to_string(),
			(Err(_), None) => {
				return Err(ConfigError::EnvVarNotFound(var_name.as_str().to_string()));
			}
		};
		result.push_str(&content[last..full_match.start()]);
		result.push_str(&value);
		last = full_match.end();
	}
	result.push_str(&content[last..]);

	Ok(result)
}

pub fn validate_config(config: &SolverConfig) -> Result<(), ConfigError> {
	if config.solver.release_workers == 0 {
		return Err(ConfigError::ValidationError(
			"release_workers must be at least 1".to_string(),
		));
	}

	if config.solver.release_queue_size == 0 {
		return Err(ConfigError::ValidationError(
			"release_queue_size must be at least 1".to_string(),
		));
	}

	if config.workers.is_empty() {
		return Err(ConfigError::ValidationError(
			"At least one worker must be configured".to_string(),
		));
	}

	let mut ids = HashSet::new();
	for worker in &config.workers {
		if worker.id.trim().is_empty() {
			return Err(ConfigError::ValidationError(
				"Worker id must not be empty".to_string(),
			));
		}
		if !ids.insert(worker.id.as_str()) {
			return Err(ConfigError::ValidationError(format!(
				"Duplicate worker id: {}",
				worker.id
			)));
		}
	}

	if config.workers.iter().filter(|w| w.default).count() > 1 {
		return Err(ConfigError::ValidationError(
			"Only one worker can be the default".to_string(),
		));
	}

	if config.frontends.enabled.iter().any(|f| f.trim().is_empty()) {
		return Err(ConfigError::ValidationError(
			"Frontend names must not be empty".to_string(),
		));
	}

	Ok(())
}

/// Loads configuration from `path`, else from `BUILDSOLVE_CONFIG`, else from
/// the first default location that exists, else the defaults.
pub async fn load_config(path: Option<&Path>) -> Result<SolverConfig, ConfigError> {
	let loader = ConfigLoader::new();

	if let Some(path) = path {
		return loader.with_file(path).load().await;
	}

	if let Ok(path) = env::var(format!("{}CONFIG", DEFAULT_ENV_PREFIX)) {
		return loader.with_file(path).load().await;
	}

	for candidate in DEFAULT_LOCATIONS {
		if Path::new(candidate).exists() {
			return loader.with_file(candidate).load().await;
		}
	}

	loader.load().await
}
