//! Built-in frontends for the build solver.
//!
//! A frontend turns its options into one or more graph solves through the
//! bridge it is handed. Both built-ins read a JSON graph definition from
//! the `definition` option and forward `cache-from` (comma separated) as
//! cache imports.

use solver_types::{BuildError, BuildResult, Definition, Frontend, SolveRequest};
use std::collections::HashMap;
use std::sync::Arc;

/// Re-export implementations
pub mod implementations {
	pub mod definition;
	pub mod multiplatform;
}

pub use implementations::definition::DefinitionFrontend;
pub use implementations::multiplatform::MultiPlatformFrontend;

pub const DEFINITION_FRONTEND: &str = "definition.v0";
pub const MULTIPLATFORM_FRONTEND: &str = "multiplatform.v0";

pub const DEFINITION_OPT: &str = "definition";
pub const CACHE_FROM_OPT: &str = "cache-from";

/// Instantiates the named built-in frontends.
pub fn builtin_frontends(enabled: &[String]) -> BuildResult<HashMap<String, Arc<dyn Frontend>>> {
	let mut frontends: HashMap<String, Arc<dyn Frontend>> = HashMap::new();
	for name in enabled {
		let frontend: Arc<dyn Frontend> = match name.as_str() {
			DEFINITION_FRONTEND => Arc::new(DefinitionFrontend),
			MULTIPLATFORM_FRONTEND => Arc::new(MultiPlatformFrontend),
			other => {
				return Err(BuildError::NotFound(format!("unknown frontend: {}", other)));
			}
		};
		frontends.insert(name.clone(), frontend);
	}
	Ok(frontends)
}

/// Reads the `definition` option as raw JSON text.
pub(crate) fn definition_source(opts: &HashMap<String, String>) -> BuildResult<&str> {
	opts.get(DEFINITION_OPT)
		.map(String::as_str)
		.filter(|s| !s.trim().is_empty())
		.ok_or_else(|| {
			BuildError::InvalidDefinition(format!("missing frontend option {}", DEFINITION_OPT))
		})
}

pub(crate) fn parse_definition(source: &str) -> BuildResult<Definition> {
	let definition: Definition = serde_json::from_str(source)
		.map_err(|e| BuildError::InvalidDefinition(format!("malformed definition: {}", e)))?;
	if definition.is_empty() {
		return Err(BuildError::InvalidDefinition("definition has no ops".to_string()));
	}
	Ok(definition)
}

/// A definition solve carrying the frontend's cache imports.
pub(crate) fn definition_request(
	definition: Definition,
	opts: &HashMap<String, String>,
) -> SolveRequest {
	let mut req = SolveRequest::with_definition(definition);
	if let Some(refs) = opts.get(CACHE_FROM_OPT) {
		req.import_cache_refs = refs
			.split(',')
			.map(str::trim)
			.filter(|r| !r.is_empty())
			.map(String::from)
			.collect();
	}
	req
}
