//! `definition.v0`: solves the graph definition passed in its options.

use async_trait::async_trait;
use solver_types::{BuildResult, Context, Frontend, FrontendBridge, FrontendResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::{definition_request, definition_source, parse_definition};

#[derive(Debug, Default)]
pub struct DefinitionFrontend;

#[async_trait]
impl Frontend for DefinitionFrontend {
	async fn solve(
		&self,
		ctx: &Context,
		bridge: Arc<dyn FrontendBridge>,
		opts: &HashMap<String, String>,
	) -> BuildResult<FrontendResult> {
		let definition = parse_definition(definition_source(opts)?)?;
		debug!("definition.v0 solving {} ops", definition.ops.len());
		bridge.solve(ctx, definition_request(definition, opts)).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::RecordingBridge;
	use crate::{CACHE_FROM_OPT, DEFINITION_OPT};
	use solver_types::BuildError;
	use solver_worker::implementations::local::LocalSnapshot;

	const SOURCE: &str = r#"{"ops":[{"name":"src","op":{"type":"source","files":{"a":"1"}}}]}"#;

	#[tokio::test]
	async fn test_solves_definition_option() {
		let bridge = RecordingBridge::new(vec![]);
		let mut opts = HashMap::new();
		opts.insert(DEFINITION_OPT.to_string(), SOURCE.to_string());
		opts.insert(CACHE_FROM_OPT.to_string(), "local:/cache".to_string());

		let res = DefinitionFrontend
			.solve(&Context::background(), bridge.clone(), &opts)
			.await
			.unwrap();

		let reference = res.reference.unwrap();
		let worker_ref = solver_worker::as_worker_ref(reference.result().as_ref()).unwrap();
		let files = LocalSnapshot::files_of(worker_ref.immutable_ref.as_ref()).unwrap();
		assert_eq!(files["a"], b"1".to_vec());

		let requests = bridge.requests();
		assert_eq!(requests.len(), 1);
		assert_eq!(requests[0].import_cache_refs, vec!["local:/cache"]);
	}

	#[tokio::test]
	async fn test_missing_definition_never_reaches_bridge() {
		let bridge = RecordingBridge::new(vec![]);
		let err = DefinitionFrontend
			.solve(&Context::background(), bridge.clone(), &HashMap::new())
			.await
			.unwrap_err();
		assert!(matches!(err, BuildError::InvalidDefinition(_)));
		assert!(bridge.requests().is_empty());
	}
}
