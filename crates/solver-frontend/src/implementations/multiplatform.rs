//! `multiplatform.v0`: solves one definition template per target platform.
//!
//! Every `{{platform}}` in the `definition` option is replaced with the
//! platform being built (`os/arch[/variant]`). Targets come from the
//! `platforms` option (comma separated), else from the worker, else the
//! host. The result holds one named ref per platform and lists the
//! platforms under the `refs.platforms` metadata key.

use async_trait::async_trait;
use futures::future::join_all;
use solver_types::{
	BuildError, BuildResult, Context, Frontend, FrontendBridge, FrontendResult, Platform,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{definition_request, definition_source, parse_definition};

pub const PLATFORMS_OPT: &str = "platforms";
pub const PLATFORMS_META_KEY: &str = "refs.platforms";
const PLATFORM_PLACEHOLDER: &str = "{{platform}}";

#[derive(Debug, Default)]
pub struct MultiPlatformFrontend;

impl MultiPlatformFrontend {
	fn targets(bridge: &dyn FrontendBridge, opts: &HashMap<String, String>) -> BuildResult<Vec<Platform>> {
		let mut targets = match opts.get(PLATFORMS_OPT) {
			Some(list) => list
				.split(',')
				.map(str::trim)
				.filter(|p| !p.is_empty())
				.map(|p| p.parse::<Platform>().map_err(BuildError::InvalidDefinition))
				.collect::<BuildResult<Vec<_>>>()?,
			None => bridge.platforms(),
		};
		if targets.is_empty() {
			targets.push(Platform::host());
		}
		let mut seen = HashSet::new();
		targets.retain(|p| seen.insert(p.to_string()));
		Ok(targets)
	}
}

async fn release_all(results: &[FrontendResult]) {
	let ctx = Context::background();
	for res in results {
		for r in res.all_refs() {
			if let Err(e) = r.release(&ctx).await {
				warn!("Failed to release {} after platform build failure: {}", r.id(), e);
			}
		}
	}
}

#[async_trait]
impl Frontend for MultiPlatformFrontend {
	async fn solve(
		&self,
		ctx: &Context,
		bridge: Arc<dyn FrontendBridge>,
		opts: &HashMap<String, String>,
	) -> BuildResult<FrontendResult> {
		let template = definition_source(opts)?;
		let targets = Self::targets(bridge.as_ref(), opts)?;
		debug!("multiplatform.v0 building for {} platforms", targets.len());

		let mut requests = Vec::with_capacity(targets.len());
		for platform in &targets {
			let source = template.replace(PLATFORM_PLACEHOLDER, &platform.to_string());
			requests.push(definition_request(parse_definition(&source)?, opts));
		}

		let outcomes = join_all(requests.into_iter().map(|req| bridge.solve(ctx, req))).await;

		let mut solved = Vec::with_capacity(outcomes.len());
		let mut first_err = None;
		for outcome in outcomes {
			match outcome {
				Ok(res) => solved.push(res),
				Err(e) => {
					first_err.get_or_insert(e);
				}
			}
		}
		if let Some(e) = first_err {
			release_all(&solved).await;
			return Err(e);
		}

		let mut result = FrontendResult::default();
		let names: Vec<String> = targets.iter().map(Platform::to_string).collect();
		for (name, res) in names.iter().zip(solved) {
			result.add_ref(name.clone(), res.reference);
		}
		result.add_meta(PLATFORMS_META_KEY, serde_json::to_vec(&names)?);
		Ok(result)
	}
}
