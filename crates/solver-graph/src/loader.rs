//! Loads serialized definitions into vertex graphs.

use serde_json::json;
use solver_types::{BuildError, BuildResult, Definition, Digest, OpVertex};
use std::sync::Arc;

/// Loads `def` and returns its output vertex. Inputs must refer to earlier
/// entries, so the graph is acyclic by construction. A vertex digest covers
/// the op payload and the digests of its inputs, not its display name.
pub fn load(def: &Definition) -> BuildResult<Arc<OpVertex>> {
	let mut vertices: Vec<Arc<OpVertex>> = Vec::with_capacity(def.ops.len());

	for (index, op) in def.ops.iter().enumerate() {
		let mut inputs = Vec::with_capacity(op.inputs.len());
		for &input in &op.inputs {
			if input >= index {
				return Err(BuildError::InvalidDefinition(format!(
					"op {} ({}) references input {} which is not defined before it",
					index, op.name, input
				)));
			}
			inputs.push(vertices[input].clone());
		}

		let input_digests: Vec<String> = inputs.iter().map(|i| i.digest.to_string()).collect();
		let canonical = serde_json::to_vec(&json!({
			"op": op.op,
			"inputs": input_digests,
		}))?;

		vertices.push(Arc::new(OpVertex {
			digest: Digest::from_bytes(canonical),
			name: op.name.clone(),
			op: op.op.clone(),
			inputs,
		}));
	}

	vertices
		.pop()
		.ok_or_else(|| BuildError::InvalidDefinition("empty definition".to_string()))
}
