//! Serialized build graphs and their loaded vertex form.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::Digest;

/// One operation in a serialized graph. `op` is opaque to the solver and
/// only interpreted by the worker that resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDef {
	pub name: String,
	pub op: serde_json::Value,
	/// Indices of earlier entries this operation consumes.
	#[serde(default)]
	pub inputs: Vec<usize>,
}

/// A serialized build graph in dependency order; the last entry is the
/// output of the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definition {
	pub ops: Vec<OpDef>,
}

impl Definition {
	pub fn new(ops: Vec<OpDef>) -> Self {
		Self { ops }
	}

	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}
}

/// A loaded graph vertex with resolved inputs.
#[derive(Debug)]
pub struct OpVertex {
	pub digest: Digest,
	pub name: String,
	pub op: serde_json::Value,
	pub inputs: Vec<Arc<OpVertex>>,
}

impl OpVertex {
	pub fn input_digests(&self) -> Vec<Digest> {
		self.inputs.iter().map(|i| i.digest.clone()).collect()
	}
}
