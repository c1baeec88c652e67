//! Progress records emitted while a job runs.
//!
//! Writers push [`ProgressEvent`]s into a [`ProgressSink`]; status readers
//! receive them folded into [`SolveStatus`] batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Context, Digest};

/// Metadata key carrying the digest of the vertex a write belongs to.
pub const VERTEX_METADATA_KEY: &str = "vertex";

/// A node in the progress stream, either a graph operation or a synthetic
/// phase such as an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertex {
	pub digest: Digest,
	#[serde(default)]
	pub inputs: Vec<Digest>,
	pub name: String,
	pub started: Option<DateTime<Utc>>,
	pub completed: Option<DateTime<Utc>>,
	#[serde(default)]
	pub cached: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl Vertex {
	pub fn new(digest: Digest, name: impl Into<String>) -> Self {
		Self {
			digest,
			inputs: Vec::new(),
			name: name.into(),
			started: None,
			completed: None,
			cached: false,
			error: None,
		}
	}

	pub fn is_completed(&self) -> bool {
		self.completed.is_some()
	}
}

/// Progress of a named sub-task within a vertex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStatus {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub action: Option<String>,
	#[serde(default)]
	pub current: u64,
	#[serde(default)]
	pub total: u64,
	pub started: Option<DateTime<Utc>>,
	pub completed: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressPayload {
	Vertex(Vertex),
	Status(ProgressStatus),
}

/// One atomic write into a progress sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
	pub id: String,
	pub timestamp: DateTime<Utc>,
	#[serde(default)]
	pub metadata: HashMap<String, String>,
	pub payload: ProgressPayload,
}

/// Destination for progress writes. Implementations must accept writes
/// from many tasks at once and keep each event intact.
pub trait ProgressSink: Send + Sync {
	fn write(&self, event: ProgressEvent);
}

/// A status record for a sub-task, attributed to the vertex it ran under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexStatus {
	pub id: String,
	pub vertex: Option<Digest>,
	pub name: String,
	pub current: u64,
	pub total: u64,
	pub timestamp: DateTime<Utc>,
	pub started: Option<DateTime<Utc>>,
	pub completed: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// A batch of updates delivered to status subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveStatus {
	pub vertexes: Vec<Vertex>,
	pub statuses: Vec<VertexStatus>,
}

impl SolveStatus {
	pub fn is_empty(&self) -> bool {
		self.vertexes.is_empty() && self.statuses.is_empty()
	}
}

impl From<&ProgressEvent> for SolveStatus {
	fn from(event: &ProgressEvent) -> Self {
		match &event.payload {
			ProgressPayload::Vertex(vertex) => SolveStatus {
				vertexes: vec![vertex.clone()],
				statuses: Vec::new(),
			},
			ProgressPayload::Status(status) => SolveStatus {
				vertexes: Vec::new(),
				statuses: vec![VertexStatus {
					id: event.id.clone(),
					vertex: event
						.metadata
						.get(VERTEX_METADATA_KEY)
						.and_then(|d| Digest::parse(d)),
					name: status.action.clone().unwrap_or_else(|| event.id.clone()),
					current: status.current,
					total: status.total,
					timestamp: event.timestamp,
					started: status.started,
					completed: status.completed,
					error: status.error.clone(),
				}],
			},
		}
	}
}

/// Marks `vertex` as started and writes it to the context's sink.
pub fn notify_started(ctx: &Context, vertex: &mut Vertex, cached: bool) {
	vertex.started = Some(Utc::now());
	vertex.completed = None;
	vertex.cached = cached;
	ctx.write_progress(vertex.digest.to_string(), ProgressPayload::Vertex(vertex.clone()));
}

/// Marks `vertex` as completed, recording `error` if any, and writes it to
/// the context's sink. A vertex that never started gets the same start
/// and completion time.
pub fn notify_completed(ctx: &Context, vertex: &mut Vertex, error: Option<&str>, cached: bool) {
	let now = Utc::now();
	if vertex.started.is_none() {
		vertex.started = Some(now);
	}
	vertex.completed = Some(now);
	vertex.cached = cached;
	if let Some(error) = error {
		vertex.error = Some(error.to_string());
	}
	ctx.write_progress(vertex.digest.to_string(), ProgressPayload::Vertex(vertex.clone()));
}
