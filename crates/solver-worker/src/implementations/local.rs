//! In-process worker that builds file trees in memory.
//!
//! Snapshots are immutable maps of path to bytes. Every handle to a snapshot
//! is counted in a [`SnapshotStore`] so callers can check that each handle
//! was released exactly once.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use solver_types::{
	BuildError, BuildResult, Context, FrontendBridge, ImmutableRef, Op, OpVertex, Platform,
	SolverResult, Worker,
};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{as_worker_ref, WorkerRef};

pub type Files = BTreeMap<String, Vec<u8>>;

/// Tracks live handles per snapshot.
#[derive(Debug, Default)]
pub struct SnapshotStore {
	next_id: AtomicU64,
	handles: DashMap<String, usize>,
}

impl SnapshotStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn create(self: &Arc<Self>, files: Arc<Files>) -> LocalSnapshot {
		let id = format!("snapshot-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
		self.handles.insert(id.clone(), 1);
		LocalSnapshot::new(id, files, self.clone())
	}

	fn acquire(&self, id: &str) {
		*self.handles.entry(id.to_string()).or_insert(0) += 1;
	}

	fn release(&self, id: &str) {
		let remaining = match self.handles.get_mut(id) {
			Some(mut count) => {
				*count = count.saturating_sub(1);
				*count
			}
			None => return,
		};
		if remaining == 0 {
			self.handles.remove(id);
			debug!("Snapshot {} has no live handles left", id);
		}
	}

	/// Live handles for one snapshot.
	pub fn handles(&self, id: &str) -> usize {
		self.handles.get(id).map(|c| *c).unwrap_or(0)
	}

	/// Live handles across all snapshots.
	pub fn active_handles(&self) -> usize {
		self.handles.iter().map(|entry| *entry.value()).sum()
	}
}

/// One handle to an in-memory snapshot.
#[derive(Debug)]
pub struct LocalSnapshot {
	id: String,
	files: Arc<Files>,
	store: Arc<SnapshotStore>,
	released: AtomicBool,
}

impl LocalSnapshot {
	fn new(id: String, files: Arc<Files>, store: Arc<SnapshotStore>) -> Self {
		Self {
			id,
			files,
			store,
			released: AtomicBool::new(false),
		}
	}

	pub fn files(&self) -> &Files {
		&self.files
	}

	pub fn is_released(&self) -> bool {
		self.released.load(Ordering::SeqCst)
	}

	/// Reads the file tree behind any reference produced by a local worker.
	pub fn files_of(reference: &dyn ImmutableRef) -> BuildResult<&Files> {
		reference
			.as_any()
			.downcast_ref::<LocalSnapshot>()
			.map(|s| s.files())
			.ok_or_else(|| {
				BuildError::InvalidReference(format!("{} is not a local snapshot", reference.id()))
			})
	}
}

#[async_trait]
impl ImmutableRef for LocalSnapshot {
	fn id(&self) -> String {
		self.id.clone()
	}

	fn clone_ref(&self) -> Arc<dyn ImmutableRef> {
		self.store.acquire(&self.id);
		Arc::new(LocalSnapshot::new(
			self.id.clone(),
			self.files.clone(),
			self.store.clone(),
		))
	}

	async fn release(&self, _ctx: &Context) -> BuildResult<()> {
		if self.released.swap(true, Ordering::SeqCst) {
			warn!("Snapshot handle {} released twice", self.id);
			return Err(BuildError::InvalidReference(format!(
				"{} already released",
				self.id
			)));
		}
		self.store.release(&self.id);
		Ok(())
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Operations understood by the local worker, decoded from a vertex's op
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalOp {
	/// A new tree from literal files.
	Source { files: BTreeMap<String, String> },
	/// Union of all inputs; later inputs win on conflicts.
	Merge,
	/// The single input with one file added or replaced.
	Write { path: String, content: String },
	/// Always fails with the given message.
	Fail { message: String },
}

impl LocalOp {
	fn check_inputs(&self, count: usize) -> Result<(), String> {
		match self {
			LocalOp::Source { .. } if count != 0 => Err("source takes no inputs".to_string()),
			LocalOp::Merge if count == 0 => Err("merge needs at least one input".to_string()),
			LocalOp::Write { .. } if count != 1 => Err("write takes exactly one input".to_string()),
			_ => Ok(()),
		}
	}
}

#[derive(Debug)]
pub struct LocalWorker {
	id: String,
	platforms: Vec<Platform>,
	store: Arc<SnapshotStore>,
}

impl LocalWorker {
	pub fn new(id: impl Into<String>, platforms: Vec<Platform>) -> Self {
		Self {
			id: id.into(),
			platforms,
			store: Arc::new(SnapshotStore::new()),
		}
	}

	pub fn store(&self) -> &Arc<SnapshotStore> {
		&self.store
	}

	/// Creates a snapshot owned by this worker, wrapped as a solver result.
	pub fn snapshot(&self, files: Files) -> Arc<dyn SolverResult> {
		let snapshot = self.store.create(Arc::new(files));
		WorkerRef::new(Arc::new(snapshot), self.id.clone()).into_result()
	}
}

impl Worker for LocalWorker {
	fn id(&self) -> String {
		self.id.clone()
	}

	fn platforms(&self) -> Vec<Platform> {
		self.platforms.clone()
	}

	fn resolve_op(
		&self,
		vertex: &OpVertex,
		_bridge: Arc<dyn FrontendBridge>,
	) -> BuildResult<Arc<dyn Op>> {
		let op: LocalOp = serde_json::from_value(vertex.op.clone()).map_err(|e| {
			BuildError::InvalidDefinition(format!("{}: unsupported op: {}", vertex.name, e))
		})?;
		op.check_inputs(vertex.inputs.len())
			.map_err(|e| BuildError::InvalidDefinition(format!("{}: {}", vertex.name, e)))?;

		Ok(Arc::new(LocalOpExec {
			op,
			worker_id: self.id.clone(),
			store: self.store.clone(),
		}))
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

struct LocalOpExec {
	op: LocalOp,
	worker_id: String,
	store: Arc<SnapshotStore>,
}

#[async_trait]
impl Op for LocalOpExec {
	async fn exec(
		&self,
		_ctx: &Context,
		inputs: Vec<Arc<dyn SolverResult>>,
	) -> BuildResult<Arc<dyn SolverResult>> {
		let mut trees = Vec::with_capacity(inputs.len());
		for input in &inputs {
			let worker_ref = as_worker_ref(input.as_ref())?;
			trees.push(LocalSnapshot::files_of(worker_ref.immutable_ref.as_ref())?);
		}

		let files: Files = match &self.op {
			LocalOp::Source { files } => files
				.iter()
				.map(|(path, content)| (path.clone(), content.clone().into_bytes()))
				.collect(),
			LocalOp::Merge => {
				let mut merged = Files::new();
				for tree in trees {
					merged.extend(tree.iter().map(|(k, v)| (k.clone(), v.clone())));
				}
				merged
			}
			LocalOp::Write { path, content } => {
				let mut files = trees[0].clone();
				files.insert(path.clone(), content.clone().into_bytes());
				files
			}
			LocalOp::Fail { message } => return Err(BuildError::Worker(message.clone())),
		};

		let snapshot = self.store.create(Arc::new(files));
		Ok(WorkerRef::new(Arc::new(snapshot), self.worker_id.clone()).into_result())
	}
}
