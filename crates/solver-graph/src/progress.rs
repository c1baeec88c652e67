//! Per-job progress log.
//!
//! Every write is appended to the job's history and broadcast to live
//! subscribers. A subscriber first receives the history recorded before it
//! attached, then follows new writes until the log is closed. A subscriber
//! that falls behind the broadcast buffer resubscribes from its position in
//! the history, so nothing written is lost to it.

use solver_types::{ProgressEvent, ProgressPayload, ProgressSink, Vertex};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

struct LogState {
	history: Vec<ProgressEvent>,
	/// `None` once the log is closed.
	sender: Option<broadcast::Sender<ProgressEvent>>,
}

pub struct ProgressLog {
	state: Mutex<LogState>,
}

impl ProgressLog {
	/// Creates a log whose live subscribers can fall `capacity` events
	/// behind before they have to catch up from the history.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self {
			state: Mutex::new(LogState {
				history: Vec::new(),
				sender: Some(sender),
			}),
		}
	}

	fn lock(&self) -> MutexGuard<'_, LogState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Returns the history so far and, unless the log is closed, a receiver
	/// for everything written after it. Both are taken under one lock so no
	/// write falls between them.
	pub fn subscribe(&self) -> (Vec<ProgressEvent>, Option<broadcast::Receiver<ProgressEvent>>) {
		self.subscribe_from(0)
	}

	/// Like [`ProgressLog::subscribe`], but skips the first `offset` events
	/// of the history.
	pub fn subscribe_from(
		&self,
		offset: usize,
	) -> (Vec<ProgressEvent>, Option<broadcast::Receiver<ProgressEvent>>) {
		let state = self.lock();
		let receiver = state.sender.as_ref().map(|s| s.subscribe());
		let missed = state.history.get(offset..).unwrap_or_default().to_vec();
		(missed, receiver)
	}

	/// Stops accepting writes and ends every live subscription once it has
	/// drained.
	pub fn close(&self) {
		self.lock().sender.take();
	}

	pub fn is_closed(&self) -> bool {
		self.lock().sender.is_none()
	}

	pub fn history(&self) -> Vec<ProgressEvent> {
		self.lock().history.clone()
	}

	/// Latest state of every vertex, in order of first appearance.
	pub fn vertexes(&self) -> Vec<Vertex> {
		let state = self.lock();
		let mut order = Vec::new();
		let mut latest: HashMap<String, Vertex> = HashMap::new();
		for event in &state.history {
			if let ProgressPayload::Vertex(vertex) = &event.payload {
				let key = vertex.digest.to_string();
				if !latest.contains_key(&key) {
					order.push(key.clone());
				}
				latest.insert(key, vertex.clone());
			}
		}
		order.into_iter().filter_map(|k| latest.remove(&k)).collect()
	}
}

impl ProgressSink for ProgressLog {
	fn write(&self, event: ProgressEvent) {
		let mut state = self.lock();
		let Some(sender) = state.sender.clone() else {
			return;
		};
		state.history.push(event.clone());
		// No subscribers is fine; the history still has the event.
		let _ = sender.send(event);
	}
}
