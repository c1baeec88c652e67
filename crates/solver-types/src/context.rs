//! Request-scoped context passed through every solver call.
//!
//! A [`Context`] carries the caller's session id, a cancellation token, the
//! progress sink that writes should go to, and metadata attached to every
//! progress write made through it. Deriving a context never mutates the
//! parent.

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{BuildError, BuildResult, ProgressEvent, ProgressPayload, ProgressSink};

#[derive(Clone, Default)]
pub struct Context {
	session_id: Option<String>,
	cancellation: CancellationToken,
	progress: Option<Arc<dyn ProgressSink>>,
	metadata: HashMap<String, String>,
}

impl Context {
	/// A fresh context with no session, no progress sink, and a token that
	/// nothing else holds, so it is never cancelled.
	pub fn background() -> Self {
		Self::default()
	}

	pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
		self.session_id = Some(session_id.into());
		self
	}

	pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
		self.cancellation = token;
		self
	}

	pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
		self.progress = Some(sink);
		self
	}

	pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.metadata.insert(key.into(), value.into());
		self
	}

	pub fn session_id(&self) -> Option<&str> {
		self.session_id.as_deref()
	}

	pub fn metadata(&self, key: &str) -> Option<&str> {
		self.metadata.get(key).map(String::as_str)
	}

	pub fn has_progress(&self) -> bool {
		self.progress.is_some()
	}

	pub fn cancellation_token(&self) -> &CancellationToken {
		&self.cancellation
	}

	/// Derives a context whose token is cancelled with this one but can
	/// also be cancelled on its own.
	pub fn child(&self) -> Self {
		let mut ctx = self.clone();
		ctx.cancellation = self.cancellation.child_token();
		ctx
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancellation.is_cancelled()
	}

	pub async fn cancelled(&self) {
		self.cancellation.cancelled().await
	}

	/// Writes a progress record tagged with this context's metadata.
	/// Without a sink the write is dropped.
	pub fn write_progress(&self, id: impl Into<String>, payload: ProgressPayload) {
		if let Some(sink) = &self.progress {
			sink.write(ProgressEvent {
				id: id.into(),
				timestamp: Utc::now(),
				metadata: self.metadata.clone(),
				payload,
			});
		}
	}

	/// Drives `fut` to completion unless this context is cancelled first.
	pub async fn run<F, T>(&self, fut: F) -> BuildResult<T>
	where
		F: Future<Output = BuildResult<T>>,
	{
		if self.is_cancelled() {
			return Err(BuildError::Cancelled);
		}
		tokio::select! {
			biased;
			_ = self.cancellation.cancelled() => Err(BuildError::Cancelled),
			res = fut => res,
		}
	}
}

impl std::fmt::Debug for Context {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Context")
			.field("session_id", &self.session_id)
			.field("cancelled", &self.cancellation.is_cancelled())
			.field("metadata", &self.metadata)
			.finish_non_exhaustive()
	}
}
