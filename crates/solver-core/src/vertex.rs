//! Synthetic progress vertices for the orchestrator's own phases.
//!
//! Export and cache import/export are not graph operations, but clients
//! still expect to see them in the progress stream. Each phase gets a
//! vertex with a fresh identity that is started before the phase body runs
//! and completed, with the error if any, once it returns.

use chrono::Utc;
use solver_types::{
	new_id, Context, Digest, ProgressPayload, ProgressStatus, Vertex, VERTEX_METADATA_KEY,
};
use std::fmt::Display;
use std::future::Future;
use tracing::debug;

pub use solver_types::{notify_completed, notify_started};

use crate::utils::truncate_digest;

/// Runs `f` inside a new vertex named `name`. Progress written through the
/// context handed to `f` is attributed to that vertex. The result of `f` is
/// returned unchanged.
pub async fn run_in_vertex_context<F, Fut, T, E>(ctx: &Context, name: &str, f: F) -> Result<T, E>
where
	F: FnOnce(Context) -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: Display,
{
	let digest = Digest::from_bytes(new_id());
	let ctx = ctx
		.clone()
		.with_metadata(VERTEX_METADATA_KEY, digest.to_string());
	let mut vertex = Vertex::new(digest, name);

	notify_started(&ctx, &mut vertex, false);
	let result = f(ctx.clone()).await;
	let error = result.as_ref().err().map(|e| e.to_string());
	notify_completed(&ctx, &mut vertex, error.as_deref(), false);

	debug!(
		"Vertex {} ({}) completed{}",
		name,
		truncate_digest(vertex.digest.as_str()),
		if error.is_some() { " with error" } else { "" }
	);
	result
}

/// An open status marker; see [`one_off_progress`].
#[must_use]
pub struct OneOffProgress {
	ctx: Context,
	id: String,
	status: ProgressStatus,
}

/// Opens a status marker `id` under the current vertex.
pub fn one_off_progress(ctx: &Context, id: &str) -> OneOffProgress {
	let status = ProgressStatus {
		action: Some(id.to_string()),
		started: Some(Utc::now()),
		..Default::default()
	};
	ctx.write_progress(id, ProgressPayload::Status(status.clone()));
	OneOffProgress {
		ctx: ctx.clone(),
		id: id.to_string(),
		status,
	}
}

impl OneOffProgress {
	/// Closes the marker, recording the error if `result` is one, and hands
	/// `result` back.
	pub fn done<T, E: Display>(mut self, result: Result<T, E>) -> Result<T, E> {
		self.status.completed = Some(Utc::now());
		if let Err(e) = &result {
			self.status.error = Some(e.to_string());
		}
		self.ctx
			.write_progress(self.id, ProgressPayload::Status(self.status));
		result
	}
}
