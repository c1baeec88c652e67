//! Status relay from a live job to a caller's channel.

use solver_types::{BuildError, Context, SolveStatus};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::CoreError;
use crate::solver::Solver;

impl Solver {
	/// Streams the progress of job `id` into `tx` until the job is
	/// discarded, `tx`'s receiver is dropped, or `ctx` is cancelled. Updates
	/// recorded before the call are replayed first.
	///
	/// A job that is not live yet is waited for up to the configured status
	/// grace period.
	pub async fn status(
		&self,
		ctx: &Context,
		id: &str,
		tx: mpsc::Sender<SolveStatus>,
	) -> Result<(), CoreError> {
		let grace = self.status_grace();
		let job = if grace.is_zero() {
			self.jobs().get(id)
		} else {
			self.jobs().wait_for(id, grace).await
		}
		.map_err(|_| CoreError::JobNotFound(id.to_string()))?;

		debug!("Relaying status for job {}", id);
		job.status(ctx, tx).await.map_err(|e| match e {
			BuildError::Cancelled => CoreError::Cancelled,
			other => CoreError::Job(other.to_string()),
		})
	}
}
