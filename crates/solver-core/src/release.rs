//! Background release of solve results.
//!
//! A solve hands the references it no longer needs to the pool and returns
//! without waiting. A fixed set of tasks share one bounded queue and release
//! each batch in order. Failures are logged and counted; nobody is waiting
//! to hear about them.

use solver_types::{CachedResult, Context};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ReleaseBatch = Vec<CachedResult>;

/// Aggregate release counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseStats {
	pub scheduled: u64,
	pub released: u64,
	pub failed: u64,
}

#[derive(Default)]
struct Counters {
	scheduled: AtomicU64,
	released: AtomicU64,
	failed: AtomicU64,
	pending: AtomicUsize,
	idle: Notify,
}

impl Counters {
	async fn release_batch(&self, batch: ReleaseBatch) {
		let ctx = Context::background();
		for result in batch {
			match result.release(&ctx).await {
				Ok(()) => {
					self.released.fetch_add(1, Ordering::SeqCst);
				}
				Err(e) => {
					self.failed.fetch_add(1, Ordering::SeqCst);
					warn!("Failed to release {}: {}", result.id(), e);
				}
			}
		}
		if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
			self.idle.notify_waiters();
		}
	}
}

pub struct ReleasePool {
	sender: StdMutex<Option<mpsc::Sender<ReleaseBatch>>>,
	workers: Mutex<Vec<JoinHandle<()>>>,
	counters: Arc<Counters>,
}

impl ReleasePool {
	/// Starts `workers` release tasks on the current Tokio runtime.
	pub fn new(workers: usize, queue_size: usize) -> Self {
		let (sender, receiver) = mpsc::channel::<ReleaseBatch>(queue_size.max(1));
		let receiver = Arc::new(Mutex::new(receiver));
		let counters = Arc::new(Counters::default());

		let handles = (0..workers.max(1))
			.map(|worker| {
				let receiver = receiver.clone();
				let counters = counters.clone();
				tokio::spawn(async move {
					loop {
						let batch = receiver.lock().await.recv().await;
						match batch {
							Some(batch) => counters.release_batch(batch).await,
							None => break,
						}
					}
					debug!("Release worker {} stopped", worker);
				})
			})
			.collect();

		Self {
			sender: StdMutex::new(Some(sender)),
			workers: Mutex::new(handles),
			counters,
		}
	}

	/// Queues `batch` for release in order. Never waits: when the queue is
	/// full or the pool is shut down the batch gets a task of its own.
	pub fn schedule(&self, batch: Vec<CachedResult>) {
		if batch.is_empty() {
			return;
		}
		self.counters
			.scheduled
			.fetch_add(batch.len() as u64, Ordering::SeqCst);
		self.counters.pending.fetch_add(1, Ordering::SeqCst);

		let sender = self
			.sender
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.clone();
		let overflow = match sender {
			Some(sender) => match sender.try_send(batch) {
				Ok(()) => return,
				Err(TrySendError::Full(batch)) | Err(TrySendError::Closed(batch)) => batch,
			},
			None => batch,
		};

		debug!("Release queue unavailable; releasing {} refs on a new task", overflow.len());
		let counters = self.counters.clone();
		tokio::spawn(async move { counters.release_batch(overflow).await });
	}

	pub fn stats(&self) -> ReleaseStats {
		ReleaseStats {
			scheduled: self.counters.scheduled.load(Ordering::SeqCst),
			released: self.counters.released.load(Ordering::SeqCst),
			failed: self.counters.failed.load(Ordering::SeqCst),
		}
	}

	/// Waits until every scheduled batch has been processed.
	pub async fn wait_idle(&self) {
		loop {
			let idle = self.counters.idle.notified();
			tokio::pin!(idle);
			idle.as_mut().enable();
			if self.counters.pending.load(Ordering::SeqCst) == 0 {
				return;
			}
			idle.await;
		}
	}

	/// Stops accepting batches and waits for the queue to drain.
	pub async fn shutdown(&self) {
		self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
		let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
		for handle in handles {
			if let Err(e) = handle.await {
				warn!("Release worker ended abnormally: {}", e);
			}
		}
		let stats = self.stats();
		info!(
			"Release pool stopped: {} released, {} failed",
			stats.released, stats.failed
		);
	}
}
