//! Job registry and the depth-first graph builder.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{try_join_all, BoxFuture};
use solver_types::{
	notify_completed, notify_started, BuildError, BuildResult, CacheManager, CacheRecord,
	CachedResult, Context, Digest, ExportableCacheKey, Op, OpVertex, SolveStatus, SolverResult,
	Vertex, VERTEX_METADATA_KEY,
};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, mpsc, Notify, OnceCell};
use tracing::{debug, instrument, warn};

use crate::cache::ChainExporter;
use crate::progress::ProgressLog;

/// Resolves a vertex into an executable op. The builder is the job the
/// vertex is being built for.
pub type ResolveOpFn =
	Arc<dyn Fn(&OpVertex, Arc<dyn Builder>) -> BuildResult<Arc<dyn Op>> + Send + Sync>;

const DEFAULT_PROGRESS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct SolverOpt {
	pub resolve_op: ResolveOpFn,
	/// Cache every job reads from first and saves new results into.
	pub default_cache: Arc<dyn CacheManager>,
	pub progress_capacity: usize,
}

impl SolverOpt {
	pub fn new(resolve_op: ResolveOpFn, default_cache: Arc<dyn CacheManager>) -> Self {
		Self {
			resolve_op,
			default_cache,
			progress_capacity: DEFAULT_PROGRESS_CAPACITY,
		}
	}
}

/// Builds loaded graphs within one job.
#[async_trait]
pub trait Builder: Send + Sync {
	/// Builds `vertex` and everything it depends on. `cache_sources` are
	/// consulted after the default cache. The returned result is a new
	/// handle the caller must release.
	async fn build(
		&self,
		ctx: &Context,
		vertex: Arc<OpVertex>,
		cache_sources: Vec<Arc<dyn CacheManager>>,
	) -> BuildResult<CachedResult>;

	/// Derives a context whose progress writes land in this job.
	fn context(&self, ctx: &Context) -> Context;
}

type JobMap = DashMap<String, Arc<Job>>;

/// Registry of live jobs.
pub struct JobSolver {
	jobs: Arc<JobMap>,
	added: Arc<Notify>,
	opt: SolverOpt,
}

impl JobSolver {
	pub fn new(opt: SolverOpt) -> Self {
		Self {
			jobs: Arc::new(DashMap::new()),
			added: Arc::new(Notify::new()),
			opt,
		}
	}

	/// Registers a job under `id`. Fails while another job with the same id
	/// is live.
	pub fn new_job(&self, id: &str) -> BuildResult<Arc<Job>> {
		let job = match self.jobs.entry(id.to_string()) {
			Entry::Occupied(_) => {
				return Err(BuildError::Conflict(format!("job ID {} exists", id)));
			}
			Entry::Vacant(slot) => {
				let job = Job::new(id.to_string(), &self.opt, Arc::downgrade(&self.jobs));
				slot.insert(job.clone());
				job
			}
		};
		self.added.notify_waiters();
		debug!("Created job {}", id);
		Ok(job)
	}

	pub fn get(&self, id: &str) -> BuildResult<Arc<Job>> {
		self.jobs
			.get(id)
			.map(|job| job.value().clone())
			.ok_or_else(|| BuildError::NotFound(format!("no such job {}", id)))
	}

	/// Like [`JobSolver::get`], but waits up to `timeout` for the job to be
	/// registered.
	pub async fn wait_for(&self, id: &str, timeout: Duration) -> BuildResult<Arc<Job>> {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let added = self.added.notified();
			tokio::pin!(added);
			added.as_mut().enable();

			if let Ok(job) = self.get(id) {
				return Ok(job);
			}
			if tokio::time::timeout_at(deadline, added).await.is_err() {
				return self.get(id);
			}
		}
	}

	pub fn active_jobs(&self) -> Vec<String> {
		self.jobs.iter().map(|job| job.key().clone()).collect()
	}
}

struct Built {
	result: CachedResult,
	chain: Arc<ChainExporter>,
}

/// One solve's worth of state: its progress log and the results built for
/// it so far. Results are memoized by vertex digest and owned by the job
/// until it is discarded.
pub struct Job {
	id: String,
	session_id: RwLock<Option<String>>,
	progress: Arc<ProgressLog>,
	built: DashMap<Digest, Arc<OnceCell<Built>>>,
	resolve_op: ResolveOpFn,
	default_cache: Arc<dyn CacheManager>,
	registry: Weak<JobMap>,
	this: Weak<Job>,
}

impl Job {
	fn new(id: String, opt: &SolverOpt, registry: Weak<JobMap>) -> Arc<Self> {
		Arc::new_cyclic(|this| Job {
			id,
			session_id: RwLock::new(None),
			progress: Arc::new(ProgressLog::new(opt.progress_capacity)),
			built: DashMap::new(),
			resolve_op: opt.resolve_op.clone(),
			default_cache: opt.default_cache.clone(),
			registry,
			this: this.clone(),
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn set_session_id(&self, session_id: Option<String>) {
		*self.session_id.write().unwrap_or_else(|e| e.into_inner()) = session_id;
	}

	pub fn session_id(&self) -> Option<String> {
		self.session_id
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.clone()
	}

	pub fn progress(&self) -> &Arc<ProgressLog> {
		&self.progress
	}

	/// Latest state of every vertex reported for this job.
	pub fn vertexes(&self) -> Vec<Vertex> {
		self.progress.vertexes()
	}

	pub fn is_discarded(&self) -> bool {
		self.progress.is_closed()
	}

	/// Streams this job's progress into `tx`: the history first, then live
	/// updates until the job is discarded or the receiver goes away. A
	/// reader that falls behind catches up from the history.
	pub async fn status(&self, ctx: &Context, tx: mpsc::Sender<SolveStatus>) -> BuildResult<()> {
		let mut seen = 0;
		loop {
			let (missed, live) = self.progress.subscribe_from(seen);
			for event in &missed {
				if tx.send(SolveStatus::from(event)).await.is_err() {
					return Ok(());
				}
			}
			seen += missed.len();

			let Some(mut live) = live else {
				return Ok(());
			};
			loop {
				tokio::select! {
					_ = ctx.cancelled() => return Err(BuildError::Cancelled),
					_ = tx.closed() => return Ok(()),
					event = live.recv() => match event {
						Ok(event) => {
							if tx.send(SolveStatus::from(&event)).await.is_err() {
								return Ok(());
							}
							seen += 1;
						}
						Err(RecvError::Lagged(skipped)) => {
							debug!("Status reader for job {} catching up {} updates", self.id, skipped);
							break;
						}
						Err(RecvError::Closed) => return Ok(()),
					},
				}
			}
		}
	}

	/// Removes the job from the registry, ends its progress stream and
	/// releases the results it built. Safe to call more than once.
	pub fn discard(&self) {
		if let Some(registry) = self.registry.upgrade() {
			registry.remove_if(&self.id, |_, job| std::ptr::eq(Arc::as_ptr(job), self));
		}
		self.progress.close();

		let results: Vec<CachedResult> = self
			.built
			.iter()
			.filter_map(|entry| entry.value().get().map(|b| b.result.clone()))
			.collect();
		self.built.clear();
		if results.is_empty() {
			return;
		}

		let id = self.id.clone();
		match tokio::runtime::Handle::try_current() {
			Ok(handle) => {
				handle.spawn(async move {
					let ctx = Context::background();
					for result in results {
						if let Err(e) = result.release(&ctx).await {
							warn!("Job {} failed to release {}: {}", id, result.id(), e);
						}
					}
				});
			}
			Err(_) => warn!("Job {} discarded outside a runtime; results not released", id),
		}
		debug!("Discarded job {}", self.id);
	}

	fn builder(&self) -> BuildResult<Arc<dyn Builder>> {
		self.this
			.upgrade()
			.map(|job| job as Arc<dyn Builder>)
			.ok_or_else(|| BuildError::NotFound(format!("job {} is gone", self.id)))
	}

	fn build_vertex<'a>(
		&'a self,
		ctx: &'a Context,
		vertex: Arc<OpVertex>,
		sources: &'a [Arc<dyn CacheManager>],
	) -> BoxFuture<'a, BuildResult<(CachedResult, Arc<ChainExporter>)>> {
		Box::pin(async move {
			let cell = self
				.built
				.entry(vertex.digest.clone())
				.or_default()
				.value()
				.clone();
			let built = cell
				.get_or_try_init(|| self.solve_vertex(ctx, vertex, sources))
				.await?;
			Ok((built.result.clone(), built.chain.clone()))
		})
	}

	async fn solve_vertex(
		&self,
		ctx: &Context,
		vertex: Arc<OpVertex>,
		sources: &[Arc<dyn CacheManager>],
	) -> BuildResult<Built> {
		let inputs = try_join_all(
			vertex
				.inputs
				.iter()
				.map(|input| self.build_vertex(ctx, input.clone(), sources)),
		)
		.await?;

		let ctx = ctx
			.clone()
			.with_metadata(VERTEX_METADATA_KEY, vertex.digest.to_string());
		let mut progress = Vertex::new(vertex.digest.clone(), vertex.name.clone());
		progress.inputs = vertex.input_digests();
		let record = CacheRecord::new(vertex.digest.clone(), vertex.input_digests());
		let deps: Vec<Arc<ChainExporter>> = inputs.iter().map(|(_, chain)| chain.clone()).collect();

		let managers = std::iter::once(&self.default_cache).chain(sources.iter());
		for manager in managers {
			let Some(hit) = manager.query(&ctx, &vertex.digest).await? else {
				continue;
			};
			notify_started(&ctx, &mut progress, true);
			let result = match manager.load(&ctx, &hit).await {
				Ok(result) => result,
				Err(e) => {
					notify_completed(&ctx, &mut progress, Some(&e.to_string()), true);
					return Err(e);
				}
			};
			if !Arc::ptr_eq(manager, &self.default_cache) {
				self.default_cache
					.save(&ctx, record.clone(), result.clone_ref())
					.await?;
			}
			notify_completed(&ctx, &mut progress, None, true);
			debug!("Vertex {} loaded from cache {}", vertex.name, manager.id());
			return Ok(self.finish(&vertex, record, result, deps));
		}

		notify_started(&ctx, &mut progress, false);
		let executed = async {
			let op = (self.resolve_op)(&vertex, self.builder()?)?;
			let inputs = inputs
				.iter()
				.map(|(input, _)| input.result().clone())
				.collect();
			let result = ctx.run(op.exec(&ctx, inputs)).await?;
			if let Err(e) = self
				.default_cache
				.save(&ctx, record.clone(), result.clone_ref())
				.await
			{
				result.release(&ctx).await.ok();
				return Err(e);
			}
			Ok(result)
		}
		.await;

		match executed {
			Ok(result) => {
				notify_completed(&ctx, &mut progress, None, false);
				Ok(self.finish(&vertex, record, result, deps))
			}
			Err(e) => {
				notify_completed(&ctx, &mut progress, Some(&e.to_string()), false);
				Err(e)
			}
		}
	}

	fn finish(
		&self,
		vertex: &OpVertex,
		record: CacheRecord,
		result: Arc<dyn SolverResult>,
		deps: Vec<Arc<ChainExporter>>,
	) -> Built {
		let chain = Arc::new(ChainExporter::new(record, result.clone(), deps));
		let key = ExportableCacheKey {
			digest: vertex.digest.clone(),
			exporter: chain.clone(),
		};
		Built {
			result: CachedResult::new(result, vec![key]),
			chain,
		}
	}
}

#[async_trait]
impl Builder for Job {
	#[instrument(skip_all, fields(job = %self.id, vertex = %vertex.name))]
	async fn build(
		&self,
		ctx: &Context,
		vertex: Arc<OpVertex>,
		cache_sources: Vec<Arc<dyn CacheManager>>,
	) -> BuildResult<CachedResult> {
		let ctx = self.context(ctx);
		let (result, _) = self.build_vertex(&ctx, vertex, &cache_sources).await?;
		Ok(result.clone_ref())
	}

	fn context(&self, ctx: &Context) -> Context {
		let ctx = ctx.child().with_progress(self.progress.clone());
		match self.session_id() {
			Some(session) if ctx.session_id().is_none() => ctx.with_session_id(session),
			_ => ctx,
		}
	}
}

impl std::fmt::Debug for Job {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Job")
			.field("id", &self.id)
			.field("built", &self.built.len())
			.field("discarded", &self.is_discarded())
			.finish()
	}
}
