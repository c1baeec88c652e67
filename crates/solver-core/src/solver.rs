//! The solve orchestrator.

use solver_graph::{Builder, InMemoryCacheManager, Job, JobSolver, ResolveOpFn, SolverOpt};
use solver_types::{
	CacheExportMode, CacheExportOpt, CacheExporter, CacheManager, CachedResult, Context,
	ExportSource, ExporterInstance, Frontend, FrontendBridge, FrontendResult, ImmutableRef,
	ResolveCacheImporterFn, SolveRequest, SolveResponse, SolveStatus,
};
use solver_worker::{as_worker_ref, worker_ref_converter, WorkerController};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::bridge::{BridgeOpt, LlbBridge, ResolveWorkerFn};
use crate::error::CoreError;
use crate::release::{ReleasePool, ReleaseStats};
use crate::vertex::{one_off_progress, run_in_vertex_context};

const DEFAULT_RELEASE_WORKERS: usize = 4;
const DEFAULT_RELEASE_QUEUE_SIZE: usize = 256;

/// Where a solve's output goes once it is built.
#[derive(Clone, Default)]
pub struct ExporterRequest {
	pub exporter: Option<Arc<dyn ExporterInstance>>,
	pub cache_exporter: Option<Arc<dyn CacheExporter>>,
	pub cache_export_mode: CacheExportMode,
}

pub struct Solver {
	jobs: Arc<JobSolver>,
	bridge_opt: BridgeOpt,
	release: ReleasePool,
	status_grace: Duration,
}

/// Discards the job when the solve returns, on every path.
struct DiscardGuard(Arc<Job>);

impl Drop for DiscardGuard {
	fn drop(&mut self) {
		self.0.discard();
	}
}

/// Hands the result's references to the release pool when the solve
/// returns, whether or not exporting succeeded.
struct ReleaseGuard<'a> {
	pool: &'a ReleasePool,
	refs: Vec<CachedResult>,
}

impl Drop for ReleaseGuard<'_> {
	fn drop(&mut self) {
		self.pool.schedule(std::mem::take(&mut self.refs));
	}
}

impl Solver {
	/// Solves `req` as job `id` and exports the result as `exp` asks.
	pub async fn solve(
		&self,
		ctx: &Context,
		id: &str,
		req: SolveRequest,
		exp: ExporterRequest,
	) -> Result<SolveResponse, CoreError> {
		self.run_job(ctx, id, req, exp, None).await
	}

	/// Like [`Solver::solve`], but relays the job's progress into `status`
	/// from the moment the job is registered. Every update is delivered,
	/// however quickly the solve finishes.
	pub async fn solve_with_status(
		&self,
		ctx: &Context,
		id: &str,
		req: SolveRequest,
		exp: ExporterRequest,
		status: mpsc::Sender<SolveStatus>,
	) -> Result<SolveResponse, CoreError> {
		self.run_job(ctx, id, req, exp, Some(status)).await
	}

	#[instrument(skip_all, fields(job = %id))]
	async fn run_job(
		&self,
		ctx: &Context,
		id: &str,
		req: SolveRequest,
		exp: ExporterRequest,
		status: Option<mpsc::Sender<SolveStatus>>,
	) -> Result<SolveResponse, CoreError> {
		let job = self
			.jobs
			.new_job(id)
			.map_err(|e| CoreError::Job(e.to_string()))?;
		if let Some(tx) = status {
			let relay = job.clone();
			let relay_ctx = ctx.clone();
			tokio::spawn(async move {
				if let Err(e) = relay.status(&relay_ctx, tx).await {
					debug!("Status relay for job {} ended: {}", relay.id(), e);
				}
			});
		}
		let _discard = DiscardGuard(job.clone());
		job.set_session_id(ctx.session_id().map(str::to_string));

		let ctx = job.context(ctx);
		let bridge = LlbBridge::new(job.clone(), self.bridge_opt.clone());
		let res = ctx
			.run(bridge.solve(&ctx, req))
			.await
			.map_err(|e| CoreError::phase(e, CoreError::Solve))?;

		let _release = ReleaseGuard {
			pool: &self.release,
			refs: res.all_refs().into_iter().cloned().collect(),
		};

		let mut response = SolveResponse::default();

		if let Some(exporter) = &exp.exporter {
			let source = export_source(&res)?;
			let name = exporter.name();
			response.exporter_response = run_in_vertex_context(&ctx, &name, |ctx| async move {
				ctx.run(exporter.export(&ctx, source)).await
			})
			.await
			.map_err(|e| match e {
				solver_types::BuildError::Cancelled => CoreError::Cancelled,
				source => CoreError::Export {
					exporter: name.clone(),
					source,
				},
			})?;
		}

		if let Some(cache_exporter) = &exp.cache_exporter {
			let opt = CacheExportOpt {
				convert: worker_ref_converter(),
				mode: exp.cache_export_mode,
			};
			run_in_vertex_context(&ctx, "exporting cache", |ctx| {
				let res = &res;
				let opt = &opt;
				async move {
					let prepare = one_off_progress(&ctx, "preparing build cache for export");
					prepare.done(export_cache_keys(&ctx, res, cache_exporter.as_ref(), opt).await)?;
					ctx.run(cache_exporter.finalize(&ctx)).await
				}
			})
			.await
			.map_err(|e| CoreError::phase(e, CoreError::CacheExport))?;
		}

		info!(
			"Solved job {} ({} refs, {} exporter keys)",
			id,
			res.all_refs().len(),
			response.exporter_response.len()
		);
		Ok(response)
	}

	pub fn active_jobs(&self) -> Vec<String> {
		self.jobs.active_jobs()
	}

	pub fn release_stats(&self) -> ReleaseStats {
		self.release.stats()
	}

	/// Waits for every release scheduled so far to finish.
	pub async fn wait_released(&self) {
		self.release.wait_idle().await
	}

	pub async fn shutdown(&self) {
		self.release.shutdown().await
	}

	pub(crate) fn jobs(&self) -> &JobSolver {
		&self.jobs
	}

	pub(crate) fn status_grace(&self) -> Duration {
		self.status_grace
	}
}

/// Unwraps every reference of `res` into the worker snapshot behind it.
fn export_source(res: &FrontendResult) -> Result<ExportSource, CoreError> {
	let to_snapshot = |r: &CachedResult| -> Result<Arc<dyn ImmutableRef>, CoreError> {
		as_worker_ref(r.result().as_ref())
			.map(|worker_ref| worker_ref.immutable_ref.clone())
			.map_err(|_| CoreError::InvalidReference(r.id()))
	};

	let reference = res.reference.as_ref().map(to_snapshot).transpose()?;
	let refs = match &res.refs {
		Some(named) => {
			let mut out = HashMap::with_capacity(named.len());
			for (name, r) in named {
				out.insert(name.clone(), r.as_ref().map(to_snapshot).transpose()?);
			}
			Some(out)
		}
		None => None,
	};

	Ok(ExportSource {
		reference,
		refs,
		metadata: res.metadata.clone(),
	})
}

/// Exports the first cache key of every reference. A reference without
/// keys has nothing to export.
async fn export_cache_keys(
	ctx: &Context,
	res: &FrontendResult,
	target: &dyn CacheExporter,
	opt: &CacheExportOpt,
) -> solver_types::BuildResult<()> {
	for r in res.all_refs() {
		let Some(key) = r.cache_keys().first() else {
			debug!("Result {} has no cache keys; skipping export", r.id());
			continue;
		};
		ctx.run(key.exporter.export_to(ctx, target, opt)).await?;
	}
	Ok(())
}

/// Factory for [`Solver`].
pub struct SolverBuilder {
	worker_controller: Arc<WorkerController>,
	default_cache: Arc<dyn CacheManager>,
	frontends: HashMap<String, Arc<dyn Frontend>>,
	resolve_cache_importer: Option<ResolveCacheImporterFn>,
	release_workers: usize,
	release_queue_size: usize,
	status_grace: Duration,
}

impl SolverBuilder {
	pub fn new(worker_controller: Arc<WorkerController>, default_cache: Arc<dyn CacheManager>) -> Self {
		Self {
			worker_controller,
			default_cache,
			frontends: HashMap::new(),
			resolve_cache_importer: None,
			release_workers: DEFAULT_RELEASE_WORKERS,
			release_queue_size: DEFAULT_RELEASE_QUEUE_SIZE,
			status_grace: Duration::ZERO,
		}
	}

	/// A builder backed by an in-memory default cache.
	pub fn with_memory_cache(worker_controller: Arc<WorkerController>) -> Self {
		Self::new(
			worker_controller,
			Arc::new(InMemoryCacheManager::new("default")),
		)
	}

	pub fn with_frontend(mut self, name: &str, frontend: Arc<dyn Frontend>) -> Self {
		self.frontends.insert(name.to_string(), frontend);
		self
	}

	pub fn with_cache_importer(mut self, resolver: ResolveCacheImporterFn) -> Self {
		self.resolve_cache_importer = Some(resolver);
		self
	}

	pub fn with_release_workers(mut self, workers: usize) -> Self {
		self.release_workers = workers;
		self
	}

	pub fn with_release_queue_size(mut self, size: usize) -> Self {
		self.release_queue_size = size;
		self
	}

	/// How long `status` waits for a job id that is not registered yet.
	pub fn with_status_grace(mut self, grace: Duration) -> Self {
		self.status_grace = grace;
		self
	}

	/// Builds the solver. Must run inside a Tokio runtime, which hosts the
	/// release pool.
	pub fn build(self) -> Result<Solver, CoreError> {
		let default_worker = self
			.worker_controller
			.get_default()
			.map_err(|e| CoreError::Configuration(e.to_string()))?;
		if tokio::runtime::Handle::try_current().is_err() {
			return Err(CoreError::Configuration(
				"solver must be built inside a Tokio runtime".to_string(),
			));
		}

		let controller = self.worker_controller.clone();
		let resolve_worker: ResolveWorkerFn = Arc::new(move || controller.get_default());
		let bridge_opt = BridgeOpt {
			frontends: Arc::new(self.frontends),
			resolve_worker,
			resolve_cache_importer: self.resolve_cache_importer,
			platforms: default_worker.platforms(),
		};

		let op_opt = bridge_opt.clone();
		let resolve_op: ResolveOpFn = Arc::new(move |vertex, builder| {
			let worker = (op_opt.resolve_worker)()?;
			let bridge: Arc<dyn FrontendBridge> = LlbBridge::new(builder, op_opt.clone());
			worker.resolve_op(vertex, bridge)
		});
		let jobs = JobSolver::new(SolverOpt::new(resolve_op, self.default_cache));

		info!(
			"Solver ready: default worker {}, {} frontends, {} release workers",
			default_worker.id(),
			bridge_opt.frontends.len(),
			self.release_workers
		);

		Ok(Solver {
			jobs: Arc::new(jobs),
			bridge_opt,
			release: ReleasePool::new(self.release_workers, self.release_queue_size),
			status_grace: self.status_grace,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use serde_json::json;
	use solver_types::{
		BuildError, BuildResult, CacheKeyExporter, CacheRecord, Definition, Digest,
		ExportableCacheKey, OpDef, Platform, SolverResult, Vertex, VertexStatus,
	};
	use solver_worker::implementations::local::{Files, LocalWorker};
	use std::any::Any;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Mutex;
	use tokio::sync::Notify;

	/// Returns fresh worker snapshots as a primary ref plus named refs, with
	/// an optional counting cache key on each.
	struct SnapshotFrontend {
		worker: Arc<LocalWorker>,
		named: usize,
		key: Option<Arc<CountingKey>>,
		gate: Option<Arc<Notify>>,
	}

	#[async_trait]
	impl Frontend for SnapshotFrontend {
		async fn solve(
			&self,
			_ctx: &Context,
			_bridge: Arc<dyn FrontendBridge>,
			_opts: &HashMap<String, String>,
		) -> BuildResult<FrontendResult> {
			if let Some(gate) = &self.gate {
				gate.notified().await;
			}
			let keys = || match &self.key {
				Some(key) => vec![ExportableCacheKey {
					digest: Digest::from_bytes(b"k"),
					exporter: key.clone(),
				}],
				None => vec![],
			};
			let mut res =
				FrontendResult::single(CachedResult::new(self.worker.snapshot(Files::new()), keys()));
			for i in 0..self.named {
				res.add_ref(
					format!("ref-{}", i),
					Some(CachedResult::new(self.worker.snapshot(Files::new()), keys())),
				);
			}
			res.add_ref("empty", None);
			res.add_meta("k", "v");
			Ok(res)
		}
	}

	#[derive(Default)]
	struct CountingKey {
		calls: AtomicUsize,
		/// Fails the export with this call number, counting from one.
		fail_on: Option<usize>,
	}

	#[async_trait]
	impl CacheKeyExporter for CountingKey {
		async fn export_to(
			&self,
			ctx: &Context,
			target: &dyn CacheExporter,
			_opt: &CacheExportOpt,
		) -> BuildResult<Vec<CacheRecord>> {
			let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
			if self.fail_on == Some(call) {
				return Err(BuildError::Cache("boom".to_string()));
			}
			let record = CacheRecord::new(Digest::from_bytes(b"k"), vec![]);
			target.add_record(ctx, record.clone(), None).await?;
			Ok(vec![record])
		}
	}

	struct StubExporter {
		name: &'static str,
		fail: bool,
		seen: Mutex<Option<(bool, usize)>>,
	}

	impl StubExporter {
		fn new(name: &'static str, fail: bool) -> Arc<Self> {
			Arc::new(Self {
				name,
				fail,
				seen: Mutex::new(None),
			})
		}
	}

	#[async_trait]
	impl ExporterInstance for StubExporter {
		fn name(&self) -> String {
			self.name.to_string()
		}

		async fn export(
			&self,
			_ctx: &Context,
			source: ExportSource,
		) -> BuildResult<HashMap<String, String>> {
			tokio::time::sleep(Duration::from_millis(2)).await;
			*self.seen.lock().unwrap() = Some((
				source.reference.is_some(),
				source.refs.as_ref().map(|r| r.len()).unwrap_or(0),
			));
			if self.fail {
				return Err(BuildError::Export("disk full".to_string()));
			}
			let mut out = HashMap::new();
			out.insert("containerimage.digest".to_string(), "sha256:abc".to_string());
			Ok(out)
		}
	}

	#[derive(Default)]
	struct StubCacheExporter {
		fail_finalize: bool,
		records: AtomicUsize,
	}

	#[async_trait]
	impl CacheExporter for StubCacheExporter {
		fn name(&self) -> String {
			"stub".to_string()
		}

		async fn add_record(
			&self,
			_ctx: &Context,
			_record: CacheRecord,
			_result: Option<Arc<dyn ImmutableRef>>,
		) -> BuildResult<()> {
			self.records.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		async fn finalize(&self, _ctx: &Context) -> BuildResult<()> {
			if self.fail_finalize {
				return Err(BuildError::Cache("remote unavailable".to_string()));
			}
			Ok(())
		}
	}

	/// Blocks in `finalize` until `release` is notified.
	#[derive(Default)]
	struct BlockingCacheExporter {
		entered: Notify,
		release: Notify,
	}

	#[async_trait]
	impl CacheExporter for BlockingCacheExporter {
		fn name(&self) -> String {
			"blocking".to_string()
		}

		async fn add_record(
			&self,
			_ctx: &Context,
			_record: CacheRecord,
			_result: Option<Arc<dyn ImmutableRef>>,
		) -> BuildResult<()> {
			Ok(())
		}

		async fn finalize(&self, _ctx: &Context) -> BuildResult<()> {
			self.entered.notify_one();
			self.release.notified().await;
			Ok(())
		}
	}

	/// Returns one ref carrying two cache keys.
	struct TwoKeyFrontend {
		worker: Arc<LocalWorker>,
		first: Arc<CountingKey>,
		second: Arc<CountingKey>,
	}

	#[async_trait]
	impl Frontend for TwoKeyFrontend {
		async fn solve(
			&self,
			_ctx: &Context,
			_bridge: Arc<dyn FrontendBridge>,
			_opts: &HashMap<String, String>,
		) -> BuildResult<FrontendResult> {
			let keys = vec![
				ExportableCacheKey {
					digest: Digest::from_bytes(b"first"),
					exporter: self.first.clone(),
				},
				ExportableCacheKey {
					digest: Digest::from_bytes(b"second"),
					exporter: self.second.clone(),
				},
			];
			Ok(FrontendResult::single(CachedResult::new(
				self.worker.snapshot(Files::new()),
				keys,
			)))
		}
	}

	fn controller(worker: &Arc<LocalWorker>) -> Arc<WorkerController> {
		Arc::new(
			WorkerController::new()
				.with_worker(worker.clone())
				.unwrap(),
		)
	}

	fn solver_with(frontend: SnapshotFrontend) -> Solver {
		SolverBuilder::with_memory_cache(controller(&frontend.worker))
			.with_frontend("snap", Arc::new(frontend))
			.with_status_grace(Duration::from_secs(5))
			.build()
			.unwrap()
	}

	fn snap_request() -> SolveRequest {
		SolveRequest::with_frontend("snap", HashMap::new())
	}

	/// Collects the final state of every vertex and status marker a job
	/// reports.
	async fn collect_progress(
		mut rx: mpsc::Receiver<SolveStatus>,
	) -> (Vec<Vertex>, Vec<VertexStatus>) {
		let mut vertices: Vec<Vertex> = Vec::new();
		let mut statuses: Vec<VertexStatus> = Vec::new();
		while let Some(status) = rx.recv().await {
			for v in status.vertexes {
				match vertices.iter_mut().find(|l| l.digest == v.digest) {
					Some(existing) => *existing = v,
					None => vertices.push(v),
				}
			}
			for s in status.statuses {
				match statuses.iter_mut().find(|l| l.id == s.id) {
					Some(existing) => *existing = s,
					None => statuses.push(s),
				}
			}
		}
		(vertices, statuses)
	}

	/// Runs a gated solve with a status reader attached before the frontend
	/// is let through, and returns the outcome with every reported vertex
	/// and status marker.
	async fn solve_observed(
		solver: Arc<Solver>,
		gate: Arc<Notify>,
		id: &str,
		exp: ExporterRequest,
	) -> (Result<SolveResponse, CoreError>, Vec<Vertex>, Vec<VertexStatus>) {
		let solving = {
			let solver = solver.clone();
			let id = id.to_string();
			tokio::spawn(async move {
				solver
					.solve(&Context::background(), &id, snap_request(), exp)
					.await
			})
		};
		while !solver.active_jobs().contains(&id.to_string()) {
			tokio::task::yield_now().await;
		}

		let (tx, rx) = mpsc::channel(64);
		let reader = solver.clone();
		let reader_id = id.to_string();
		let status =
			tokio::spawn(async move { reader.status(&Context::background(), &reader_id, tx).await });
		tokio::task::yield_now().await;
		gate.notify_one();

		let result = solving.await.unwrap();
		status.await.unwrap().unwrap();
		let (vertices, statuses) = collect_progress(rx).await;
		(result, vertices, statuses)
	}

	#[tokio::test]
	async fn test_build_requires_default_worker() {
		let res = SolverBuilder::with_memory_cache(Arc::new(WorkerController::new())).build();
		assert!(matches!(res, Err(CoreError::Configuration(_))));
	}

	#[tokio::test]
	async fn test_no_exporters_returns_empty_response() {
		let worker = Arc::new(LocalWorker::new("w", vec![Platform::host()]));
		let gate = Arc::new(Notify::new());
		let solver = Arc::new(solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 0,
			key: None,
			gate: Some(gate.clone()),
		}));

		let (resp, vertices, _) =
			solve_observed(solver.clone(), gate, "j", ExporterRequest::default()).await;
		assert!(resp.unwrap().exporter_response.is_empty());
		assert!(vertices.is_empty());

		solver.wait_released().await;
		assert_eq!(worker.store().active_handles(), 0);
	}

	#[tokio::test]
	async fn test_refs_released_once_when_export_fails() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let solver = solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 2,
			key: None,
			gate: None,
		});

		let exporter = StubExporter::new("local", true);
		let err = solver
			.solve(
				&Context::background(),
				"j",
				snap_request(),
				ExporterRequest {
					exporter: Some(exporter.clone()),
					..Default::default()
				},
			)
			.await
			.unwrap_err();
		match err {
			CoreError::Export { exporter, source } => {
				assert_eq!(exporter, "local");
				assert_eq!(source.to_string(), "Export error: disk full");
			}
			other => panic!("unexpected error {:?}", other),
		}
		// Primary, two named refs, and the empty slot passed through.
		assert_eq!(*exporter.seen.lock().unwrap(), Some((true, 3)));

		solver.wait_released().await;
		assert_eq!(worker.store().active_handles(), 0);
		assert_eq!(
			solver.release_stats(),
			ReleaseStats {
				scheduled: 3,
				released: 3,
				failed: 0
			}
		);
		assert!(solver.active_jobs().is_empty());
	}

	#[tokio::test]
	async fn test_one_export_per_ref_with_keys() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let key = Arc::new(CountingKey::default());
		let solver = solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 3,
			key: Some(key.clone()),
			gate: None,
		});

		let cache_exporter = Arc::new(StubCacheExporter::default());
		solver
			.solve(
				&Context::background(),
				"j",
				snap_request(),
				ExporterRequest {
					cache_exporter: Some(cache_exporter.clone()),
					cache_export_mode: CacheExportMode::Max,
					..Default::default()
				},
			)
			.await
			.unwrap();

		assert_eq!(key.calls.load(Ordering::SeqCst), 4);
		assert_eq!(cache_exporter.records.load(Ordering::SeqCst), 4);
		solver.wait_released().await;
		assert_eq!(worker.store().active_handles(), 0);
	}

	#[tokio::test]
	async fn test_cache_export_stops_at_first_failing_ref() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let gate = Arc::new(Notify::new());
		let key = Arc::new(CountingKey {
			fail_on: Some(2),
			..Default::default()
		});
		let solver = Arc::new(solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 3,
			key: Some(key.clone()),
			gate: Some(gate.clone()),
		}));

		let finalized = Arc::new(StubCacheExporter::default());
		let (res, vertices, statuses) = solve_observed(
			solver.clone(),
			gate,
			"partial",
			ExporterRequest {
				cache_exporter: Some(finalized.clone()),
				cache_export_mode: CacheExportMode::Max,
				..Default::default()
			},
		)
		.await;

		let err = res.unwrap_err();
		assert!(matches!(&err, CoreError::CacheExport(msg) if msg == "Cache error: boom"));
		// Four refs carry keys; the second export fails and the rest are skipped.
		assert_eq!(key.calls.load(Ordering::SeqCst), 2);
		assert_eq!(finalized.records.load(Ordering::SeqCst), 1);

		let marker = statuses
			.iter()
			.find(|s| s.name == "preparing build cache for export")
			.unwrap();
		assert!(marker.completed.is_some());
		assert_eq!(marker.error.as_deref(), Some("Cache error: boom"));
		let cache = vertices.iter().find(|v| v.name == "exporting cache").unwrap();
		assert_eq!(marker.vertex.as_ref(), Some(&cache.digest));
		assert_eq!(cache.error.as_deref(), Some("Cache error: boom"));

		solver.wait_released().await;
		assert_eq!(worker.store().active_handles(), 0);
	}

	#[tokio::test]
	async fn test_cache_export_uses_first_key_only() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let first = Arc::new(CountingKey::default());
		let second = Arc::new(CountingKey::default());
		let solver = SolverBuilder::with_memory_cache(controller(&worker))
			.with_frontend(
				"two-keys",
				Arc::new(TwoKeyFrontend {
					worker: worker.clone(),
					first: first.clone(),
					second: second.clone(),
				}),
			)
			.build()
			.unwrap();

		solver
			.solve(
				&Context::background(),
				"keys",
				SolveRequest::with_frontend("two-keys", HashMap::new()),
				ExporterRequest {
					cache_exporter: Some(Arc::new(StubCacheExporter::default())),
					cache_export_mode: CacheExportMode::Max,
					..Default::default()
				},
			)
			.await
			.unwrap();

		assert_eq!(first.calls.load(Ordering::SeqCst), 1);
		assert_eq!(second.calls.load(Ordering::SeqCst), 0);
		solver.wait_released().await;
		assert_eq!(worker.store().active_handles(), 0);
	}

	#[tokio::test]
	async fn test_session_id_recorded_on_job() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let gate = Arc::new(Notify::new());
		let solver = Arc::new(solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 0,
			key: None,
			gate: Some(gate.clone()),
		}));

		let running = {
			let solver = solver.clone();
			tokio::spawn(async move {
				let ctx = Context::background().with_session_id("session-1");
				solver
					.solve(&ctx, "with-session", snap_request(), ExporterRequest::default())
					.await
			})
		};
		while solver.active_jobs().is_empty() {
			tokio::task::yield_now().await;
		}

		let job = solver.jobs().get("with-session").unwrap();
		assert_eq!(job.session_id().as_deref(), Some("session-1"));
		gate.notify_one();
		running.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn test_solve_with_status_sees_fast_job() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let solver = solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 0,
			key: None,
			gate: None,
		});

		let (tx, rx) = mpsc::channel(1);
		solver
			.solve_with_status(
				&Context::background(),
				"fast",
				snap_request(),
				ExporterRequest {
					exporter: Some(StubExporter::new("image", false)),
					..Default::default()
				},
				tx,
			)
			.await
			.unwrap();
		assert!(solver.active_jobs().is_empty());

		let (vertices, _) = collect_progress(rx).await;
		assert_eq!(vertices.len(), 1);
		assert_eq!(vertices[0].name, "image");
		assert!(vertices[0].completed.is_some());
	}

	#[tokio::test]
	async fn test_status_unknown_job_is_not_found() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let solver = SolverBuilder::with_memory_cache(controller(&worker))
			.build()
			.unwrap();

		let (tx, mut rx) = mpsc::channel(1);
		let err = solver
			.status(&Context::background(), "missing", tx)
			.await
			.unwrap_err();
		assert!(matches!(err, CoreError::JobNotFound(id) if id == "missing"));
		assert!(rx.recv().await.is_none());
		assert!(solver.active_jobs().is_empty());
	}

	#[tokio::test]
	async fn test_status_after_discard_is_not_found() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let solver = SolverBuilder::with_memory_cache(controller(&worker))
			.build()
			.unwrap();
		solver
			.solve(
				&Context::background(),
				"done",
				SolveRequest::default(),
				ExporterRequest::default(),
			)
			.await
			.unwrap();

		let (tx, _rx) = mpsc::channel(1);
		assert!(matches!(
			solver.status(&Context::background(), "done", tx).await,
			Err(CoreError::JobNotFound(_))
		));
	}

	#[tokio::test]
	async fn test_concurrent_solves_are_independent() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let solver = Arc::new(
			SolverBuilder::with_memory_cache(controller(&worker))
				.build()
				.unwrap(),
		);

		let mut handles = Vec::new();
		for i in 0..8 {
			let solver = solver.clone();
			handles.push(tokio::spawn(async move {
				let def = Definition::new(vec![OpDef {
					name: format!("src-{}", i),
					op: json!({"type": "source", "files": {"n": i.to_string()}}),
					inputs: vec![],
				}]);
				solver
					.solve(
						&Context::background(),
						&format!("job-{}", i),
						SolveRequest::with_definition(def),
						ExporterRequest::default(),
					)
					.await
			}));
		}
		for handle in handles {
			handle.await.unwrap().unwrap();
		}
		assert!(solver.active_jobs().is_empty());
	}

	#[tokio::test]
	async fn test_blocked_cache_export_does_not_hold_up_other_jobs() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let solver = Arc::new(solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 1,
			key: Some(Arc::new(CountingKey::default())),
			gate: None,
		}));

		let blocking = Arc::new(BlockingCacheExporter::default());
		let stuck = {
			let solver = solver.clone();
			let exp = ExporterRequest {
				cache_exporter: Some(blocking.clone()),
				..Default::default()
			};
			tokio::spawn(async move {
				solver
					.solve(&Context::background(), "a", snap_request(), exp)
					.await
			})
		};
		blocking.entered.notified().await;

		let other = tokio::time::timeout(
			Duration::from_secs(5),
			solver.solve(
				&Context::background(),
				"b",
				snap_request(),
				ExporterRequest {
					exporter: Some(StubExporter::new("image", false)),
					cache_exporter: Some(Arc::new(StubCacheExporter::default())),
					cache_export_mode: CacheExportMode::Min,
				},
			),
		)
		.await
		.expect("job b waited on job a")
		.unwrap();
		assert_eq!(
			other.exporter_response.get("containerimage.digest").map(String::as_str),
			Some("sha256:abc")
		);
		assert!(!stuck.is_finished());
		assert_eq!(solver.active_jobs(), vec!["a".to_string()]);

		blocking.release.notify_one();
		stuck.await.unwrap().unwrap();
		solver.wait_released().await;
		assert_eq!(worker.store().active_handles(), 0);
	}

	#[tokio::test]
	async fn test_duplicate_live_job_id_conflicts() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let gate = Arc::new(Notify::new());
		let solver = Arc::new(solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 0,
			key: None,
			gate: Some(gate.clone()),
		}));

		let first = solver.clone();
		let running = tokio::spawn(async move {
			first
				.solve(&Context::background(), "dup", snap_request(), ExporterRequest::default())
				.await
		});
		while solver.active_jobs().is_empty() {
			tokio::task::yield_now().await;
		}

		let err = solver
			.solve(&Context::background(), "dup", snap_request(), ExporterRequest::default())
			.await
			.unwrap_err();
		assert!(matches!(err, CoreError::Job(_)));

		gate.notify_one();
		running.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn test_cancel_during_solve() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let solver = solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 0,
			key: None,
			gate: Some(Arc::new(Notify::new())),
		});

		let ctx = Context::background();
		let token = ctx.cancellation_token().clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(10)).await;
			token.cancel();
		});

		let err = solver
			.solve(&ctx, "c", snap_request(), ExporterRequest::default())
			.await
			.unwrap_err();
		assert!(err.is_cancelled());
		assert!(solver.active_jobs().is_empty());
	}

	#[tokio::test]
	async fn test_foreign_reference_rejected_for_export() {
		#[derive(Debug)]
		struct Foreign;

		#[async_trait]
		impl SolverResult for Foreign {
			fn id(&self) -> String {
				"foreign".to_string()
			}
			fn clone_ref(&self) -> Arc<dyn SolverResult> {
				Arc::new(Foreign)
			}
			async fn release(&self, _ctx: &Context) -> BuildResult<()> {
				Ok(())
			}
			fn sys(&self) -> &dyn Any {
				self
			}
		}

		struct ForeignFrontend;

		#[async_trait]
		impl Frontend for ForeignFrontend {
			async fn solve(
				&self,
				_ctx: &Context,
				_bridge: Arc<dyn FrontendBridge>,
				_opts: &HashMap<String, String>,
			) -> BuildResult<FrontendResult> {
				Ok(FrontendResult::single(CachedResult::new(Arc::new(Foreign), vec![])))
			}
		}

		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let solver = SolverBuilder::with_memory_cache(controller(&worker))
			.with_frontend("foreign", Arc::new(ForeignFrontend))
			.build()
			.unwrap();

		let err = solver
			.solve(
				&Context::background(),
				"f",
				SolveRequest::with_frontend("foreign", HashMap::new()),
				ExporterRequest {
					exporter: Some(StubExporter::new("local", false)),
					..Default::default()
				},
			)
			.await
			.unwrap_err();
		assert_eq!(err.to_string(), "invalid reference: foreign");
	}

	#[tokio::test]
	async fn test_image_export_scenario() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let gate = Arc::new(Notify::new());
		let solver = Arc::new(solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 0,
			key: None,
			gate: Some(gate.clone()),
		}));

		let (resp, vertices, _) = solve_observed(
			solver,
			gate,
			"img",
			ExporterRequest {
				exporter: Some(StubExporter::new("image", false)),
				..Default::default()
			},
		)
		.await;
		let resp = resp.unwrap();
		assert_eq!(
			resp.exporter_response.get("containerimage.digest").map(String::as_str),
			Some("sha256:abc")
		);
		assert_eq!(resp.exporter_response.len(), 1);

		assert_eq!(vertices.len(), 1);
		let image = &vertices[0];
		assert_eq!(image.name, "image");
		assert!(image.started.unwrap() < image.completed.unwrap());
		assert!(image.error.is_none());
	}

	#[tokio::test]
	async fn test_cache_finalize_failure_scenario() {
		let worker = Arc::new(LocalWorker::new("w", vec![]));
		let gate = Arc::new(Notify::new());
		let solver = Arc::new(solver_with(SnapshotFrontend {
			worker: worker.clone(),
			named: 1,
			key: Some(Arc::new(CountingKey::default())),
			gate: Some(gate.clone()),
		}));

		let (res, vertices, _) = solve_observed(
			solver.clone(),
			gate,
			"both",
			ExporterRequest {
				exporter: Some(StubExporter::new("image", false)),
				cache_exporter: Some(Arc::new(StubCacheExporter {
					fail_finalize: true,
					..Default::default()
				})),
				cache_export_mode: CacheExportMode::Min,
			},
		)
		.await;
		let err = res.unwrap_err();
		assert!(matches!(&err, CoreError::CacheExport(msg) if msg.contains("remote unavailable")));

		let image = vertices.iter().find(|v| v.name == "image").unwrap();
		let cache = vertices.iter().find(|v| v.name == "exporting cache").unwrap();
		assert!(image.error.is_none());
		assert!(cache.error.as_deref().unwrap().contains("remote unavailable"));

		solver.wait_released().await;
		assert_eq!(worker.store().active_handles(), 0);
	}
}
