//! The bridge frontends and worker ops call back into while a job solves.

use async_trait::async_trait;
use solver_graph::{load, Builder};
use solver_types::{
	parse_cache_ref, BuildError, BuildResult, CacheManager, CacheRecord, Context, Digest, Frontend,
	FrontendBridge, FrontendResult, Platform, ResolveCacheImporterFn, SolveRequest, SolverResult,
	Worker,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument};

use crate::vertex::run_in_vertex_context;

/// Picks the worker new operations run on.
pub type ResolveWorkerFn = Arc<dyn Fn() -> BuildResult<Arc<dyn Worker>> + Send + Sync>;

/// Everything a bridge needs besides the job it is bound to. Shared by all
/// bridges of one solver.
#[derive(Clone)]
pub struct BridgeOpt {
	pub frontends: Arc<HashMap<String, Arc<dyn Frontend>>>,
	pub resolve_worker: ResolveWorkerFn,
	pub resolve_cache_importer: Option<ResolveCacheImporterFn>,
	/// Platforms of the default worker, captured when the solver is built.
	pub platforms: Vec<Platform>,
}

pub struct LlbBridge {
	builder: Arc<dyn Builder>,
	opt: BridgeOpt,
	cache_managers: Mutex<HashMap<String, Arc<dyn CacheManager>>>,
	this: Weak<LlbBridge>,
}

impl LlbBridge {
	pub fn new(builder: Arc<dyn Builder>, opt: BridgeOpt) -> Arc<Self> {
		Arc::new_cyclic(|this| LlbBridge {
			builder,
			opt,
			cache_managers: Mutex::new(HashMap::new()),
			this: this.clone(),
		})
	}

	fn as_bridge(&self) -> BuildResult<Arc<dyn FrontendBridge>> {
		self.this
			.upgrade()
			.map(|bridge| bridge as Arc<dyn FrontendBridge>)
			.ok_or_else(|| BuildError::NotFound("bridge dropped during solve".to_string()))
	}

	async fn solve_with_frontend(
		&self,
		ctx: &Context,
		name: &str,
		opts: &HashMap<String, String>,
	) -> BuildResult<FrontendResult> {
		let frontend = self
			.opt
			.frontends
			.get(name)
			.cloned()
			.ok_or_else(|| BuildError::NotFound(format!("frontend not found: {}", name)))?;

		let ctx = self.builder.context(ctx);
		frontend
			.solve(&ctx, self.as_bridge()?, opts)
			.await
			.map_err(|e| match e {
				BuildError::Cancelled => BuildError::Cancelled,
				other => BuildError::Frontend(format!(
					"failed to solve with frontend {}: {}",
					name, other
				)),
			})
	}
}

#[async_trait]
impl FrontendBridge for LlbBridge {
	#[instrument(skip_all, fields(frontend = ?req.frontend))]
	async fn solve(&self, ctx: &Context, req: SolveRequest) -> BuildResult<FrontendResult> {
		let mut cache_sources = Vec::with_capacity(req.import_cache_refs.len());
		for cache_ref in &req.import_cache_refs {
			cache_sources.push(self.resolve_cache_importer(ctx, cache_ref).await?);
		}

		match (req.definition, req.frontend) {
			(Some(_), Some(_)) => Err(BuildError::InvalidDefinition(
				"cannot solve with both definition and frontend specified".to_string(),
			)),
			(Some(definition), None) => {
				let vertex = load(&definition)?;
				debug!("Building definition with {} ops", definition.ops.len());
				let result = self.builder.build(ctx, vertex, cache_sources).await?;
				Ok(FrontendResult::single(result))
			}
			(None, Some(frontend)) => {
				self.solve_with_frontend(ctx, &frontend, &req.frontend_opt)
					.await
			}
			(None, None) => Ok(FrontendResult::default()),
		}
	}

	fn resolve_worker(&self) -> BuildResult<Arc<dyn Worker>> {
		(self.opt.resolve_worker)()
	}

	async fn resolve_cache_importer(
		&self,
		_ctx: &Context,
		cache_ref: &str,
	) -> BuildResult<Arc<dyn CacheManager>> {
		let mut managers = self.cache_managers.lock().await;
		if let Some(manager) = managers.get(cache_ref) {
			return Ok(manager.clone());
		}

		let manager: Arc<dyn CacheManager> = Arc::new(LazyCacheManager {
			reference: cache_ref.to_string(),
			resolver: self.opt.resolve_cache_importer.clone(),
			resolve_worker: self.opt.resolve_worker.clone(),
			inner: OnceCell::new(),
		});
		managers.insert(cache_ref.to_string(), manager.clone());
		Ok(manager)
	}

	fn platforms(&self) -> Vec<Platform> {
		self.opt.platforms.clone()
	}
}

/// A cache manager whose importer only runs when the cache is first
/// consulted. The import shows up as its own vertex.
struct LazyCacheManager {
	reference: String,
	resolver: Option<ResolveCacheImporterFn>,
	resolve_worker: ResolveWorkerFn,
	inner: OnceCell<Arc<dyn CacheManager>>,
}

impl LazyCacheManager {
	async fn get(&self, ctx: &Context) -> BuildResult<&Arc<dyn CacheManager>> {
		self.inner
			.get_or_try_init(|| async move {
				let name = format!("importing cache manifest from {}", self.reference);
				run_in_vertex_context(ctx, &name, |ctx| async move {
					let resolver = self.resolver.as_ref().ok_or_else(|| {
						BuildError::Cache("no cache importer is available".to_string())
					})?;
					let (typ, reference) = parse_cache_ref(&self.reference);
					let importer = resolver(typ, reference)?;
					let worker = (self.resolve_worker)()?;
					ctx.run(importer.resolve(&ctx, reference, worker)).await
				})
				.await
			})
			.await
	}
}

#[async_trait]
impl CacheManager for LazyCacheManager {
	fn id(&self) -> String {
		self.reference.clone()
	}

	async fn query(&self, ctx: &Context, digest: &Digest) -> BuildResult<Option<CacheRecord>> {
		self.get(ctx).await?.query(ctx, digest).await
	}

	async fn load(&self, ctx: &Context, record: &CacheRecord) -> BuildResult<Arc<dyn SolverResult>> {
		self.get(ctx).await?.load(ctx, record).await
	}

	async fn save(
		&self,
		ctx: &Context,
		record: CacheRecord,
		result: Arc<dyn SolverResult>,
	) -> BuildResult<()> {
		self.get(ctx).await?.save(ctx, record, result).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use solver_graph::{InMemoryCacheManager, JobSolver, ResolveOpFn, SolverOpt};
	use solver_types::{CacheImporter, Definition, OpDef, ProgressPayload};
	use solver_worker::implementations::local::LocalWorker;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct EchoFrontend;

	#[async_trait]
	impl Frontend for EchoFrontend {
		async fn solve(
			&self,
			ctx: &Context,
			bridge: Arc<dyn FrontendBridge>,
			opts: &HashMap<String, String>,
		) -> BuildResult<FrontendResult> {
			if opts.contains_key("fail") {
				return Err(BuildError::Frontend("bad options".to_string()));
			}
			let definition = Definition::new(vec![OpDef {
				name: "echo".to_string(),
				op: json!({"type": "source", "files": {"platforms": bridge.platforms().len().to_string()}}),
				inputs: vec![],
			}]);
			bridge.solve(ctx, SolveRequest::with_definition(definition)).await
		}
	}

	struct CountingImporter {
		resolved: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl CacheImporter for CountingImporter {
		async fn resolve(
			&self,
			_ctx: &Context,
			reference: &str,
			_worker: Arc<dyn Worker>,
		) -> BuildResult<Arc<dyn CacheManager>> {
			self.resolved.fetch_add(1, Ordering::SeqCst);
			Ok(Arc::new(InMemoryCacheManager::new(reference)))
		}
	}

	fn setup(
		importer: Option<ResolveCacheImporterFn>,
	) -> (Arc<LocalWorker>, JobSolver, BridgeOpt) {
		let worker = Arc::new(LocalWorker::new("local", vec![Platform::host()]));
		let default_worker: Arc<dyn Worker> = worker.clone();
		let resolve_worker: ResolveWorkerFn = Arc::new(move || Ok(default_worker.clone()));

		let mut frontends: HashMap<String, Arc<dyn Frontend>> = HashMap::new();
		frontends.insert("echo".to_string(), Arc::new(EchoFrontend));
		let opt = BridgeOpt {
			frontends: Arc::new(frontends),
			resolve_worker,
			resolve_cache_importer: importer,
			platforms: vec![Platform::host()],
		};

		let op_opt = opt.clone();
		let resolve_op: ResolveOpFn = Arc::new(move |vertex, builder| {
			let worker = (op_opt.resolve_worker)()?;
			worker.resolve_op(vertex, LlbBridge::new(builder, op_opt.clone()))
		});
		let jobs = JobSolver::new(SolverOpt::new(
			resolve_op,
			Arc::new(InMemoryCacheManager::new("default")),
		));
		(worker, jobs, opt)
	}

	fn definition() -> Definition {
		Definition::new(vec![OpDef {
			name: "src".to_string(),
			op: json!({"type": "source", "files": {"a": "b"}}),
			inputs: vec![],
		}])
	}

	#[tokio::test]
	async fn test_rejects_definition_and_frontend_together() {
		let (_worker, jobs, opt) = setup(None);
		let job = jobs.new_job("j").unwrap();
		let bridge = LlbBridge::new(job.clone(), opt);

		let mut req = SolveRequest::with_definition(definition());
		req.frontend = Some("echo".to_string());
		let err = bridge.solve(&Context::background(), req).await.unwrap_err();
		assert!(err.to_string().contains("cannot solve with both"));

		let empty = bridge
			.solve(&Context::background(), SolveRequest::default())
			.await
			.unwrap();
		assert!(empty.reference.is_none() && empty.refs.is_none());
		job.discard();
	}

	#[tokio::test]
	async fn test_frontend_lookup_and_error_wrapping() {
		let (_worker, jobs, opt) = setup(None);
		let job = jobs.new_job("j").unwrap();
		let bridge = LlbBridge::new(job.clone(), opt);
		let ctx = Context::background();

		let err = bridge
			.solve(&ctx, SolveRequest::with_frontend("nope", HashMap::new()))
			.await
			.unwrap_err();
		assert_eq!(err.to_string(), "Not found: frontend not found: nope");

		let mut opts = HashMap::new();
		opts.insert("fail".to_string(), "1".to_string());
		let err = bridge
			.solve(&ctx, SolveRequest::with_frontend("echo", opts))
			.await
			.unwrap_err();
		assert!(err
			.to_string()
			.contains("failed to solve with frontend echo"));

		let res = bridge
			.solve(&ctx, SolveRequest::with_frontend("echo", HashMap::new()))
			.await
			.unwrap();
		res.reference.unwrap().release(&ctx).await.unwrap();
		job.discard();
	}

	#[tokio::test]
	async fn test_cache_importer_resolved_lazily_once() {
		let resolved = Arc::new(AtomicUsize::new(0));
		let counter = resolved.clone();
		let resolver: ResolveCacheImporterFn = Arc::new(move |typ, _reference| {
			assert_eq!(typ, "local");
			Ok(Arc::new(CountingImporter {
				resolved: counter.clone(),
			}) as Arc<dyn CacheImporter>)
		});
		let (_worker, jobs, opt) = setup(Some(resolver));
		let job = jobs.new_job("j").unwrap();
		let bridge = LlbBridge::new(job.clone(), opt);
		let ctx = job.context(&Context::background());

		let a = bridge.resolve_cache_importer(&ctx, "local:/tmp/c").await.unwrap();
		let b = bridge.resolve_cache_importer(&ctx, "local:/tmp/c").await.unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(resolved.load(Ordering::SeqCst), 0);

		let res = bridge
			.solve(&ctx, SolveRequest::with_definition(definition()).import_cache("local:/tmp/c"))
			.await
			.unwrap();
		assert_eq!(resolved.load(Ordering::SeqCst), 1);

		let names: Vec<String> = job.vertexes().into_iter().map(|v| v.name).collect();
		assert!(names.contains(&"importing cache manifest from local:/tmp/c".to_string()));
		res.reference.unwrap().release(&ctx).await.unwrap();
		job.discard();
	}

	#[tokio::test]
	async fn test_missing_importer_fails_on_first_use() {
		let (_worker, jobs, opt) = setup(None);
		let job = jobs.new_job("j").unwrap();
		let bridge = LlbBridge::new(job.clone(), opt);
		let ctx = job.context(&Context::background());

		let err = bridge
			.solve(&ctx, SolveRequest::with_definition(definition()).import_cache("remote"))
			.await
			.unwrap_err();
		assert!(err.to_string().contains("no cache importer is available"));

		let failed = job
			.progress()
			.history()
			.into_iter()
			.filter_map(|e| match e.payload {
				ProgressPayload::Vertex(v) if v.error.is_some() => Some(v.name),
				_ => None,
			})
			.collect::<Vec<_>>();
		assert_eq!(failed, vec!["importing cache manifest from remote".to_string()]);
		job.discard();
	}
}
