//! Wires the configured workers, frontends, exporters and caches into a
//! [`Solver`] and runs solves for the command line.

use anyhow::{bail, Context as _, Result};
use solver_cache::{create_cache_exporter, local_importer_resolver};
use solver_config::SolverConfig;
use solver_core::utils::truncate_digest;
use solver_core::{ExporterRequest, Solver, SolverBuilder};
use solver_exporter::{create_exporter, ImageStore};
use solver_frontend::{builtin_frontends, DEFINITION_OPT};
use solver_types::{
	new_id, Context, Definition, ResolveCacheImporterFn, SolveRequest, SolveResponse, SolveStatus,
	Worker,
};
use solver_worker::implementations::local::LocalWorker;
use solver_worker::WorkerController;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::cli::SolveArgs;

pub struct SolverService {
	solver: Arc<Solver>,
	images: Arc<ImageStore>,
	config: SolverConfig,
}

impl SolverService {
	#[instrument(skip_all, fields(name = %config.solver.name))]
	pub fn new(config: SolverConfig) -> Result<Self> {
		let controller = Self::init_workers(&config)?;

		let mut builder = SolverBuilder::with_memory_cache(Arc::new(controller))
			.with_cache_importer(Self::cache_importer(&config))
			.with_release_workers(config.solver.release_workers)
			.with_release_queue_size(config.solver.release_queue_size)
			.with_status_grace(config.solver.status_grace);
		for (name, frontend) in builtin_frontends(&config.frontends.enabled)? {
			builder = builder.with_frontend(&name, frontend);
		}
		let solver = builder.build().context("Failed to build solver")?;

		info!("Solver service initialized");
		Ok(Self {
			solver: Arc::new(solver),
			images: Arc::new(ImageStore::new()),
			config,
		})
	}

	fn init_workers(config: &SolverConfig) -> Result<WorkerController> {
		let mut controller = WorkerController::new();
		for worker in &config.workers {
			let local: Arc<dyn Worker> =
				Arc::new(LocalWorker::new(worker.id.clone(), worker.platforms_or_host()));
			controller = controller.with_worker(local)?;
		}
		let Some(default) = config.default_worker() else {
			bail!("No worker configured");
		};
		Ok(controller.with_default(default.id.clone()))
	}

	/// Cache references without a type prefix use the configured import type.
	fn cache_importer(config: &SolverConfig) -> ResolveCacheImporterFn {
		let resolve = local_importer_resolver();
		let import_type = config.cache.import_type.clone();
		Arc::new(move |typ: &str, reference: &str| {
			let typ = if typ.is_empty() { import_type.as_str() } else { typ };
			resolve(typ, reference)
		})
	}

	pub fn solver(&self) -> &Arc<Solver> {
		&self.solver
	}

	pub fn images(&self) -> &Arc<ImageStore> {
		&self.images
	}

	async fn request(&self, args: &SolveArgs) -> Result<SolveRequest> {
		let definition = match &args.definition {
			Some(path) => Some(
				tokio::fs::read_to_string(path)
					.await
					.with_context(|| format!("Failed to read definition {}", path.display()))?,
			),
			None => None,
		};

		let mut req = match (&args.frontend, definition) {
			(Some(frontend), definition) => {
				let mut opts: HashMap<String, String> = args.opts.iter().cloned().collect();
				if let Some(definition) = definition {
					opts.insert(DEFINITION_OPT.to_string(), definition);
				}
				SolveRequest::with_frontend(frontend.clone(), opts)
			}
			(None, Some(definition)) => {
				let definition: Definition =
					serde_json::from_str(&definition).context("Failed to parse definition")?;
				SolveRequest::with_definition(definition)
			}
			(None, None) => SolveRequest::default(),
		};
		for cache_ref in &args.cache_from {
			req = req.import_cache(cache_ref.clone());
		}
		Ok(req)
	}

	fn exporter_request(&self, args: &SolveArgs) -> Result<ExporterRequest> {
		let mut exp = ExporterRequest {
			cache_export_mode: args.cache_mode.unwrap_or(self.config.cache.export_mode),
			..Default::default()
		};

		if let Some(name) = &args.export {
			let mut attrs = HashMap::new();
			if let Some(dest) = &args.output {
				attrs.insert("dest".to_string(), dest.display().to_string());
			}
			if let Some(image_name) = &args.image_name {
				attrs.insert("name".to_string(), image_name.clone());
			}
			exp.exporter = Some(create_exporter(name, &attrs, self.images.clone())?);
		}
		if let Some(cache_ref) = &args.cache_to {
			exp.cache_exporter = Some(create_cache_exporter(cache_ref)?);
		}
		Ok(exp)
	}

	/// Runs one solve. With `args.progress`, vertex updates are printed to
	/// stderr while it runs.
	pub async fn solve(&self, ctx: &Context, args: &SolveArgs) -> Result<SolveResponse> {
		if !args.progress {
			return self.run(ctx, args, None).await;
		}

		let (tx, mut rx) = mpsc::channel::<SolveStatus>(64);
		let printer = tokio::spawn(async move {
			while let Some(status) = rx.recv().await {
				for line in render_status(&status) {
					eprintln!("{}", line);
				}
			}
		});
		let result = self.run(ctx, args, Some(tx)).await;
		if let Err(e) = printer.await {
			warn!("Progress printer failed: {}", e);
		}
		result
	}

	/// Runs one solve and relays every progress update of its job into
	/// `status`. The channel closes once the job's progress has ended.
	pub async fn solve_streaming(
		&self,
		ctx: &Context,
		args: &SolveArgs,
		status: mpsc::Sender<SolveStatus>,
	) -> Result<SolveResponse> {
		self.run(ctx, args, Some(status)).await
	}

	async fn run(
		&self,
		ctx: &Context,
		args: &SolveArgs,
		status: Option<mpsc::Sender<SolveStatus>>,
	) -> Result<SolveResponse> {
		let req = self.request(args).await?;
		let exp = self.exporter_request(args)?;
		let id = args.job_id.clone().unwrap_or_else(new_id);
		let ctx = ctx.clone().with_session_id(id.clone());

		info!("Solving job {}", id);
		let response = match status {
			Some(tx) => self.solver.solve_with_status(&ctx, &id, req, exp, tx).await?,
			None => self.solver.solve(&ctx, &id, req, exp).await?,
		};
		Ok(response)
	}

	pub async fn shutdown(&self) {
		self.solver.shutdown().await;
		let stats = self.solver.release_stats();
		info!(
			"Released {} of {} references ({} failures)",
			stats.released, stats.scheduled, stats.failed
		);
	}
}

/// One line per vertex transition in a status batch.
pub fn render_status(status: &SolveStatus) -> Vec<String> {
	let mut lines = Vec::new();
	for vertex in &status.vertexes {
		let digest = truncate_digest(vertex.digest.as_str());
		let line = match (&vertex.error, vertex.cached, vertex.completed, vertex.started) {
			(Some(err), _, _, _) => format!("[{}] ERROR {}: {}", digest, vertex.name, err),
			(None, true, _, _) => format!("[{}] CACHED {}", digest, vertex.name),
			(None, false, Some(_), _) => format!("[{}] DONE {}", digest, vertex.name),
			(None, false, None, Some(_)) => format!("[{}] {}", digest, vertex.name),
			(None, false, None, None) => continue,
		};
		lines.push(line);
	}
	for status in &status.statuses {
		if status.completed.is_some() {
			lines.push(format!("  {} done", status.name));
		}
	}
	lines
}
