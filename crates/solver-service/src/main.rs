use anyhow::{Context as _, Result};
use clap::Parser;
use solver_config::{load_config, SolverConfig};
use solver_service::cli::{Args, Command, SolveArgs};
use solver_service::service::SolverService;
use solver_types::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();

	let config = load_config(args.config.as_deref())
		.await
		.context("Failed to load configuration")?;

	let log_level = args
		.log_level
		.clone()
		.unwrap_or_else(|| config.solver.log_level.clone());
	setup_tracing(&log_level, args.json_logs)?;

	match args.command {
		Command::Solve(solve) => run_solve(config, solve).await,
		Command::Validate => validate_config(&config),
		Command::GenerateConfig { output } => {
			let text = toml::to_string_pretty(&SolverConfig::default())
				.context("Failed to serialize default configuration")?;
			tokio::fs::write(&output, text)
				.await
				.with_context(|| format!("Failed to write {}", output.display()))?;
			info!("Wrote default configuration to {}", output.display());
			Ok(())
		}
	}
}

async fn run_solve(config: SolverConfig, args: SolveArgs) -> Result<()> {
	info!("Starting {}", config.solver.name);
	let service = SolverService::new(config)?;

	let token = CancellationToken::new();
	let ctx = Context::background().with_cancellation(token.clone());
	let cancel_on_signal = tokio::spawn(async move {
		shutdown_signal().await;
		warn!("Shutdown signal received, cancelling solve");
		token.cancel();
	});

	let result = service.solve(&ctx, &args).await;
	cancel_on_signal.abort();
	service.shutdown().await;

	let response = result?;
	let mut keys: Vec<_> = response.exporter_response.iter().collect();
	keys.sort();
	for (key, value) in keys {
		println!("{}={}", key, value);
	}
	Ok(())
}

fn validate_config(config: &SolverConfig) -> Result<()> {
	info!("Configuration is valid");
	info!("Solver name: {}", config.solver.name);
	for worker in &config.workers {
		let platforms: Vec<String> = worker
			.platforms_or_host()
			.iter()
			.map(ToString::to_string)
			.collect();
		info!(
			"  Worker: {} [{}]{}",
			worker.id,
			platforms.join(", "),
			if worker.default { " (default)" } else { "" }
		);
	}
	info!("  Frontends: {}", config.frontends.enabled.join(", "));
	info!(
		"  Cache: import type {}, export mode {}",
		config.cache.import_type, config.cache.export_mode
	);
	Ok(())
}

fn setup_tracing(log_level: &str, json: bool) -> Result<()> {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

	let registry = tracing_subscriber::registry().with(env_filter);
	if json {
		registry
			.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
			.try_init()?;
	} else {
		registry
			.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
			.try_init()?;
	}

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			warn!("Failed to listen for Ctrl+C: {}", e);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(e) => {
				warn!("Failed to install SIGTERM handler: {}", e);
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
