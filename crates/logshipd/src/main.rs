//! logshipd: wire the tailers, pipeline, and sinks together, apply config
//! reloads on SIGHUP, and run the orderly shutdown sequence on
//! SIGTERM/SIGINT.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use common::{
    config::LogshipConfig,
    errors::report_error,
    http::PooledFetchClient,
    runtime::Runtime,
    supervisor::TaskSupervisor,
};
use pipeline::Pipeline;
use runtime::ProdRuntime;
use tailers::{
    docker::DockerRuntime,
    ContainerTailer,
    FileTailerSet,
};
use tokio::signal::unix::{
    signal,
    SignalKind,
};
use tracing_subscriber::EnvFilter;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "logshipd", about = "Log capture and fan-out service")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: PathBuf,
    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let config = load_config(&args.config)?;
    if args.check {
        println!("Configuration OK: {:?}", args.config);
        return Ok(());
    }

    let tokio_rt = ProdRuntime::init_tokio()?;
    let rt = ProdRuntime::new(&tokio_rt);
    rt.block_on("logshipd", run(rt.clone(), args.config, config))
}

fn load_config(path: &PathBuf) -> anyhow::Result<LogshipConfig> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {path:?}"))?;
    LogshipConfig::from_json_slice(&raw).with_context(|| format!("Invalid config in {path:?}"))
}

async fn run(rt: ProdRuntime, config_path: PathBuf, config: LogshipConfig) -> anyhow::Result<()> {
    tracing::info!("Starting logshipd with config from {config_path:?}");
    let supervisor = TaskSupervisor::new(&rt, &config.supervisor);

    let fetch_client = Arc::new(PooledFetchClient::new(
        config.connection.max_conns_per_host,
        config.connection.max_idle_conns_per_host,
        config.connection.idle_timeout(),
    ));
    let sinks = sinks::build_sinks(&rt, &config.sinks, fetch_client).await?;
    anyhow::ensure!(!sinks.is_empty(), "At least one sink must be configured");

    let pipeline = Pipeline::start(rt.clone(), config.clone(), sinks, supervisor.clone())?;

    let file_tailers = FileTailerSet::new(
        rt.clone(),
        config.file.clone(),
        pipeline.record_sender(),
        supervisor.clone(),
    )?;
    for file in &config.files {
        file_tailers.track(&file.path, file.labels.clone());
    }

    let container_tailer = if config.container.enabled {
        let docker = DockerRuntime::connect().context("Failed to connect to the container runtime")?;
        Some(ContainerTailer::start(
            rt.clone(),
            config.container.clone(),
            Arc::new(docker),
            pipeline.record_sender(),
            supervisor.clone(),
        ))
    } else {
        None
    };

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut current_files: BTreeSet<PathBuf> =
        config.files.iter().map(|f| f.path.clone()).collect();

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                match load_config(&config_path) {
                    Err(mut e) => report_error(&mut e).await,
                    Ok(new_config) => {
                        if let Err(mut e) = apply_reload(
                            &pipeline,
                            &file_tailers,
                            &mut current_files,
                            new_config,
                        ).await {
                            report_error(&mut e).await;
                        }
                    },
                }
            },
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received");
                break;
            },
            _ = sigint.recv() => {
                tracing::info!("SIGINT received");
                break;
            },
            _ = rt.wait(STATS_LOG_INTERVAL) => {
                match serde_json::to_string(&pipeline.stats()) {
                    Ok(stats) => tracing::info!("Pipeline stats: {stats}"),
                    Err(e) => tracing::warn!("Failed to serialize stats: {e}"),
                }
            },
        }
    }

    // Orderly shutdown: stop sources, drain the pipeline, flush offsets,
    // close sinks, dead-letter whatever is still in retry.
    if let Some(containers) = &container_tailer {
        containers.shutdown();
    }
    file_tailers.shutdown().await;
    pipeline.shutdown().await;
    supervisor.shutdown_all();
    tracing::info!("logshipd stopped");
    Ok(())
}

/// Apply a SIGHUP reload: the pipeline takes the hot-reloadable subset, and
/// the tracked file set is diffed (removed paths keep tombstoned offsets).
async fn apply_reload(
    pipeline: &Arc<Pipeline<ProdRuntime>>,
    file_tailers: &FileTailerSet<ProdRuntime>,
    current_files: &mut BTreeSet<PathBuf>,
    new_config: LogshipConfig,
) -> anyhow::Result<()> {
    pipeline.apply_reload(new_config.clone())?;

    let new_files: BTreeSet<PathBuf> = new_config.files.iter().map(|f| f.path.clone()).collect();
    for removed in current_files.difference(&new_files) {
        file_tailers.untrack(removed).await;
    }
    for file in &new_config.files {
        if !current_files.contains(&file.path) {
            file_tailers.track(&file.path, file.labels.clone());
        }
    }
    *current_files = new_files;
    tracing::info!("Configuration reloaded");
    Ok(())
}
