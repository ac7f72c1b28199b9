use std::future::ready;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Error};
use axum::{routing::get, Router};
use common_metrics::{serve, setup_metrics_routes};
use common_redis::RedisClient;
use envconfig::Envconfig;
use health::HealthRegistry;
use jsonload::cli::{self, Cli, Invocation};
use jsonload::config::{Config, DatasetsFile, LogFormat};
use jsonload::error::PipelineError;
use jsonload::pipeline::{Intervals, Pipeline};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_filter(filter).boxed(),
    };
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "jsonload"
}

fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };
    Ok(())
}

async fn join_stopped(tasks: &mut JoinSet<Result<(), PipelineError>>) {
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "loop failed while stopping"),
            Err(e) => warn!(error = %e, "loop panicked while stopping"),
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<(), Error> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.datasets_config_path));
    let names = cli.datasets();
    let datasets = DatasetsFile::load(&path)?.select(&names)?;
    info!(config = %path.display(), datasets = ?names, "loaded datasets");

    let timeout = Some(config.redis_response_timeout_ms.0);
    let client = RedisClient::with_config(config.redis_url.clone(), timeout, timeout).await?;

    let liveness = HealthRegistry::new("liveness");
    let pipeline = Arc::new(Pipeline::build(
        Arc::new(client),
        &datasets,
        Intervals::from_config(&config),
        liveness.clone(),
    )?);

    for dataset in pipeline.datasets() {
        if let Err(e) = pipeline.discover(dataset).await {
            if e.is_fatal() {
                return Err(e.into());
            }
            warn!(dataset = %dataset.name, error = %e, "initial scan failed");
        }
    }

    let router = setup_metrics_routes(app(liveness))?;
    let bind = config.bind();
    info!(bind = %bind, "serving health and metrics");
    let server = tokio::spawn(async move { serve(router, &bind).await });

    let mut tasks = JoinSet::new();
    pipeline.spawn(&mut tasks);
    info!(loops = tasks.len(), "jsonload started");

    let outcome = tokio::select! {
        Some(res) = tasks.join_next() => match res {
            Ok(Ok(())) => Err(anyhow!("a pipeline loop exited")),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        },
        res = server => match res {
            Ok(Ok(())) => Err(anyhow!("http server exited")),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        },
        res = shutdown_signal() => {
            res?;
            info!("shutting down");
            Ok(())
        }
    };

    pipeline.stop();
    if outcome.is_ok() {
        let grace = config.shutdown_timeout_ms.0;
        if tokio::time::timeout(grace, join_stopped(&mut tasks)).await.is_err() {
            error!(
                loops = tasks.len(),
                "loops did not stop in time, batches they were sending are lost"
            );
        }
    }
    tasks.abort_all();
    if outcome.is_ok() {
        pipeline.flush_all().await;
    }
    outcome
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match cli::parse(std::env::args_os()) {
        Invocation::Run(cli) => cli,
        Invocation::Exit => return ExitCode::SUCCESS,
        Invocation::Invalid => return ExitCode::FAILURE,
    };

    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    setup_tracing(config.log_format);

    match run(cli, config).await {
        Ok(()) => {
            info!("exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "fatal error, exiting");
            ExitCode::FAILURE
        }
    }
}
