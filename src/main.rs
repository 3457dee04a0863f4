//! rebind: an HTTP server that restarts in place.
//!
//! Serves a small JSON service behind the lifecycle controller. With a
//! config file, edits to the file (or SIGHUP) rebind the server with the
//! new settings while in-flight requests finish on the old listener.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Router};
use clap::Parser;
use serde::Serialize;

use rebind::config::{load_config, ConfigWatcher, ServiceConfig};
use rebind::http::{sequence, Formatter, JsonCodec, MiddlewareOptions, ServerBuilder};
use rebind::lifecycle::Controller;
use rebind::net::ConnectionHooks;
use rebind::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "rebind")]
#[command(about = "HTTP server with graceful shutdown and in-place restart", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file. Watched for changes.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address.
    #[arg(short, long)]
    bind: Option<String>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,
}

/// Address the serving run is bound to, set once per run.
#[derive(Debug, Clone, Copy)]
struct ServedAddr(SocketAddr);

#[derive(Serialize)]
struct Status<'a> {
    service: &'a str,
    address: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    };
    apply_overrides(&mut config, &cli);

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rebind starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        secure = config.tls.is_some(),
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    let builder = ServerBuilder::from_config(&config, build_app(&config))?.with_hooks(
        ConnectionHooks::default().base_context(|addr| {
            let mut extensions = axum::http::Extensions::new();
            extensions.insert(ServedAddr(addr));
            extensions
        }),
    );
    let controller = Controller::new(builder).graceful_timeout(config.timeouts.graceful());

    let _watcher = match cli.config.clone() {
        Some(path) => Some(spawn_reloader(controller.clone(), &path, cli)?),
        None => None,
    };

    controller.start().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn apply_overrides(config: &mut ServiceConfig, cli: &Cli) {
    if let Some(bind) = &cli.bind {
        config.listener.bind_address = bind.clone();
    }
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
}

fn build_app(config: &ServiceConfig) -> Router {
    let formatter = Formatter::new(JsonCodec::new());
    let name = config.listener.name.clone();

    let router = Router::new()
        .route(
            "/",
            get({
                let formatter = formatter.clone();
                move |Extension(ServedAddr(addr)): Extension<ServedAddr>| async move {
                    status(&formatter, &name, addr)
                }
            }),
        )
        .route(
            "/health",
            get(move || async move {
                formatter.write_response(StatusCode::OK, Some(&serde_json::json!({ "status": "ok" })))
            }),
        );

    let options = MiddlewareOptions::from_config(&config.observability, config.cors.clone());
    sequence(router, &options)
}

fn status(formatter: &Formatter<JsonCodec>, name: &str, addr: SocketAddr) -> Response {
    formatter.write_response(
        StatusCode::OK,
        Some(&Status {
            service: name,
            address: addr.to_string(),
        }),
    )
}

/// Apply config file changes (and SIGHUP) to the controller, then restart.
fn spawn_reloader(
    controller: Controller,
    path: &Path,
    cli: Cli,
) -> Result<notify::RecommendedWatcher, notify::Error> {
    let (watcher, mut updates) = ConfigWatcher::new(path);
    let watcher = watcher.run()?;
    let path = path.to_path_buf();

    tokio::spawn(async move {
        let mut hangup = hangup_stream();
        loop {
            let mut config = tokio::select! {
                Some(config) = updates.recv() => config,
                Some(()) = next_hangup(&mut hangup) => match load_config(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to reload config on SIGHUP");
                        continue;
                    }
                },
                else => return,
            };
            apply_overrides(&mut config, &cli);

            let applied = controller.update(|builder| builder.apply_config(&config));
            if let Err(e) = applied {
                tracing::error!(error = %e, "Rejected reloaded config, keeping current configuration");
                continue;
            }
            controller.replace_handler(build_app(&config));
            controller.set_graceful_timeout(config.timeouts.graceful());
            controller.restart();
        }
    });

    Ok(watcher)
}

#[cfg(unix)]
type Hangup = Option<tokio::signal::unix::Signal>;

#[cfg(not(unix))]
type Hangup = Option<()>;

#[cfg(unix)]
fn hangup_stream() -> Hangup {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::warn!(error = %e, "SIGHUP reload unavailable");
            None
        }
    }
}

#[cfg(not(unix))]
fn hangup_stream() -> Hangup {
    None
}

#[cfg(unix)]
async fn next_hangup(hangup: &mut Hangup) -> Option<()> {
    match hangup {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn next_hangup(_: &mut Hangup) -> Option<()> {
    std::future::pending().await
}
