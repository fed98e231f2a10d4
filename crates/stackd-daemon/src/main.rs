//! stackd
//!
//! Starts a stack of interdependent services in dependency order, gates
//! each start on its dependencies' health and fronts routed services with
//! TLS listeners that only forward while the target is healthy.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stackd_core::config::default_stack_path;
use stackd_core::{Stack, load_stack};
use stackd_daemon::health::NetworkProber;
use stackd_daemon::lifecycle::Orchestrator;
use stackd_daemon::process::LocalProcessRunner;
use stackd_daemon::status::{self, StatusState};
use stackd_daemon::telemetry::Telemetry;
use stackd_proxy::{ProxyServer, RouteTable};

#[derive(Parser, Debug)]
#[command(name = "stackd")]
#[command(version, about = "stackd - dependency-ordered service orchestrator")]
struct Cli {
    /// Stack file (defaults to ./stack.toml, then the user config dir)
    #[arg(long, global = true, env = "STACKD_STACK")]
    stack: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "STACKD_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "STACKD_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start every service and the proxy, run until SIGTERM or Ctrl+C
    Up {
        /// Status endpoint address (overrides the stack file)
        #[arg(long)]
        status_addr: Option<SocketAddr>,

        /// Address proxy listeners bind to (overrides the stack file)
        #[arg(long)]
        proxy_bind: Option<IpAddr>,

        /// OpenTelemetry OTLP endpoint for traces and metrics export
        /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
        #[cfg(feature = "metrics")]
        #[arg(long, env = "STACKD_METRICS_ENDPOINT")]
        metrics_endpoint: Option<String>,
    },
    /// Validate the stack file and print the start plan
    Check,
    /// Query a running daemon's status endpoint
    Status {
        /// Status endpoint address
        #[arg(long, default_value = "127.0.0.1:7070", env = "STACKD_STATUS_ADDR")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let stack_path = cli.stack.clone().unwrap_or_else(default_stack_path);
    let log_filter = stackd_core::tracing_init::filter_for_level(&cli.log_level);

    match cli.command {
        Command::Up {
            status_addr,
            proxy_bind,
            #[cfg(feature = "metrics")]
            metrics_endpoint,
        } => {
            // Hold the guard so the OTel pipeline stays alive until shutdown.
            #[cfg(feature = "metrics")]
            let metrics_guard = stackd_core::tracing_init::init_tracing_with_metrics(
                &log_filter,
                cli.log_json,
                metrics_endpoint.as_deref(),
            );
            #[cfg(feature = "metrics")]
            let telemetry = if metrics_guard.is_some() {
                Telemetry::with_metrics(stackd_core::metrics::OrchestratorMetrics::new())
            } else {
                Telemetry::disabled()
            };
            #[cfg(not(feature = "metrics"))]
            let telemetry = {
                stackd_core::tracing_init::init_tracing(&log_filter, cli.log_json);
                Telemetry::disabled()
            };

            let mut stack = load(&stack_path)?;
            if let Some(addr) = status_addr {
                stack.settings.status_addr = Some(addr);
            }
            if let Some(bind) = proxy_bind {
                stack.settings.proxy_bind = bind;
            }
            up(stack, telemetry).await
        }
        Command::Check => {
            stackd_core::tracing_init::init_tracing(&log_filter, cli.log_json);
            let stack = load(&stack_path)?;
            print_plan(&stack)?;
            Ok(())
        }
        Command::Status { addr } => {
            stackd_core::tracing_init::init_tracing(&log_filter, cli.log_json);
            print_status(addr).await
        }
    }
}

fn load(path: &Path) -> anyhow::Result<Stack> {
    load_stack(path).with_context(|| format!("Failed to load stack {}", path.display()))
}

#[allow(clippy::too_many_lines)]
async fn up(stack: Stack, telemetry: Telemetry) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        services = stack.store.len(),
        routes = stack.store.routed().count(),
        "Starting stackd"
    );

    let routes = Arc::new(RouteTable::from_store(&stack.store)?);
    let mut acceptors = HashMap::new();
    for (desc, route) in stack.store.routed().filter(|(_, r)| r.tls) {
        let tls = stack.tls_material(route).with_context(|| {
            format!("No certificate material for route of '{}'", desc.name)
        })?;
        acceptors.insert(
            route.listen_port,
            stackd_proxy::tls::acceptor(&tls.cert, &tls.key)?,
        );
    }

    let cancel = CancellationToken::new();
    let proxy = ProxyServer::start(
        stack.settings.proxy_bind,
        &routes,
        acceptors,
        cancel.clone(),
    )
    .await?;

    let runner = Arc::new(LocalProcessRunner::new());
    let prober = Arc::new(NetworkProber::new()?);
    let orchestrator = Orchestrator::from_stack(&stack, runner, prober)
        .with_readiness_listener(Arc::clone(&routes) as _)
        .with_telemetry(telemetry);
    let handle = orchestrator.start();

    let status_task = stack.settings.status_addr.map(|addr| {
        let state = StatusState {
            board: handle.board().clone(),
            ledger: handle.ledger().clone(),
            routes: Some(Arc::clone(&routes)),
        };
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(addr, state, cancel).await {
                warn!(addr = %addr, error = %e, "Status endpoint failed");
            }
        })
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd once every service has a known startup outcome.
    let board = handle.board().clone();
    let ready_task = tokio::spawn(async move {
        board.wait_settled().await;
        info!("All services settled");
        #[cfg(unix)]
        if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
            warn!(error = %e, "Failed to notify systemd");
        }
    });

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    ready_task.abort();
    routes.unroute_all();
    let report = handle.shutdown().await;
    info!(stopped = ?report.stopped, "Services stopped");

    cancel.cancel();
    proxy.join().await;
    if let Some(task) = status_task {
        let _ = task.await;
    }
    info!("stackd stopped");
    Ok(())
}

/// `stackd check`: print start levels, shutdown order and routes.
fn print_plan(stack: &Stack) -> io::Result<()> {
    let mut out = io::stdout();
    writeln!(out, "Stack is valid: {} service(s)", stack.store.len())?;
    for (i, level) in stack.graph.levels().iter().enumerate() {
        writeln!(out, "  level {i}: {}", level.join(", "))?;
    }
    writeln!(out, "Shutdown order: {}", stack.graph.shutdown_order().join(", "))?;
    for desc in stack.store.iter() {
        let dependents = stack.graph.dependents_of(&desc.name);
        if !dependents.is_empty() {
            writeln!(out, "  {} is needed by {}", desc.name, dependents.join(", "))?;
        }
    }
    for (desc, route) in stack.store.routed() {
        writeln!(
            out,
            "  route :{} -> {}:{}{}{}",
            route.listen_port,
            desc.name,
            route.target_port,
            if route.tls { " (tls)" } else { "" },
            if route.upgrade { " (upgrade)" } else { "" },
        )?;
    }
    Ok(())
}

/// `stackd status`: fetch and print the aggregate status.
async fn print_status(addr: SocketAddr) -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let client = reqwest::Client::builder().no_proxy().build()?;
    let report: serde_json::Value = client
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .with_context(|| format!("Failed to reach stackd at {addr}"))?
        .error_for_status()?
        .json()
        .await?;

    let mut out = io::stdout();
    writeln!(
        out,
        "{:<20}  {:<18}  {:<8}  {:<8}  ERROR",
        "SERVICE", "STATE", "PID", "RESTARTS"
    )?;
    let services = report["services"].as_array().cloned().unwrap_or_default();
    for service in &services {
        writeln!(
            out,
            "{:<20}  {:<18}  {:<8}  {:<8}  {}",
            service["name"].as_str().unwrap_or("?"),
            service["state"].as_str().unwrap_or("?"),
            service["pid"].as_u64().map_or_else(|| "-".to_string(), |p| p.to_string()),
            service["restarts"].as_u64().unwrap_or(0),
            service["error"].as_str().unwrap_or(""),
        )?;
    }
    if let Some(routes) = report["routes"].as_array()
        && !routes.is_empty()
    {
        writeln!(out)?;
        for route in routes {
            writeln!(
                out,
                "route :{} -> {} ({})",
                route["listen_port"],
                route["service"].as_str().unwrap_or("?"),
                route["state"].as_str().unwrap_or("?"),
            )?;
        }
    }
    Ok(())
}
