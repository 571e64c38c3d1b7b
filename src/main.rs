//! VolumeGroup Operator
//!
//! Groups PersistentVolumeClaims selected by a VolumeGroup into one backend
//! volume group per VolumeGroupContent.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_group_operator::{
    crds_yaml, run_controllers, wait_for_crds, BackendFactory, Context, Error, KubeStore, Metrics,
    OperatorConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// VolumeGroup Operator - groups PersistentVolumeClaims on the storage backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the driver whose VolumeGroupClasses this operator serves
    #[arg(long, env = "DRIVER_NAME", required_unless_present = "print_crds")]
    driver_name: Option<String>,

    /// Timeout for each backend call, in seconds
    #[arg(long = "rpc-timeout-secs", env = "RPC_TIMEOUT", default_value = "60")]
    rpc_timeout_secs: u64,

    /// Allow a claim to belong to several groups
    #[arg(long, env = "MULTIPLE_GROUPS_PER_CLAIM")]
    multiple_groups_per_claim: bool,

    /// Keep member claims when their VolumeGroupContent is deleted
    #[arg(long, env = "DISABLE_CLAIM_DELETION")]
    disable_claim_deletion: bool,

    /// Base URL of the group backend (`memory://` for an in-process backend)
    #[arg(long, env = "BACKEND_ENDPOINT", default_value = "http://127.0.0.1:9808")]
    backend_endpoint: String,

    /// Requeue interval after a successful reconcile, in seconds
    #[arg(long = "resync-secs", env = "RESYNC_SECS", default_value = "300")]
    resync_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the CRD manifests and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            driver_name: self.driver_name.clone().unwrap_or_default(),
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            multiple_groups_per_claim: self.multiple_groups_per_claim,
            disable_claim_deletion: self.disable_claim_deletion,
            resync_interval: Duration::from_secs(self.resync_secs),
            backend_endpoint: self.backend_endpoint.clone(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", crds_yaml()?);
        return Ok(());
    }

    init_logging(&args);

    let config = args.operator_config();
    config.validate()?;

    info!("Starting VolumeGroup operator");
    info!("  Version: {}", volume_group_operator::VERSION);
    info!("  Driver: {}", config.driver_name);
    info!("  Backend endpoint: {}", config.backend_endpoint);
    info!("  Single group per claim: {}", config.single_group_mode());
    info!("  Claim deletion: {}", !config.disable_claim_deletion);

    let client = kube::Client::try_default().await?;
    wait_for_crds(&client).await?;

    let metrics = Metrics::new()?;
    let backend = BackendFactory::create(&config)?;
    info!("  Group backend: {}", backend.name());
    let store = Arc::new(KubeStore::new(client.clone(), volume_group_operator::NAME));
    let ctx = Arc::new(Context::new(store, backend, config, metrics));

    let ready = Arc::new(AtomicBool::new(false));
    let health_addr = parse_addr(&args.health_addr, "health")?;
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;

    // Start health server
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_ctx).await {
            error!("Metrics server error: {}", e);
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    ready.store(true, Ordering::SeqCst);
    run_controllers(client, ctx, shutdown).await;

    info!("Operator shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid {} server address {}: {}", server, addr, e))
    })
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received SIGINT");
    }
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, ctx: Arc<Context>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ctx = ctx.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match ctx.metrics.encode() {
                            Ok(buffer) => {
                                let mut response = text_response(StatusCode::OK, buffer);
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    HeaderValue::from_static("text/plain; version=0.0.4"),
                                );
                                response
                            }
                            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
