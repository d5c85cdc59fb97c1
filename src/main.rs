//! layercache service
//!
//! Runs one cache engine per configured profile and exposes their health and statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         layercache                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Profiles   │───▶│   Registry   │───▶│  L2 + Lock   │       │
//! │  │  (YAML/CLI)  │    │  (engines)   │    │ (mem/Redis)  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          /metrics ◀──────────┴──────────▶ /healthz /readyz      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use layercache::cache::CacheRegistry;
use layercache::error::{Error, Result};
use layercache::monitoring::{HealthCheck, StatsExporter};
use layercache::{ProfileSet, WarmupTask};

// =============================================================================
// CLI Arguments
// =============================================================================

/// layercache - multi-level cache engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML profile file (built-in profiles when omitted)
    #[arg(long, env = "LAYERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL for the distributed tier (in-memory when omitted)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Redis connection pool size
    #[arg(long, env = "REDIS_POOL_SIZE", default_value = "16")]
    redis_pool_size: usize,

    /// Redis connect and checkout timeout in milliseconds
    #[arg(long, env = "REDIS_TIMEOUT_MS", default_value = "2000")]
    redis_timeout_ms: u64,

    /// JSON warm-up data: {"<profile>": {"<key>": <value>}}
    #[arg(long, env = "LAYERCACHE_WARMUP_FILE")]
    warmup_file: Option<PathBuf>,

    /// Expired entry sweep interval in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECONDS", default_value = "30")]
    sweep_interval_seconds: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

type Registry = CacheRegistry<Value>;

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    info!("Starting layercache");
    info!(
        "  Profiles: {}",
        args.config
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in".to_string())
    );
    info!(
        "  Distributed tier: {}",
        if args.redis_url.is_some() { "redis" } else { "memory" }
    );

    let profiles = match &args.config {
        Some(path) => ProfileSet::from_file(path)?,
        None => ProfileSet::default(),
    };

    let registry = Arc::new(build_registry(&args, &profiles).await?);
    let cancel = CancellationToken::new();

    let mut background = registry.spawn_maintenance(
        Duration::from_secs(args.sweep_interval_seconds.max(1)),
        &cancel,
    );

    if let Some(path) = &args.warmup_file {
        background.extend(spawn_warmups(&registry, path, &cancel)?);
    }

    let health = Arc::new(HealthCheck::new());
    let exporter = Arc::new(StatsExporter::new()?);

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_state = (Arc::clone(&health), Arc::clone(&registry));
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_state).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_state = (Arc::clone(&exporter), Arc::clone(&registry));
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_state).await {
            error!("Metrics server error: {}", e);
        }
    });

    health.set_ready(true);
    info!("layercache ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    health.set_ready(false);
    health.set_live(false);
    cancel.cancel();
    for task in background {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("layercache shutdown complete");
    Ok(())
}

// =============================================================================
// Registry Setup
// =============================================================================

async fn build_registry(args: &Args, profiles: &ProfileSet) -> Result<Registry> {
    match &args.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => build_redis_registry(args, url, profiles).await,
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("Built without the redis feature, using the in-memory distributed tier");
            CacheRegistry::in_memory(profiles)
        }
        None => CacheRegistry::in_memory(profiles),
    }
}

#[cfg(feature = "redis")]
async fn build_redis_registry(args: &Args, url: &str, profiles: &ProfileSet) -> Result<Registry> {
    use layercache::cache::filter::{BloomParams, ExistenceFilter};
    use layercache::cache::l2::L2Store;
    use layercache::cache::lock::SharedLock;
    use layercache::cache::redis::{connect_pool, RedisBloomFilter, RedisL2Store, RedisLock};

    let pool = connect_pool(
        url,
        args.redis_pool_size,
        Duration::from_millis(args.redis_timeout_ms),
    )
    .await?;

    let l2: Arc<dyn L2Store> = Arc::new(RedisL2Store::new(pool.clone()));
    let lock: SharedLock = Arc::new(RedisLock::new(pool.clone()));

    CacheRegistry::with_backends(profiles, l2, lock, |profile| {
        let params = BloomParams::optimal(
            profile.filter_expected_items,
            profile.filter_false_positive_rate,
        )?;
        let filter: Arc<dyn ExistenceFilter> = Arc::new(RedisBloomFilter::new(
            pool.clone(),
            format!("bloom:{}", profile.name),
            params,
        ));
        Ok(Some(filter))
    })
}

/// Start warm-up for every profile that has data in `path` and warm-up enabled
fn spawn_warmups(
    registry: &Registry,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let text = std::fs::read_to_string(path)?;
    let data: HashMap<String, HashMap<String, Value>> = serde_json::from_str(&text)?;

    let mut handles = Vec::new();
    for (profile, entries) in data {
        let engine = match registry.get(&profile) {
            Some(engine) => Arc::clone(engine),
            None => {
                warn!("Warm-up data for unknown profile {}, skipping", profile);
                continue;
            }
        };
        if !engine.profile().warmup.enabled {
            info!("Warm-up disabled for profile {}", profile);
            continue;
        }

        let tasks = entries
            .into_iter()
            .map(|(key, value)| WarmupTask::new(key, async move { Ok(Some(value)) }))
            .collect();
        let warmup = engine.spawn_warmup(tasks, cancel.child_token());
        handles.push(tokio::spawn(async move {
            if let Err(e) = warmup.await {
                error!("Warm-up task for {} failed: {}", profile, e);
            }
        }));
    }
    Ok(handles)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info", "deadpool=info"] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| Error::Config(format!("Invalid log directive {}: {}", directive, e)))?,
        );
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
    Ok(())
}

// =============================================================================
// HTTP helpers
// =============================================================================

mod http {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::{Response, StatusCode};

    pub type HttpResponse = Response<Full<Bytes>>;

    pub fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        let value = HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("text/plain"));
        response.headers_mut().insert(CONTENT_TYPE, value);
        response
    }

    pub fn not_found() -> HttpResponse {
        respond(StatusCode::NOT_FOUND, "text/plain", "not found")
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, state: (Arc<HealthCheck>, Arc<Registry>)) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
        health: Arc<HealthCheck>,
        registry: Arc<Registry>,
    ) -> std::result::Result<http::HttpResponse, std::convert::Infallible> {
        let probe_status = |healthy: bool| {
            if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        let response = match req.uri().path() {
            "/livez" => http::respond(probe_status(health.is_live()), "text/plain", "ok"),
            "/readyz" => http::respond(probe_status(health.is_ready()), "text/plain", "ok"),
            "/healthz" => {
                let report = health.check_all(registry.health().await);
                match serde_json::to_vec(&report) {
                    Ok(body) => http::respond(
                        probe_status(report.status.is_operational()),
                        "application/json",
                        body,
                    ),
                    Err(e) => http::respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string(),
                    ),
                }
            }
            _ => http::not_found(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let (health, registry) = (Arc::clone(&state.0), Arc::clone(&state.1));

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                health_handler(req, Arc::clone(&health), Arc::clone(&registry))
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    state: (Arc<StatsExporter>, Arc<Registry>),
) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
        exporter: Arc<StatsExporter>,
        registry: Arc<Registry>,
    ) -> std::result::Result<http::HttpResponse, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                exporter.observe_all(&registry);
                match exporter.encode() {
                    Ok((content_type, body)) => {
                        http::respond(StatusCode::OK, &content_type, body)
                    }
                    Err(e) => http::respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string(),
                    ),
                }
            }
            _ => http::not_found(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let (exporter, registry) = (Arc::clone(&state.0), Arc::clone(&state.1));

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                metrics_handler(req, Arc::clone(&exporter), Arc::clone(&registry))
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
