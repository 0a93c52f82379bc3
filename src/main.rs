use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use http::Method;
use tokio::runtime::Handle;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratequeue::config::AppConfig;
use ratequeue::ratelimit::{RateLimitConfig, Request, Route, SequentialRateLimiter, Work};
use ratequeue::transport::{HttpTransport, Transport};

/// Send requests to an HTTP API through the sequential rate limiter.
#[derive(Debug, Parser)]
#[command(name = "ratequeue", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base URL, overrides `client.base_url`
    #[arg(long)]
    base_url: Option<String>,

    /// HTTP method
    #[arg(short, long, default_value = "GET")]
    method: Method,

    /// Route template, e.g. `/channels/{channel_id}/messages`
    #[arg(short, long)]
    route: String,

    /// Values substituted into the template placeholders, in order
    #[arg(short, long = "param")]
    params: Vec<String>,

    /// Major parameter of the route
    #[arg(long)]
    major: Option<String>,

    /// Only honor the edge-level global limit
    #[arg(long)]
    interaction: bool,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Exempt the requests from cancellation on shutdown
    #[arg(long)]
    priority: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    if let Some(base_url) = args.base_url.clone() {
        config.client.base_url = base_url;
    }
    info!(base_url = %config.client.base_url, "Configuration loaded");

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::from_settings(&config.client));
    let limiter = SequentialRateLimiter::new(RateLimitConfig::from_settings(
        Handle::current(),
        &config.limiter,
    ));

    let mut route = Route::new(args.method.clone(), args.route.clone()).compile(args.params.as_slice());
    if let Some(major) = args.major.clone() {
        route = route.with_major(major);
    }
    if args.interaction {
        route = route.interaction();
    }

    let mut pending = Vec::with_capacity(args.count);
    for _ in 0..args.count {
        let (request, response) = Request::new(route.clone(), Arc::clone(&transport));
        let work: Arc<dyn Work> = Arc::new(request.with_priority(args.priority));
        limiter.enqueue(work)?;
        pending.push(response);
    }
    info!(route = %route, count = args.count, bucket = %limiter.bucket_id(&route), "Requests queued");

    let shutdown = tokio::select! {
        outcomes = join_all(pending) => {
            for (index, outcome) in outcomes.into_iter().enumerate() {
                match outcome {
                    Ok(exchange) => info!(request = index, status = %exchange.status(), bytes = exchange.body().len(), "Request completed"),
                    Err(err) => warn!(request = index, error = %err, "Request failed"),
                }
            }
            false
        }
        _ = shutdown_signal() => true,
    };

    let (drained_tx, drained_rx) = oneshot::channel();
    limiter.stop(shutdown, move || {
        let _ = drained_tx.send(());
    });
    drained_rx.await?;

    info!(buckets = limiter.bucket_count(), "Ratequeue stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling queued requests");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling queued requests");
        }
    }
}
