//! `dotfwd` binary entry point: parse config, wire cache → pools → engine →
//! listener/refresh, run until a shutdown signal, shut everything down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dotfwd::clock::CoarseClock;
use dotfwd::config::{Cli, Config, FileOverrides};
use dotfwd::dnscache::{DnsCache, TtlPolicy};
use dotfwd::engine::{Engine, Resolver};
use dotfwd::pool::{Pool, TlsDialer};
use dotfwd::refresh;

fn init_logging(config: &Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if config.verbose { "debug" } else { "info" })
    });

    match &config.log_path {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().context("--log-path must name a file")?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

fn load_config() -> Result<Config> {
    let cli = Cli::parse();
    let cli = match &cli.config_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading --config-file {path}"))?;
            let overrides: FileOverrides =
                toml::from_str(&text).with_context(|| format!("parsing --config-file {path}"))?;
            dotfwd::config::apply_file_overrides(cli, overrides)
        }
        None => cli,
    };
    Config::from_cli(cli).context("invalid configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config)?;

    info!(listen = %config.listen, upstreams = config.upstreams.len(), "starting dotfwd");

    let (clock, clock_ticker) = CoarseClock::spawn(Duration::from_secs(1));

    let policy = TtlPolicy {
        min_ttl: config.min_ttl,
        ..TtlPolicy::default()
    };
    let cache = Arc::new(
        DnsCache::new(config.cache_cap, config.evict_metrics_ring, policy, clock)
            .context("constructing cache")?,
    );

    // Each pool owns its own `TlsDialer` (stateless beyond a shared root
    // store) rather than a handle to one shared instance, so a slow dial on
    // one upstream never contends a lock with another's.
    let pools: Vec<_> = config
        .upstreams
        .iter()
        .map(|upstream| Arc::new(Pool::new(upstream.clone(), TlsDialer::new(), config.pool_size)))
        .collect();

    let resolver = Arc::new(Resolver::new(pools.clone(), cache.clone(), config.engine));

    let (refresh_handle, refresh_task) = {
        let resolver = resolver.clone();
        refresh::spawn(pools.len().max(1), move |query| {
            let resolver = resolver.clone();
            async move {
                resolver.forward_and_cache(&query).await;
            }
        })
    };

    let engine = Arc::new(Engine::new(resolver, cache.clone(), Some(refresh_handle)));

    let shutdown = CancellationToken::new();

    let debug_task = config.debug_port.map(|port| {
        let cache = cache.clone();
        let started_at = Instant::now();
        tokio::spawn(async move {
            dotfwd::debug_server::serve(port, cache, started_at).await;
        })
    });

    let listener_task = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        let addr = config.listen;
        tokio::spawn(async move { dotfwd::listener::serve(addr, engine, shutdown).await })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");

    shutdown.cancel();
    let _ = listener_task.await;

    for pool in &pools {
        pool.shutdown().await;
    }
    refresh_task.abort();
    clock_ticker.abort();
    if let Some(task) = debug_task {
        task.abort();
    }

    info!("dotfwd shut down cleanly");
    Ok(())
}
