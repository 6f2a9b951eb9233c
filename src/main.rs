use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::cache::{CacheBackend, MemoryCache};
use gatekeeper::throttle::{Limits, Throttle};
use gatekeeper::ThrottleSettings;

/// Run a burst of calls through a throttle and report the observed drift.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Rate limit in calls per second. Repeat to stack several limits.
    #[arg(short, long = "rate", required = true)]
    rates: Vec<f64>,

    /// Number of measured calls after the first one
    #[arg(short, long, default_value_t = 5)]
    count: u32,

    /// Give up on a call after this many seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Drop denied calls instead of waiting
    #[arg(long)]
    no_retry: bool,

    /// Settings file (YAML or TOML), overridable with THROTTLE__* variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Share buckets through this Redis server instead of process memory
    #[cfg(feature = "redis")]
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let settings = ThrottleSettings::load(cli.config.as_deref())?;
    info!(enabled = settings.enabled, logging = settings.logging, "Settings loaded");

    let cache = connect(&cli).await?;

    let limits = match cli.rates.as_slice() {
        [rate] => Limits::Single(*rate),
        rates => Limits::from(rates),
    };
    let governing = governing_rate(&cli.rates);

    let mut builder = Throttle::<()>::builder(limits)
        .cache(cache)
        .retry(!cli.no_retry)
        .settings(settings);
    if let Some(timeout) = cli.timeout {
        builder = builder.timeout(Duration::try_from_secs_f64(timeout)?);
    }

    let call = builder.build()?.wrap_with_marker(
        "demo",
        |_: ()| async { true },
        false,
    );

    // the first call only primes the bucket
    call.call(()).await?;

    let start = Instant::now();
    let mut permitted = 0u32;
    for _ in 0..cli.count {
        if call.call(()).await? {
            permitted += 1;
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    if cli.no_retry {
        info!(permitted = permitted, dropped = cli.count - permitted, "Burst finished");
        return Ok(());
    }

    let expected = cli.count as f64 / governing;
    let drift = if expected > 0.0 {
        (elapsed - expected) / expected
    } else {
        0.0
    };
    info!(
        calls = cli.count,
        expected_secs = expected,
        elapsed_secs = elapsed,
        drift_pct = drift * 100.0,
        "Burst finished"
    );
    if drift.abs() > 0.1 {
        warn!("Observed rate drifted more than 10% from the configured rate");
    }

    Ok(())
}

/// The rate that paces the burst. Every demo limit shares the static key, and
/// a key is only checked against its first-listed limit.
fn governing_rate(rates: &[f64]) -> f64 {
    rates.first().copied().unwrap_or(f64::INFINITY)
}

#[cfg(feature = "redis")]
async fn connect(cli: &Cli) -> anyhow::Result<Arc<dyn CacheBackend>> {
    if let Some(url) = &cli.redis_url {
        let cache = gatekeeper::cache::RedisCache::new(url).await?;
        cache.ping().await?;
        info!(url = %url, "Connected to Redis");
        return Ok(Arc::new(cache));
    }
    Ok(Arc::new(MemoryCache::new()))
}

#[cfg(not(feature = "redis"))]
async fn connect(_cli: &Cli) -> anyhow::Result<Arc<dyn CacheBackend>> {
    Ok(Arc::new(MemoryCache::new()))
}
