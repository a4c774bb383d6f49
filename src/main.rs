use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratekit::config::{Algorithm, LimiterSpec, Mode, RatekitConfig, StoreConfig};
use ratekit::{store, Limiter, RateLimiter};

/// Drive a rate limiter with a burst of calls and report each decision.
#[derive(Parser, Debug)]
#[command(name = "ratekit", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(long, requires = "limiter")]
    config: Option<PathBuf>,

    /// Limiter to select from the configuration file
    #[arg(long)]
    limiter: Option<String>,

    /// Algorithm for an inline limiter
    #[arg(long, value_enum, default_value = "fixed-period", conflicts_with = "config")]
    algorithm: AlgorithmArg,

    /// Units permitted per window
    #[arg(long, default_value_t = 5, conflicts_with = "config")]
    rate: u64,

    /// Window length in milliseconds
    #[arg(long, default_value_t = 1_000, conflicts_with = "config")]
    duration_ms: u64,

    /// Sub-window count for the sliding window
    #[arg(long, default_value_t = 10, conflicts_with = "config")]
    size: u32,

    /// Keep state in the store instead of in process
    #[arg(long, conflicts_with = "config")]
    shared: bool,

    /// Store key for a shared inline limiter
    #[arg(long, conflicts_with = "config")]
    key: Option<String>,

    /// Number of calls to issue
    #[arg(long, default_value_t = 10)]
    calls: u32,

    /// Pause between calls in milliseconds
    #[arg(long, default_value_t = 0)]
    spacing_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum AlgorithmArg {
    FixedPeriod,
    LeakyBucket,
    SlidingWindow,
    TokenBucket,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::FixedPeriod => Algorithm::FixedPeriod,
            AlgorithmArg::LeakyBucket => Algorithm::LeakyBucket,
            AlgorithmArg::SlidingWindow => Algorithm::SlidingWindow,
            AlgorithmArg::TokenBucket => Algorithm::TokenBucket,
        }
    }
}

#[derive(Serialize)]
struct Attempt<'a> {
    limiter: &'a str,
    call: u32,
    elapsed_ms: u128,
    allowed: bool,
}

#[derive(Serialize)]
struct Summary<'a> {
    limiter: &'a str,
    algorithm: Algorithm,
    mode: Mode,
    calls: u32,
    allowed: u32,
    denied: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Decisions go to stdout, logs to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let (spec, store_config) = resolve(&args)?;
    let store = store::connect(&store_config)
        .await
        .context("failed to open the store")?;
    let limiter = RateLimiter::from_spec(&spec, Some(store))
        .await
        .with_context(|| format!("failed to build limiter '{}'", spec.name))?;
    info!(
        name = %spec.name,
        algorithm = %spec.algorithm,
        mode = ?spec.mode,
        "Limiter ready"
    );

    let started = Instant::now();
    let mut allowed = 0;
    for call in 1..=args.calls {
        if call > 1 && args.spacing_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.spacing_ms)).await;
        }

        let decision = limiter.allow().await?;
        if decision {
            allowed += 1;
        }
        print_line(&Attempt {
            limiter: &spec.name,
            call,
            elapsed_ms: started.elapsed().as_millis(),
            allowed: decision,
        })?;
    }

    print_line(&Summary {
        limiter: &spec.name,
        algorithm: limiter.algorithm(),
        mode: limiter.mode(),
        calls: args.calls,
        allowed,
        denied: args.calls - allowed,
    })?;
    Ok(())
}

/// Pick the limiter spec and store from the file or the inline flags.
fn resolve(args: &Args) -> anyhow::Result<(LimiterSpec, StoreConfig)> {
    if let Some(path) = &args.config {
        let config = RatekitConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        let name = args.limiter.as_deref().unwrap_or_default();
        let spec = config
            .limiter(name)
            .cloned()
            .with_context(|| format!("no limiter named '{}' in {}", name, path.display()))?;
        return Ok((spec, config.store));
    }

    let algorithm = Algorithm::from(args.algorithm);
    let spec = LimiterSpec {
        name: args
            .limiter
            .clone()
            .unwrap_or_else(|| algorithm.to_string()),
        algorithm,
        mode: if args.shared { Mode::Shared } else { Mode::Local },
        rate: args.rate,
        duration_ms: args.duration_ms,
        size: Some(args.size),
        key: args.key.clone(),
    };
    Ok((spec, StoreConfig::default()))
}

fn print_line<T: Serialize>(line: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(line)?);
    Ok(())
}
