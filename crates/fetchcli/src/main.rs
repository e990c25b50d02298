//! Fetches a list of URLs through a fetch coordinator and reports what happened.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use futures::future;
use url::Url;

use fetchcoord_service::config::Config;
use fetchcoord_service::coordinator::Coordinator;
use fetchcoord_service::decode::RawDecoder;
use fetchcoord_service::logging;
use fetchcoord_service::metrics;
use fetchcoord_service::transport::HttpTransport;

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// How often to request the whole list of URLs.
    ///
    /// All URLs of one round are requested concurrently, rounds run one after the other.
    #[arg(long, short, default_value_t = 1)]
    repeat: usize,

    /// Overrides the in-memory cache capacity from the configuration, in bytes.
    #[arg(long, value_name = "BYTES")]
    capacity: Option<u64>,

    /// Drop all cached objects between rounds.
    #[arg(long)]
    clear_between: bool,

    /// The URLs to fetch.
    #[arg(required = true)]
    urls: Vec<Url>,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(capacity) = cli.capacity {
        config.in_memory_capacity = capacity;
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: we did not spawn any threads yet
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("fetchcli")
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(config, cli))
}

async fn run(config: Config, cli: Cli) -> Result<()> {
    let transport = HttpTransport::new(&config).context("failed to create HTTP client")?;
    let coordinator = Coordinator::new(transport, RawDecoder, &config);

    let mut failures = 0;
    for round in 1..=cli.repeat {
        if round > 1 && cli.clear_between {
            coordinator.cache().clear();
        }

        let requests = cli.urls.iter().map(|url| {
            let coordinator = &coordinator;
            async move {
                let start = Instant::now();
                let result = coordinator.get(url.clone()).await;
                (url, result, start.elapsed())
            }
        });

        println!("round {round}:");
        for (url, result, elapsed) in future::join_all(requests).await {
            match result {
                Ok(bytes) => println!("  {url}: {} bytes in {}", bytes.len(), ms(elapsed)),
                Err(error) => {
                    failures += 1;
                    println!("  {url}: {error} after {}", ms(elapsed));
                }
            }
        }
    }

    let cache = coordinator.cache();
    println!(
        "cache: {} objects, {} of {} bytes",
        cache.entry_count(),
        cache.weighted_size(),
        cache.capacity()
    );

    if failures > 0 {
        anyhow::bail!("{failures} requests failed");
    }
    Ok(())
}

fn ms(duration: Duration) -> String {
    format!("{:.1}ms", duration.as_secs_f64() * 1000.0)
}
