//! netsieve-host: request filtering over stdin/stdout
//!
//! Loads rules, then answers one JSON verdict line on stdout for every
//! JSON request line on stdin. Logs go to stderr.
//!
//! Usage: `netsieve-host [config.toml]`

mod config;
mod ingest;
mod reload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use netsieve::{ChannelSink, DecisionEngine, EventSink, RuleStore, TracingSink};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::HostConfig;
use crate::reload::RuleSources;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout is reserved for verdicts
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = HostConfig::load(config_path.as_deref())?;

    info!("netsieve-host starting...");

    let sources = Arc::new(RuleSources::from_config(&config.rules));
    let store = Arc::new(RuleStore::new());
    let baseline = sources.modified();
    let config_quiet = reload::reload(&store, &sources).context("initial rule load")?;

    // Match events are drained off the request path
    let (sink, events) = ChannelSink::bounded(config.events.channel_capacity.max(1));
    let sink = Arc::new(sink);
    // Quiet patterns from filter configs are read once, at startup
    let mut quiet_patterns = config.events.quiet_patterns.clone();
    quiet_patterns.extend(config_quiet);
    let logger = TracingSink::with_quiet_patterns(&quiet_patterns).context("invalid quiet pattern")?;
    std::thread::Builder::new()
        .name("netsieve-events".to_string())
        .spawn(move || {
            for event in events.iter() {
                logger.on_match(&event);
            }
        })
        .context("spawning event thread")?;

    let engine = DecisionEngine::new(Arc::clone(&store))
        .with_sink(sink.clone())
        .with_policy(config.policy);

    if config.rules.reload_interval_ms > 0 {
        let period = Duration::from_millis(config.rules.reload_interval_ms);
        tokio::spawn(reload::watch(Arc::clone(&store), Arc::clone(&sources), baseline, period));
        info!("Watching rule sources every {:?}", period);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if let Some(out) = ingest::process_line(&engine, &line) {
            stdout.write_all(format!("{}\n", out).as_bytes()).await?;
            stdout.flush().await?;
        }
    }

    let stats = engine.stats();
    info!(
        "netsieve-host shutting down: {} requests ({} blocked, {} redirected), avg check {}ns, {} events dropped",
        stats.total_requests,
        stats.blocked_requests,
        stats.redirected_requests,
        stats.avg_check_time_ns(),
        sink.dropped()
    );
    Ok(())
}
