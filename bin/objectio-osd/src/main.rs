//! ObjectIO OSD - Object Storage Daemon
//!
//! This binary hosts the configured pools, wires up their cache tiers and
//! runs a tier agent for every placement group that needs one.

use anyhow::{Context, Result};
use clap::Parser;
use objectio_common::Config;
use objectio_tier::Cluster;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "objectio-osd")]
#[command(about = "ObjectIO Object Storage Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/objectio/osd.toml")]
    config: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable the tier agents regardless of the configuration file
    #[arg(long)]
    no_agents: bool,

    /// Seconds between pool statistics reports (0 disables them)
    #[arg(long, default_value = "60")]
    report_interval: u64,
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let config: Config = toml::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    Ok(config)
}

async fn build_cluster(config: &Config) -> Result<Cluster> {
    let cluster = Cluster::builder().agent_config(config.agent.clone()).build();

    for pool in &config.pools {
        cluster
            .create_pool(pool)
            .await
            .with_context(|| format!("creating pool {}", pool.name))?;
    }
    for tier in &config.tiers {
        cluster.tier_add(&tier.base, &tier.cache).await?;
        cluster.tier_cache_mode(&tier.cache, tier.mode).await?;
        if tier.overlay {
            cluster.tier_set_overlay(&tier.base, &tier.cache).await?;
        }
        info!(
            "tier {} -> {} ready (mode {:?}, overlay {})",
            tier.cache, tier.base, tier.mode, tier.overlay
        );
    }
    Ok(cluster)
}

/// Periodically log usage and tier counters of every pool
async fn report_loop(cluster: Cluster, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;
        let map = cluster.osdmap();
        for pool in map.pools() {
            let usage = cluster.pool_usage(pool.id);
            let counters = cluster.pool_counters(pool.id);
            info!(
                "pool {}: {} objects, {} bytes, {} dirty, {} promoted, {} flushed, {} evicted",
                pool.name,
                usage.objects,
                usage.bytes,
                counters.dirty,
                counters.promotions,
                counters.flushes,
                counters.evictions
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: {e:#}, using defaults");
            Config::default()
        }
    };
    if args.no_agents {
        config.agent.enabled = false;
    }
    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ObjectIO OSD {}", config.node.name);
    info!("Config file: {}", args.config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    let cluster = match build_cluster(&config).await {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("Failed to set up pools: {e:#}");
            std::process::exit(1);
        }
    };
    info!(
        "Hosting {} pools at osdmap epoch {}",
        config.pools.len(),
        cluster.osdmap().epoch()
    );

    let agents = cluster.start_agents();
    let reporter = (args.report_interval > 0).then(|| {
        tokio::spawn(report_loop(
            cluster.clone(),
            Duration::from_secs(args.report_interval),
        ))
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    for status in agents.statuses() {
        info!(
            "pg {}: {} passes, flush {}, evict {}",
            status.pgid, status.passes, status.flush_mode, status.evict_mode
        );
    }
    agents.shutdown().await;
    Ok(())
}
