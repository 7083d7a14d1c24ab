/*
 * Copyright 2025 Carver Automation Corporation.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use serviceradar_poller::clock::shared_system_clock;
use serviceradar_poller::lifecycle::Lifecycle;
use serviceradar_poller::models::PollerConfig;
use serviceradar_poller::{build_runtime, PollerRuntime};
use std::path::PathBuf;

/// ServiceRadar poller: dials agents, runs the two-phase check cycle, and
/// reports enriched statuses to core.
#[derive(Parser, Debug)]
#[command(name = "serviceradar-poller", version, author)]
struct Cli {
    /// Path to the poller's JSON configuration file.
    #[arg(short, long, env = "SERVICERADAR_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    let cli = Cli::parse();

    info!("loading configuration from {:?}", cli.config);
    let config = PollerConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;

    info!(
        "poller_id={} partition={} agents={}",
        config.poller_id,
        config.partition,
        config.agents.len()
    );

    let clock = shared_system_clock();
    let PollerRuntime { ctx, agents, pool, core_channel } = build_runtime(&config, clock.clone())
        .await
        .context("failed to build poller runtime")?;

    let lifecycle = Lifecycle::new(pool);
    lifecycle
        .start(clock, config.poll_interval(), agents, ctx, core_channel)
        .await;

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping poller");
    lifecycle.stop().await;

    Ok(())
}