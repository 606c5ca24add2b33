// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A single-process orchestrator driving simulated hosts and services.
//!
//! Requests are read from stdin one JSON object per line; replies are written
//! to stdout in the same form. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use corral::coordinator::spawn_maintenance;
use corral::sim::SimServices;
use corral::Coordinator;
use slog::{error, info, o, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

mod commands;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Instance orchestration against simulated compute hosts
struct Args {
    /// Path to the orchestrator configuration file.
    #[clap(value_name = "CONFIG", action)]
    config: PathBuf,

    /// Images to make available to builds, by name.
    #[clap(long = "image", action)]
    images: Vec<String>,

    #[clap(
        long,
        env = "CORRAL_LOG_LEVEL",
        default_value_t = slog::Level::Info,
        value_parser = parse_log_level
    )]
    log_level: slog::Level,
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    // stdout carries replies, so logs always go to stderr.
    let main_drain = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("corral-standalone", std::io::stderr())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let (dtrace_drain, probe_reg) = slog_dtrace::Dtrace::new();

    let filtered_main = slog::LevelFilter::new(main_drain, level);

    let log = slog::Logger::root(
        slog::Duplicate::new(filtered_main.fuse(), dtrace_drain.fuse()).fuse(),
        o!(),
    );

    if let slog_dtrace::ProbeRegistration::Failed(err) = probe_reg {
        error!(&log, "Error registering slog-dtrace probes: {:?}", err);
    }

    log
}

/// Stands in for the host agents' periodic check-ins, so that every
/// simulated host stays up.
fn spawn_heartbeats(
    coordinator: Arc<Coordinator>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let inventory = coordinator.inventory();
            for host in inventory.hosts() {
                // The host may have been removed since the listing.
                let _ = inventory.record_heartbeat(host.id);
            }
        }
    })
}

async fn serve(
    coordinator: Arc<Coordinator>,
    log: slog::Logger,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading requests")?,
            _ = tokio::signal::ctrl_c() => {
                info!(log, "interrupted, shutting down");
                return Ok(());
            }
        };
        let Some(line) = line else {
            info!(log, "end of input, shutting down");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<commands::Envelope>(&line) {
            Ok(envelope) => commands::handle(&coordinator, envelope).await,
            Err(e) => {
                warn!(log, "malformed request"; "error" => %e);
                serde_json::json!({
                    "error": { "kind": "validation", "detail": e.to_string() }
                })
            }
        };
        let mut out = serde_json::to_vec(&reply).context("encoding reply")?;
        out.push(b'\n');
        stdout.write_all(&out).await.context("writing reply")?;
        stdout.flush().await.context("writing reply")?;
    }
}

fn main() -> anyhow::Result<()> {
    let Args { config, images, log_level } = Args::parse();

    let log = build_logger(log_level);
    let config = corral_config::parse(&config)
        .with_context(|| format!("loading {}", config.display()))?;

    let rt =
        tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    rt.block_on(async move {
        let sim = SimServices::new(log.new(o!("component" => "sim")));
        for name in &images {
            let id = sim.add_image(name);
            info!(log, "registered image"; "name" => name, "id" => %id);
        }

        let coordinator = Arc::new(
            Coordinator::new(&config, sim.services(), log.clone())
                .context("setting up the coordinator")?,
        );
        info!(log, "corral starting";
              "version" => corral::version(),
              "hosts" => coordinator.inventory().hosts().len());

        let report = coordinator.recover_interrupted_tasks().await;
        info!(log, "recovery finished";
              "rolled_back" => report.rolled_back.len(),
              "completed" => report.completed.len(),
              "failed" => report.failed.len(),
              "awaiting_confirmation" => report.awaiting_confirmation.len());

        let period = (config.inventory.service_down_time() / 3)
            .max(Duration::from_secs(1));
        let heartbeats = spawn_heartbeats(coordinator.clone(), period);
        let maintenance = spawn_maintenance(coordinator.clone());

        let result = serve(coordinator, log.clone()).await;
        heartbeats.abort();
        maintenance.abort();
        result
    })
}
