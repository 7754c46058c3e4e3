use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use avenues::config::Config;
use clap::Parser;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Report errors and transactions to a local sentry sink.
    #[arg(long)]
    sentry: bool,

    /// Emit JSON logs into the void, to include the cost of tracing.
    #[arg(long)]
    tracing: bool,

    /// Report metrics to a local statsd sink, unless the config names a statsd server.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    let logging = logging::Config {
        backtraces: config.logging.enable_backtraces,
        sentry: cli.sentry,
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: The runtime has not been started yet, so this is still single-threaded.
    let mut guard = unsafe { logging::init(&config, logging) }?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    if let Some(http_sink) = guard.http_sink.take() {
        runtime.spawn(http_sink);
    }
    if let Some(udp_sink) = guard.udp_sink.take() {
        runtime.spawn(udp_sink);
    }

    runtime.block_on(perform_stresstest(config, workloads, cli.duration))
}
