mod auth;
mod config;
mod error;
mod processor;
mod service;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::fmt::time::FormatTime;

use crate::error::FeedResult;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

/// Market data feed: logs in, subscribes to the hub, and logs what arrives.
#[derive(Parser)]
#[command(name = "datafeed", version)]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, short, env = "DATAFEED_CONFIG", default_value = "config.yaml")]
    config: PathBuf,
    /// Login user (overrides config)
    #[arg(long, env = "DATAFEED_USERNAME")]
    username: Option<String>,
    /// Login password (overrides config)
    #[arg(long, env = "DATAFEED_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> FeedResult<()> {
    let credentials = config::Credentials {
        username: cli.username,
        password: cli.password,
    };
    let feed_config = config::load(&cli.config, credentials).await?;
    tracing::info!(config = %cli.config.display(), "starting datafeed");
    service::run(feed_config).await
}
