//! tagrelay – relay daemon and store seeding tool.
//
//  $ tagrelay run --config tagrelay.toml
//  $ tagrelay seed
use std::process;

use clap::{Parser, Subcommand};
use tagrelay::config::Config;
use tagrelay::daemon;
use tagrelay::logging::init_logging;

#[derive(Debug, Parser)]
#[command(name = "tagrelay", version, about = "RFID tag lookup relay")]
struct Cli {
    /// Path to config TOML (env TAGRELAY_CONFIG is used when omitted)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Consume tag reads and relay lookups until interrupted (default).
    Run,
    /// Insert the sample records into the store and exit.
    Seed,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config: Config = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[FATAL] Failed to load config: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("[WARN] Logging not initialised: {e}");
    }

    let outcome = match cli.cmd.unwrap_or(Command::Run) {
        Command::Run => daemon::run(config).await.map(|_| ()),
        Command::Seed => daemon::seed(&config).map(|_| ()),
    };

    if let Err(e) = outcome {
        eprintln!("[FATAL] {e:#}");
        process::exit(1);
    }
}
