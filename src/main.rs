//! Montaje CLI — declarative distributed test environments.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "montaje",
    version,
    about = "Rust-native distributed test environments — declarative scripts, typed instruction plans, deterministic run traces"
)]
struct Cli {
    #[command(subcommand)]
    command: montaje::cli::Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = montaje::cli::dispatch(cli.command).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
