//! neonform CLI for declarative infrastructure for Neon Postgres.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "neonform",
    version,
    about = "Declarative Neon Postgres infrastructure with dependency-ordered, idempotent, BLAKE3-hashed state"
)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: neonform::cli::Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "neonform=debug" } else { "neonform=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = neonform::cli::dispatch(cli.command).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
