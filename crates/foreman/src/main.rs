//! Durable task supervisor for long-running agent workers.
//!
//! Thin entry point: initializes diagnostic logging, parses the CLI, and
//! hands off to `commands::run`. All real behavior lives in the library
//! crate so it can be exercised directly from integration tests.

use clap::Parser;
use foreman::cli::Cli;

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let exit_code = foreman::commands::run(cli);
    std::process::exit(exit_code.code());
}
