//! `task-runner`: orchestrated multi-agent task runner CLI.

use clap::Parser;
use task_runner::cli::{execute, Cli};

#[allow(clippy::print_stdout)]
#[allow(clippy::print_stderr)]
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            std::process::exit(2);
        }
    };

    let outcome = runtime.block_on(execute(&cli));
    match outcome {
        Ok(outcome) => {
            println!("{}", outcome.output);
            std::process::exit(outcome.exit_code);
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    }
}
