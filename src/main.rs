use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use webtty::{CommandSpec, Config, Server, demo};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Serve a terminal program to the browser.",
    after_help = "Without a command the built-in counter demo is served."
)]
struct Args {
    #[command(flatten)]
    config: Config,

    /// Working directory for the command
    #[arg(long, env = "WEBTTY_CWD")]
    cwd: Option<PathBuf>,

    /// Command to run for every connection, e.g. `webtty -- bash -l`
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr without colors; stdout stays free for the banner.
    let default_level = if args.config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let url = format!("http://{}:{}", args.config.public_host(), args.config.port);
    let server = match args.command.split_first() {
        Some((program, rest)) => {
            let mut spec = CommandSpec::new(program).args(rest);
            if let Some(cwd) = args.cwd {
                spec = spec.cwd(cwd);
            }
            info!(command = %args.command.join(" "), "Starting webtty command server");
            Server::with_command(args.config, spec)
        }
        None => {
            info!("Starting webtty demo server");
            Server::with_program(args.config, demo::handler())
        }
    };

    let shutdown = server.shutdown_token();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down");
        shutdown.cancel();
    })?;

    println!("webtty listening on {url}");
    server.run().await
}
