//! Threadline CLI binary entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use threadline::cli::{Cli, Commands, ThreadCommands};
use threadline::config::ThreadlineConfig;

const LOG_ENV: &str = "THREADLINE_LOG";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> threadline::error::Result<()> {
    let config = match &cli.config {
        Some(path) => ThreadlineConfig::load(path)?,
        None => ThreadlineConfig::from_env()?,
    };
    let store = threadline::store::open(&config.store).await?;
    let mut stdout = std::io::stdout().lock();

    match cli.command {
        Commands::Threads(args) => match args.command {
            ThreadCommands::List(list) => {
                threadline::cli::threads::handle_list(
                    store.as_ref(),
                    list.limit,
                    list.offset,
                    &mut stdout,
                )
                .await
            }
            ThreadCommands::Show(show) => {
                threadline::cli::threads::handle_show(
                    store.as_ref(),
                    &show.thread_id,
                    show.json,
                    &mut stdout,
                )
                .await
            }
            ThreadCommands::Delete(delete) => {
                threadline::cli::threads::handle_delete(store.as_ref(), &delete.thread_id, &mut stdout)
                    .await
            }
        },
    }
}
