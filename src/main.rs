mod cli;
mod engine;
mod error;
mod export;
mod logging;
mod metrics;
mod model;
mod orchestrator;
mod sync;
mod text_summary;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.is_silent();
    logging::init(&args.log_level, is_silent);

    match cli::run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if is_silent {
                println!("{}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
