use clap::Parser;
use std::process::ExitCode;
use upylink_app::cli::{self, Cli};
use upylink_app::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!("{}", e);
            eprintln!("upyfs: {}", e.message);
            ExitCode::FAILURE
        }
    }
}
