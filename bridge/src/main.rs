use std::env;
use std::process::ExitCode;

use bridge_core::Settings;
use tracing::{error, info};

mod setup_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    setup_tracing::register();

    let settings = match Settings::load(env::vars()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(?e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match bridge_core::run(settings).await {
        Ok(()) => {
            info!("Exiting...");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}
