use std::{io, process::ExitCode};

use anyhow::{Context, Result};
use tlspipe_common::Settings;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // stdout carries the echoed bytes, so diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let success = match run() {
        Ok(success) => success,
        Err(e) => {
            tracing::error!("{:#}", e);
            false
        }
    };

    println!("bye!");
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run() -> Result<bool> {
    let settings = Settings::from_env().context("Invalid configuration")?;
    tracing::debug!("Credentials directory: {:?}", settings.client.credentials.ca_path.parent());

    let report = tlspipe::run(&settings, io::stdin(), io::stdout())?;
    Ok(report.success())
}
