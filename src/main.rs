use clap::Parser;

use jobguard::cli::{Cli, execute_command, init_logger_from_settings, load_and_merge_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = load_and_merge_config(&cli)?;
    init_logger_from_settings(&settings)?;

    if let Err(e) = execute_command(&cli, settings).await {
        tracing::error!(error = %e, "Command failed");
        if matches!(e, jobguard::error::AppError::Validation { .. }) {
            eprintln!("{}", Cli::get_validation_help());
        }
        return Err(e.into());
    }

    Ok(())
}
