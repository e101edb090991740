use pullsub::cli::{commands, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    commands::init_tracing(&cli.log_level, &cli.log_format);

    // Execute the command
    commands::execute_command(cli.command).await?;

    Ok(())
}
