// Commands module
/// Simulate command implementation
pub mod simulate;

use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::cli::{output::*, Commands};
use crate::config::{LogFormat, SubscriberConfig};
use crate::metrics;

/// Initialize the global tracing subscriber
pub fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match parse_log_format(format) {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.compact().init(),
    }
}

fn parse_log_format(format: &str) -> LogFormat {
    match format.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// Load a configuration file, or build a default configuration for `subscription`
pub fn load_config(path: Option<&PathBuf>, subscription: &str) -> anyhow::Result<SubscriberConfig> {
    match path {
        Some(path) => SubscriberConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(SubscriberConfig::new(subscription)),
    }
}

/// Execute a CLI command
pub async fn execute_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Simulate(args) => simulate::execute(args).await,
        Commands::Config {
            config,
            subscription,
        } => execute_config(config, subscription),
        Commands::Metrics => {
            print!("{}", metrics::gather_metrics());
            Ok(())
        }
    }
}

fn execute_config(path: Option<PathBuf>, subscription: String) -> anyhow::Result<()> {
    let config = load_config(path.as_ref(), &subscription)?;
    config.validate().context("Invalid configuration")?;

    print_success("Configuration is valid");
    println!();
    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("json"), LogFormat::Json);
        assert_eq!(parse_log_format("Text"), LogFormat::Text);
        assert_eq!(parse_log_format("other"), LogFormat::Text);
    }

    #[test]
    fn test_load_config() {
        let config = load_config(None, "projects/p/subscriptions/sub").unwrap();
        assert_eq!(config.subscription, "projects/p/subscriptions/sub");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "subscription = \"projects/p/subscriptions/from-file\"").unwrap();
        let config = load_config(Some(&file.path().to_path_buf()), "ignored").unwrap();
        assert_eq!(config.subscription, "projects/p/subscriptions/from-file");

        assert!(load_config(Some(&PathBuf::from("/nonexistent/pullsub.toml")), "x").is_err());
    }
}
