use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stitchgate::{
    Config, Environment, GatewayBuilder, GitHubClient, RetryPolicy, SchemaRegistry,
    TypeMapGatewayBuilder, config::ENV_VAR,
};

#[derive(Parser, Debug)]
#[command(name = "stitchgate", version, about = "Git-backed schema registry for stitched GraphQL gateways")]
struct Cli {
    /// Path to the registry configuration file.
    #[arg(long, short, default_value = "./stitchgate.yaml")]
    config: PathBuf,

    /// Deployment environment; overrides the config file.
    #[arg(long, env = ENV_VAR)]
    env: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one load cycle and print the services and type map.
    Load,
    /// Print the OID of the published registry tree.
    Version,
    /// Publish the live services as a release candidate.
    Release {
        name: String,
        #[arg(long, short)]
        message: Option<String>,
    },
    /// Load, then keep reloading until interrupted.
    Watch {
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(env) = cli.env {
        config.env = Environment::new(env);
    }
    info!(env = %config.env, endpoints = config.endpoints.len(), "configuration loaded");

    let client = Arc::new(GitHubClient::new(&config.github, Config::github_token()));
    let registry = SchemaRegistry::new(&config, client, TypeMapGatewayBuilder::new());

    match cli.command {
        Command::Load => {
            let schema = registry.load().await?;
            println!("{}", serde_json::to_string_pretty(&json!({
                "services": registry.services().await,
                "types": schema.type_to_service_map,
                "version": registry.registry_version().await,
            }))?);
        }
        Command::Version => {
            println!("{}", registry.get_registry_version().await?);
        }
        Command::Release { name, message } => {
            // Candidates are cut from the live services, also in production.
            let registry = registry.with_probe_policy(RetryPolicy::STARTUP);
            registry
                .load_live()
                .await
                .context("Failed to load services for the release")?;
            let release = registry
                .create_or_update_release(&name, message.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&release)?);
        }
        Command::Watch { interval_ms } => {
            let registry = registry.with_probe_policy(RetryPolicy::STARTUP);
            registry.load().await.context("Initial schema load failed")?;
            let registry = into_refreshing(registry);

            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.refresh_interval());
            registry.auto_refresh(interval);
            info!(interval_ms = interval.as_millis() as u64, "watching registry");

            tokio::signal::ctrl_c().await?;
            registry.stop_auto_refresh();
            info!("stopped");
        }
    }

    Ok(())
}

/// `RUST_LOG` when set, otherwise info for this crate.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stitchgate=info"))
}

/// Shares a registry with its refresh task; reloads probe with the short
/// refresh policy once startup is over.
fn into_refreshing<B>(registry: SchemaRegistry<B>) -> Arc<SchemaRegistry<B>>
where
    B: GatewayBuilder + Send + Sync + 'static,
{
    Arc::new(registry.with_probe_policy(RetryPolicy::REFRESH))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn rust_log_replaces_the_default_filter() {
        // SAFETY: serialized with the other env-mutating tests.
        unsafe { std::env::set_var("RUST_LOG", "stitchgate=debug,reqwest=trace") };
        let custom = env_filter().to_string();
        unsafe { std::env::remove_var("RUST_LOG") };
        let default = env_filter().to_string();

        assert!(custom.contains("stitchgate=debug"), "{custom}");
        assert!(!custom.contains("stitchgate=info"), "{custom}");
        assert_eq!(default, "stitchgate=info");
    }

    #[test]
    fn watcher_reloads_with_refresh_policy() {
        let config = Config::from_yaml(include_str!("../stitchgate.yaml")).unwrap();
        let client = Arc::new(GitHubClient::new(&config.github, None));
        let registry = SchemaRegistry::new(&config, client, TypeMapGatewayBuilder::new())
            .with_probe_policy(RetryPolicy::STARTUP);

        let registry = into_refreshing(registry);

        assert_eq!(registry.probe_policy(), RetryPolicy::REFRESH);
    }
}
