use clap::Parser;
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use deployments::DeploymentEnv;
use escrow_core::{
    Address,
    EscrowConfig,
};
use std::{
    fs,
    path::PathBuf,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};
use url::Url;

mod client;
mod gateway_client;
mod ui;

const LOG_FILE: &str = "escrow-tui.log";

/// Terminal client for milestone escrow contracts.
#[derive(Debug, Parser)]
#[command(name = "escrow-tui", version)]
struct Cli {
    /// Network to use: polygon, amoy or local. Sets the wallet's target chain.
    #[arg(long, default_value = "polygon")]
    network: DeploymentEnv,

    /// Wallet/contract gateway endpoint
    #[arg(long, default_value = client::DEFAULT_GATEWAY_URL)]
    gateway_url: Url,

    /// Escrow to manage; defaults to the last one recorded for the network
    #[arg(long)]
    contract: Option<Address>,

    /// JSON file overriding token, fee and polling settings
    #[arg(long)]
    config: Option<String>,

    /// Directory for the daily log files
    #[arg(long, default_value = "logs")]
    log_dir: String,

    /// Start on the create screen
    #[arg(long)]
    create: bool,
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn load_escrow_config(path: Option<&str>, network: DeploymentEnv) -> Result<EscrowConfig> {
    let mut config = match path {
        None => EscrowConfig::default(),
        Some(path) => {
            let path = expand_path(path);
            let bytes = fs::read(&path)
                .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_slice(&bytes)
                .wrap_err_with(|| format!("invalid config {}", path.display()))?
        }
    };
    config.target_chain_id = network.chain_id();
    config.validate().wrap_err("invalid escrow config")?;
    Ok(config)
}

fn init_tracing(log_dir: &str) -> Result<WorkerGuard> {
    let appender = rolling::daily(expand_path(log_dir), LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!(e))?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli.log_dir)?;
    tracing::info!(network = %cli.network, gateway = %cli.gateway_url, "starting escrow client");

    let app_config = client::AppConfig {
        network: cli.network,
        gateway_url: cli.gateway_url,
        contract: cli.contract,
        escrow: load_escrow_config(cli.config.as_deref(), cli.network)?,
        start_in_create: cli.create,
    };
    client::run_app(app_config).await
}
