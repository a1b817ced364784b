#![allow(missing_docs)]

//! matrix-relay binary: run the Matrix channel or validate its configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use matrix_relay::channel::{Channel, ChannelOpts};
use matrix_relay::config::{data_dir, Config};
use matrix_relay::logging;
use matrix_relay::matrix::{MatrixChannel, MatrixClient};
use matrix_relay::types::NewMessage;

#[derive(Parser)]
#[command(name = "matrix-relay", version, about = "Matrix channel adapter for a chat-relay bot")]
struct Cli {
    /// Config file (default: $MATRIX_RELAY_CONFIG or ./config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the homeserver and relay traffic until Ctrl+C.
    Start {
        /// Directory for rotated JSON logs.
        #[arg(long)]
        logs_dir: Option<PathBuf>,
    },
    /// Validate configuration without contacting the homeserver.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Start { logs_dir } => run_start(config, logs_dir).await,
        Command::Check => run_check(&config),
    }
}

async fn run_start(config: Config, logs_dir: Option<PathBuf>) -> Result<()> {
    let logs_dir = match logs_dir.or_else(|| config.logging.dir.clone()) {
        Some(dir) => dir,
        None => data_dir()?.join("logs"),
    };
    let _guard = logging::init_production(&logs_dir, &config.logging.level)?;

    let homeserver = config.matrix.homeserver_url()?.to_owned();
    let client = MatrixClient::new(&homeserver, &config.matrix.device_name)
        .context("failed to build Matrix client")?
        .with_poll_timeout_ms(config.matrix.sync_poll_timeout_ms);

    let groups = config.registered_groups();
    let opts = ChannelOpts {
        on_message: Arc::new(|jid: &str, msg: NewMessage| {
            info!(
                jid,
                sender = %msg.sender_name,
                is_bot_message = msg.is_bot_message,
                content = %msg.content,
                "inbound message"
            );
        }),
        on_chat_metadata: Arc::new(|jid: &str, timestamp: &str, name: Option<&str>| {
            info!(jid, timestamp, name = name.unwrap_or(""), "chat activity");
        }),
        registered_groups: Arc::new(move || groups.clone()),
    };

    let channel = MatrixChannel::new(
        Arc::new(client),
        config.matrix.clone(),
        config.assistant.name.clone(),
        opts,
    );

    info!(homeserver = %homeserver, "matrix-relay starting");
    channel.connect().await.context("failed to connect to Matrix")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("shutdown requested");
    channel.disconnect().await;
    Ok(())
}

fn run_check(config: &Config) -> Result<()> {
    logging::init_cli(&config.logging.level);

    let homeserver = config.matrix.homeserver_url()?;
    let credentials = config.matrix.credentials()?;
    MatrixClient::new(homeserver, &config.matrix.device_name)
        .context("invalid homeserver URL")?;

    println!("homeserver:  {homeserver}");
    println!("credentials: {credentials:?}");
    println!("assistant:   {}", config.assistant.name);
    println!("groups:      {}", config.groups.len());
    for (jid, group) in &config.registered_groups() {
        let trigger = match (&group.trigger, group.requires_trigger) {
            (Some(trigger), true) => format!("trigger {trigger}"),
            (Some(trigger), false) => format!("trigger {trigger}, optional"),
            (None, _) => "no trigger".to_owned(),
        };
        println!("  {jid}  {} (folder {}, {trigger})", group.name, group.folder);
    }
    Ok(())
}
