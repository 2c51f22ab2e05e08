use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    ChatClient, ClientConfig, ClientDependencies, ClientHandle, Credentials, HttpTokenProvider,
    Token,
};
use shared::{
    domain::{ChannelId, UserId},
    protocol::OutboundIntent,
};
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: i64,
    /// Skips the token endpoint and connects with this token.
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    channel: Option<i64>,
    #[arg(long)]
    send: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        config.server_url = server_url;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    config.validate()?;

    let storage = Storage::new(&config.database_url).await.map_err(|error| {
        error!(
            database_url = %config.database_url,
            %error,
            "failed to open SQLite database"
        );
        error
    })?;
    let deps = ClientDependencies::new(Arc::new(storage))
        .with_tokens(Arc::new(HttpTokenProvider::new(config.server_url.clone())));
    let user_id = UserId(args.user_id);
    let client = ChatClient::start(config, user_id, deps).await?;

    if let Some(channel) = args.channel {
        client.watch_channel(ChannelId(channel));
    }
    let mut events = client.subscribe_events();
    let mut failures = client.subscribe_failures();

    let outcome = match args.token {
        Some(token) => {
            client
                .connect_with(Credentials::new(user_id, Token::new(token)))
                .await?
        }
        None => client.connect().await?,
    };
    info!(?outcome, "connect requested");

    if let Some(text) = args.send {
        let channel = args
            .channel
            .context("--send needs --channel to pick the destination")?;
        let ack = client
            .enqueue_mutation(OutboundIntent::SendMessage {
                channel_id: ChannelId(channel),
                text,
            })
            .await?;
        println!("queued message key={}", ack.idempotency_key);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(envelope) => println!("{}", serde_json::to_string(&envelope)?),
                Err(RecvError::Lagged(missed)) => warn!(missed, "dropped events"),
                Err(RecvError::Closed) => break,
            },
            failure = failures.recv() => match failure {
                Ok(failure) => println!(
                    "mutation {} failed: {}",
                    failure.idempotency_key, failure.reason
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "dropped failure reports"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let state = client.disconnect().await;
    info!(?state, "disconnected");
    client.shutdown().await;
    Ok(())
}
