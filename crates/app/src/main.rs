//! Duet - one-to-one chat
//!
//! `duet serve` runs the conversation host, `duet inbox` lists conversations
//! and `duet chat <peer>` opens a live conversation in the terminal.

use std::sync::Arc;

use clap::Parser;
use duet_core::{PeerId, Settings};
use duet_net::{ChatClient, ChatServer, ConversationApi};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod controller;
mod error;
mod terminal;
mod viewmodel;

use cli::{Args, Command};
use controller::SyncOptions;
use error::{AppError, Result};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut settings = Settings::load(args.config.as_deref())?;
    args.apply(&mut settings);

    match args.command {
        Command::Serve { .. } => serve(settings).await,
        Command::Inbox => {
            let client = connect(&settings).await?;
            let conversations = client.chat_list().await?;
            for line in viewmodel::render_inbox(&conversations) {
                println!("{}", line);
            }
            client.disconnect().await;
            Ok(())
        }
        Command::Chat { peer } => {
            let client = Arc::new(connect(&settings).await?);
            let options = SyncOptions::from_settings(&settings.sync);
            let result = terminal::run_chat(client.clone(), PeerId::new(peer), options).await;
            client.disconnect().await;
            result
        }
    }
}

async fn connect(settings: &Settings) -> Result<ChatClient> {
    let token = settings
        .client
        .token
        .as_deref()
        .ok_or(AppError::MissingToken)?;
    let client = ChatClient::connect(
        &settings.client.server_addr,
        token,
        settings.client.request_timeout(),
    )
    .await?;
    tracing::info!(user = %client.me().id, addr = %settings.client.server_addr, "Connected");
    Ok(client)
}

async fn serve(settings: Settings) -> Result<()> {
    if settings.server.users.is_empty() {
        tracing::warn!("No users configured; every connection will be rejected");
    }

    let server = ChatServer::start(settings.server.port, settings.server.users).await?;
    tracing::info!(addr = %server.addr(), "Serving conversations, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    server.shutdown();
    Ok(())
}
