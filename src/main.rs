//! Fleet Hub CLI - hub server and command-line clients.
//!
//! This is the main binary entry point. See the `fleet_hub` library for
//! the core functionality.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_hub::constants::{LIVE_TRACKING_HUB, MESSAGING_HUB};
use fleet_hub::credentials::CredentialsProvider;
use fleet_hub::messaging::{ChatTimeline, ConversationState, MessagingService};
use fleet_hub::server::{HubServer, LiveTrackingHub, LoggingGeolocationStore, MessagingHub};
use fleet_hub::tracking::{
    ChannelLocationSource, LocationFix, LocationTracker, PermissionStatus, TrackingService,
};
use fleet_hub::{Config, HubConnection};
use mimalloc::MiMalloc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "fleet-hub")]
#[command(version)]
#[command(about = "Real-time hubs for fleet tracking and driver messaging")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live-tracking and chat hubs
    Serve {
        /// Address to bind (defaults to the configured bind_addr)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Publish `lat,long` lines read from stdin as truck positions
    Track,
    /// Join a conversation and print pushed chat events
    Chat {
        /// Conversation to join
        conversation_id: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Serve { bind } => serve(&config, bind).await,
        Commands::Track => track(&config).await,
        Commands::Chat { conversation_id } => chat(&config, &conversation_id).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: &Config, bind: Option<String>) -> Result<()> {
    let store = Arc::new(LoggingGeolocationStore);
    let server = HubServer::builder()
        .hub(LIVE_TRACKING_HUB, Arc::new(LiveTrackingHub::new(store)))
        .hub(MESSAGING_HUB, Arc::new(MessagingHub::new()))
        .build();

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Received Ctrl+C, shutting down...");
        }
        shutdown.cancel();
    });

    let addr = bind.unwrap_or_else(|| config.bind_addr.clone());
    server.bind(&addr).await
}

fn connection(config: &Config, hub_url: String) -> Result<HubConnection> {
    let credentials = &config.credentials;
    let token = credentials
        .access_token()
        .context("No access token. Set FLEET_ACCESS_TOKEN or sign in first.")?;
    HubConnection::builder(hub_url)
        .access_token(token)
        .tenant_id(credentials.tenant_id().unwrap_or_default())
        .build()
}

async fn track(config: &Config) -> Result<()> {
    let credentials = Arc::new(config.credentials.clone());
    let hub = connection(config, config.tracking_hub_url())?;
    let service = Arc::new(TrackingService::new(Arc::new(hub)));
    service.connect().await?;

    let source = Arc::new(ChannelLocationSource::new(PermissionStatus::Granted));
    let tracker = LocationTracker::new(
        Arc::<ChannelLocationSource>::clone(&source),
        Arc::clone(&service),
        config.geocoder()?,
        credentials,
        config.driver_profile(),
    )
    .with_distance_filter(config.distance_filter_meters);
    tracker.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_fix(line) {
            Some((latitude, longitude)) => {
                if !source.push(LocationFix::now(latitude, longitude)).await {
                    log::warn!("Tracker is not accepting fixes");
                }
            }
            None => eprintln!("Expected `lat,long`, got: {line}"),
        }
    }

    tracker.stop();
    service.disconnect().await;
    Ok(())
}

fn parse_fix(line: &str) -> Option<(f64, f64)> {
    let (lat, lon) = line.split_once(',')?;
    Some((lat.trim().parse().ok()?, lon.trim().parse().ok()?))
}

async fn chat(config: &Config, conversation_id: &str) -> Result<()> {
    let credentials = Arc::new(config.credentials.clone());
    let hub = connection(config, config.messaging_hub_url())?;
    let user_id = credentials.user_id();
    let messaging = MessagingService::new(Arc::new(hub), credentials);

    let conversations = Arc::new(ConversationState::new(user_id.clone()));
    let follower = conversations.follow(messaging.subscribe_messages());
    let mut timeline = ChatTimeline::new(conversation_id, user_id);

    let mut messages = messaging.subscribe_messages();
    let mut typing = messaging.subscribe_typing();
    let mut receipts = messaging.subscribe_read_receipts();

    messaging.connect().await?;
    messaging.join_conversation(conversation_id);
    println!("Joined {conversation_id}. Ctrl+C to leave.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = messages.recv() => match message {
                Ok(message) => {
                    let sender = message.sender_name.clone().unwrap_or_else(|| message.sender_id.clone());
                    let content = message.content.clone();
                    if timeline.push_remote(message) {
                        println!("[{sender}] {content}");
                        println!("(unread: {})", conversations.total_unread());
                    }
                }
                Err(RecvError::Lagged(skipped)) => log::warn!("Missed {skipped} messages"),
                Err(RecvError::Closed) => break,
            },
            indicator = typing.recv() => {
                if let Ok(indicator) = indicator {
                    if indicator.conversation_id == conversation_id {
                        let verb = if indicator.is_typing { "is typing" } else { "stopped typing" };
                        println!("{} {verb}", indicator.user_id);
                    }
                }
            },
            receipt = receipts.recv() => {
                if let Ok(receipt) = receipt {
                    if timeline.mark_read(&receipt.message_id) {
                        println!("{} read {}", receipt.read_by_id, receipt.message_id);
                    }
                }
            },
        }
    }

    messaging.leave_conversation(conversation_id);
    messaging.disconnect().await;
    follower.abort();
    Ok(())
}
