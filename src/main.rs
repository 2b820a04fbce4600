//! livechat - command-line realtime watcher
//!
//! Connects to a livechat realtime endpoint, subscribes to change feeds and
//! prints every matching change as one JSON line on stdout. Logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use livechat_client::{
    ChangeEvent, ConnectionConfig, ConnectionManager, ConnectionState, Feed, Subscription,
    SubscriptionMultiplexer,
};
use livechat_shared::{ChangeKind, Filter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Watch realtime changes on a livechat server.
#[derive(Parser, Debug)]
#[command(name = "livechat", version, about = "Watch realtime changes on a livechat server")]
struct Cli {
    /// Realtime endpoint (overrides LIVECHAT_URL).
    #[arg(long)]
    url: Option<String>,

    /// Client identity sent with every message (overrides LIVECHAT_CLIENT_ID).
    #[arg(long)]
    client_id: Option<String>,

    /// Give up on the first lost connection instead of reconnecting.
    #[arg(long)]
    no_reconnect: bool,

    /// Maximum reconnect attempts before giving up.
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to one resource.
    Watch {
        /// Resource (table) name, e.g. `messages`.
        resource: String,

        /// Events to listen for.
        #[arg(long = "event", value_delimiter = ',', default_value = "insert,update,delete")]
        events: Vec<ChangeKind>,

        /// Only deliver changes whose row has `field=value`.
        #[arg(long)]
        filter: Option<Filter>,
    },
    /// Follow one chat session: new messages and status changes.
    Session { session_id: String },
    /// Follow widget configuration changes.
    Config {
        #[arg(long)]
        widget_id: Option<String>,
    },
}

impl Cli {
    fn connection_config(&self) -> Result<ConnectionConfig> {
        let mut config = ConnectionConfig::from_env().context("invalid LIVECHAT_* environment")?;
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(client_id) = &self.client_id {
            config.client_id = client_id.clone();
        }
        if self.no_reconnect {
            config.auto_reconnect = false;
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = attempts;
        }
        config.validate().context("invalid connection settings")?;
        Ok(config)
    }
}

fn print_event(event: &ChangeEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize change event"),
    }
}

fn subscribe(mux: &SubscriptionMultiplexer, command: &Command) -> Vec<Subscription> {
    match command {
        Command::Watch {
            resource,
            events,
            filter,
        } => vec![mux.subscribe(resource, events, filter.clone(), print_event)],
        Command::Session { session_id } => [
            Feed::SessionMessages {
                session_id: session_id.clone(),
            },
            Feed::SessionStatus {
                session_id: session_id.clone(),
            },
        ]
        .iter()
        .map(|feed| mux.watch(feed, print_event))
        .collect(),
        Command::Config { widget_id } => vec![mux.watch(
            &Feed::ConfigChanges {
                widget_id: widget_id.clone(),
            },
            print_event,
        )],
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livechat=info,livechat_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.connection_config()?;
    tracing::info!(url = %config.url, client_id = %config.client_id, "starting watcher");

    let connection = ConnectionManager::new(config);
    let mux = SubscriptionMultiplexer::new(connection.clone());
    let subscriptions = subscribe(&mux, &cli.command);
    tracing::info!(channels = mux.active_channels().len(), "subscriptions registered");

    let mut states = connection.watch_state();
    if let Err(e) = connection.connect().await {
        tracing::warn!(error = %e, "initial connect failed");
    }

    let outcome = loop {
        states.borrow_and_update();
        // Read under the manager's lock: a Failed state seen there is terminal.
        if let ConnectionState::Failed { reason } = connection.state() {
            break Err(reason);
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break Ok(());
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
        }
    };

    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    mux.close();
    connection.destroy();

    match outcome {
        Ok(()) => Ok(()),
        Err(reason) => bail!("connection failed: {reason}"),
    }
}
