//! ThereIn Daemon Binary
//!
//! A WebSocket server that pushes feed events (posts, likes, comments,
//! replies, follows, notifications, typing) to connected clients in real
//! time.
//!
//! # Usage
//!
//! ```bash
//! therein-daemon --port 9870
//! therein-daemon --port 9870 --host 127.0.0.1 --demo
//! ```
//!
//! Clients connect with `ws://host:port/?token=<bearer-token>`. With
//! `--demo` the daemon seeds two users and prints their tokens, so the
//! realtime layer can be exercised without an embedding application.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use therein_engine::realtime::connection::{handle_connection, SocketConfig};
use therein_engine::realtime::dispatcher::EventDispatcher;
use therein_engine::realtime::registry::ConnectionRegistry;
use therein_engine::service::{FeedService, PostInput};
use therein_engine::store::Store;

/// ThereIn realtime fan-out daemon
#[derive(Parser, Debug)]
#[command(name = "therein-daemon")]
#[command(about = "ThereIn real-time feed daemon")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "9870", env = "THEREIN_PORT")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1", env = "THEREIN_HOST")]
    host: String,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,

    /// Seed demo users and print their connection tokens
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("therein_engine=info".parse().unwrap())
                .add_directive("therein_daemon=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let store = Arc::new(Store::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&registry)));
    let config = SocketConfig { heartbeat_interval: Duration::from_secs(args.heartbeat_secs) };

    if args.demo {
        seed_demo(&store, &dispatcher)?;
    }

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("ThereIn daemon listening on ws://{}", addr);
    tracing::info!("Connect with ws://{}/?token=<bearer-token>", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::info!("Accepted connection from {}", peer);
                let store = Arc::clone(&store);
                let registry = Arc::clone(&registry);
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    handle_connection(stream, store, registry, dispatcher, config).await;
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
            }
        }
    }
}

fn seed_demo(store: &Arc<Store>, dispatcher: &Arc<EventDispatcher>) -> anyhow::Result<()> {
    let service = FeedService::new(Arc::clone(store), Arc::clone(dispatcher));

    let ada = store.create_user("ada", "Ada Lovelace")?;
    let grace = store.create_user("grace", "Grace Hopper")?;
    service.create_post(
        &ada.id,
        PostInput {
            title: "Sketch of the Analytical Engine".into(),
            content: "Notes by the translator.".into(),
            category: "Computer Science".into(),
            tags: vec!["history".into()],
        },
    )?;

    for user in [&ada, &grace] {
        let token = store.issue_token(&user.id)?;
        tracing::info!("Demo user '{}' token: {}", user.username, token);
    }
    Ok(())
}
