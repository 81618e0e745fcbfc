//! `cairn-tracker`: address rendezvous server.

use cairn::config::TrackerArgs;
use cairn::tracker::TrackerServer;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cairn=info".parse().unwrap()),
        )
        .init();

    let args = TrackerArgs::parse();

    let listener = match TcpListener::bind(args.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind tracker listener");
            return;
        }
    };

    info!("cairn-tracker listening on {}", args.listen_addr);
    TrackerServer::new().serve(listener).await;
}
