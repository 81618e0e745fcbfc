//! `cairn-peer`: one content-addressed exchange endpoint.
//!
//! Binds a listener, loads its own object store and mutual-TLS material,
//! then announces itself to a tracker on a fixed interval and connects to
//! whatever peers the tracker hands back.

use cairn::addr::PeerAddr;
use cairn::config::PeerArgs;
use cairn::endpoint::Endpoint;
use cairn::exchange::Exchange;
use cairn::store::ObjectStore;
use cairn::tls::TlsMaterial;
use cairn::tracker;
use clap::Parser;
use std::net::SocketAddr;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cairn=info".parse().unwrap()),
        )
        .init();

    let args = PeerArgs::parse();

    info!("cairn-peer v{} starting on {}", VERSION, args.listen_addr);

    let store = match ObjectStore::open(args.store_dir.clone()).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open object store");
            return;
        }
    };

    let tls = match TlsMaterial::load(&args.cert_path, &args.key_path, &args.ca_path) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "failed to load TLS material");
            return;
        }
    };

    let engine = Exchange::new(store.clone());

    let endpoint = match Endpoint::bind(
        args.listen_addr,
        store,
        engine,
        tls,
        "cairn-peer",
    )
    .await
    {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "failed to bind endpoint");
            return;
        }
    };

    let own_addr = match endpoint_peer_addr(endpoint.local_addr()) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "listen address is not announceable to the tracker");
            return;
        }
    };

    tokio::spawn(tracker::run_periodic_announce(
        endpoint.clone(),
        args.tracker_addr,
        vec![own_addr],
    ));

    info!("cairn-peer running, waiting for peer connections...");

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    drop(endpoint);
}

fn endpoint_peer_addr(local: SocketAddr) -> Result<PeerAddr, cairn::addr::NotIpv4> {
    PeerAddr::try_from(local)
}
