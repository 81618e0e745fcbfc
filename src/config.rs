//! Command-line argument parsing for both binaries. Every argument is
//! positional: no `--flags`, no environment variables, matching the
//! distilled spec's deployment model of a single invocation line.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// `cairn-peer`: runs one exchange endpoint plus its tracker-announce loop.
#[derive(Debug, Parser)]
#[command(name = "cairn-peer")]
pub struct PeerArgs {
    /// Address to listen on, e.g. `0.0.0.0:4040`.
    pub listen_addr: SocketAddr,

    /// Directory backing the content-addressed object store.
    pub store_dir: PathBuf,

    /// This peer's certificate, PEM-encoded.
    pub cert_path: PathBuf,

    /// This peer's private key, PEM-encoded.
    pub key_path: PathBuf,

    /// CA certificate used to verify peers, PEM-encoded.
    pub ca_path: PathBuf,

    /// Tracker address to announce to.
    pub tracker_addr: SocketAddr,
}

/// `cairn-tracker`: runs the address-rendezvous server.
#[derive(Debug, Parser)]
#[command(name = "cairn-tracker")]
pub struct TrackerArgs {
    /// Address to listen on, e.g. `0.0.0.0:9000`.
    pub listen_addr: SocketAddr,
}

/// `cairn-certgen`: generates a throwaway CA and a set of peer certs for
/// local testing.
#[derive(Debug, Parser)]
#[command(name = "cairn-certgen")]
pub struct CertgenArgs {
    /// Directory to write the CA cert/key and per-peer cert/key pairs into.
    pub out_dir: PathBuf,

    /// Number of peer cert/key pairs to generate.
    #[arg(default_value_t = 2)]
    pub peer_count: usize,
}
