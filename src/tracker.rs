//! Tracker (rendezvous) wire protocol: both the peer-side client that
//! periodically announces itself, and the server-side accumulator logic
//! used by the `cairn-tracker` binary.
//!
//! Wire contract: on connect, the dialer sends `N:u16-be` followed by N
//! 6-byte peer-address records (its own listening addresses), then reads
//! `M:u16-be` followed by M 6-byte records (peers known to the tracker).
//!
//! Response ordering is disambiguated from the Python reference
//! implementation's `tracker.py`, since the distilled spec only says the
//! tracker "accumulates addresses and returns its current list": the
//! tracker responds with the address list **as it stood before** this
//! request's own addresses are folded in, then appends the new addresses
//! and caps the accumulated set at the 10 most recent.

use crate::addr::{PeerAddr, PEER_ADDR_LEN};
use crate::endpoint::Endpoint;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// At most this many peer addresses are retained by the tracker.
pub const MAX_TRACKED_PEERS: usize = 10;

/// Delay before the first announce, and the fixed interval between
/// subsequent ones.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("tracker sent an address count exceeding the sane ceiling")]
    CountTooLarge,
}

/// Sanity ceiling on the wire-carried address count, well above
/// `MAX_TRACKED_PEERS`, so a corrupt/hostile length prefix can't make a
/// client allocate unbounded memory.
const MAX_WIRE_COUNT: usize = 4096;

async fn write_addrs<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    addrs: &[PeerAddr],
) -> Result<(), TrackerError> {
    let count: u16 = addrs
        .len()
        .try_into()
        .map_err(|_| TrackerError::CountTooLarge)?;
    w.write_all(&count.to_be_bytes()).await?;
    for a in addrs {
        w.write_all(&a.to_bytes()).await?;
    }
    Ok(())
}

async fn read_addrs<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Vec<PeerAddr>, TrackerError> {
    let mut count_bytes = [0u8; 2];
    r.read_exact(&mut count_bytes).await?;
    let count = u16::from_be_bytes(count_bytes) as usize;
    if count > MAX_WIRE_COUNT {
        return Err(TrackerError::CountTooLarge);
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let mut bytes = [0u8; PEER_ADDR_LEN];
        r.read_exact(&mut bytes).await?;
        addrs.push(PeerAddr::from_bytes(bytes));
    }
    Ok(addrs)
}

// ---------------------------------------------------------------------
// Tracker server
// ---------------------------------------------------------------------

#[derive(Default)]
struct TrackerState {
    peers: VecDeque<PeerAddr>,
}

/// Shared accumulator backing the `cairn-tracker` binary.
#[derive(Clone, Default)]
pub struct TrackerServer {
    state: Arc<Mutex<TrackerState>>,
}

impl TrackerServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn serve(self, listener: TcpListener) {
        loop {
            let (socket, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "tracker accept failed");
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(socket).await {
                    warn!(addr = %remote, error = %e, "tracker session failed");
                }
            });
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream) -> Result<(), TrackerError> {
        let announced = read_addrs(&mut socket).await?;

        let response = {
            let mut state = self.state.lock().await;
            // Respond with the list as it stood *before* folding in this
            // request's own addresses.
            let response: Vec<PeerAddr> = state.peers.iter().copied().collect();

            for addr in announced {
                if !state.peers.contains(&addr) {
                    state.peers.push_back(addr);
                }
            }
            while state.peers.len() > MAX_TRACKED_PEERS {
                state.peers.pop_front();
            }
            response
        };

        write_addrs(&mut socket, &response).await
    }
}

// ---------------------------------------------------------------------
// Tracker client
// ---------------------------------------------------------------------

/// One announce round trip: connect to `tracker_addr`, send `own_addrs`,
/// return the peers the tracker already knew about.
pub async fn announce_once(
    tracker_addr: SocketAddr,
    own_addrs: &[PeerAddr],
) -> Result<Vec<PeerAddr>, TrackerError> {
    let mut socket = TcpStream::connect(tracker_addr).await?;
    write_addrs(&mut socket, own_addrs).await?;
    read_addrs(&mut socket).await
}

/// Periodic task: announce this endpoint to the tracker, then dial every
/// returned address that isn't one of this endpoint's own listening
/// addresses. Swallows transient I/O errors (connect refused, tracker
/// unreachable) and retries on the next tick — the only retry/timeout
/// behavior the core owns.
///
/// The first announce fires only after `ANNOUNCE_INTERVAL` has elapsed, not
/// immediately on startup — `tokio::time::interval`'s own first tick
/// completes right away, so the initial delay is slept explicitly before
/// entering the tick loop.
pub async fn run_periodic_announce(
    endpoint: Arc<Endpoint>,
    tracker_addr: SocketAddr,
    own_addrs: Vec<PeerAddr>,
) {
    tokio::time::sleep(ANNOUNCE_INTERVAL).await;
    let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
    loop {
        interval.tick().await;
        match announce_once(tracker_addr, &own_addrs).await {
            Ok(peers) => {
                for peer in peers {
                    if own_addrs.contains(&peer) {
                        continue;
                    }
                    if let Err(e) = endpoint.connect(peer.to_socket_addr()).await {
                        info!(peer = %peer, error = %e, "could not connect to tracker-supplied peer");
                    }
                }
            }
            Err(e) => {
                warn!(tracker = %tracker_addr, error = %e, "tracker announce failed, will retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn responds_with_pre_update_list_then_accumulates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = listener.local_addr().unwrap();
        tokio::spawn(TrackerServer::new().serve(listener));

        let a = PeerAddr::new(Ipv4Addr::new(127, 0, 0, 1), 40001);
        let b = PeerAddr::new(Ipv4Addr::new(127, 0, 0, 1), 40002);

        // A announces first: tracker has nothing yet.
        let peers = announce_once(tracker_addr, &[a]).await.unwrap();
        assert!(peers.is_empty());

        // B announces: tracker now has [a], and that's what comes back to
        // B, *not* including b itself.
        let peers = announce_once(tracker_addr, &[b]).await.unwrap();
        assert_eq!(peers, vec![a]);
    }

    #[tokio::test]
    async fn caps_at_ten_most_recent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = listener.local_addr().unwrap();
        tokio::spawn(TrackerServer::new().serve(listener));

        for i in 0..15u16 {
            let addr = PeerAddr::new(Ipv4Addr::new(127, 0, 0, 1), 50000 + i);
            announce_once(tracker_addr, &[addr]).await.unwrap();
        }
        // One more announce to observe the accumulated list.
        let observer = PeerAddr::new(Ipv4Addr::new(127, 0, 0, 1), 60000);
        let peers = announce_once(tracker_addr, &[observer]).await.unwrap();
        assert_eq!(peers.len(), MAX_TRACKED_PEERS);
    }
}
