//! The exchange engine: process-wide bookkeeping of which neighbors
//! advertise which digests, at-most-one outstanding download per neighbor,
//! and reassignment on completion, failure, or disconnect.
//!
//! The distilled spec assumes a single-threaded cooperative event loop, so
//! its engine indices need no locking. This crate runs on a multi-threaded
//! `tokio` runtime instead (matching the teacher's own
//! `tokio::sync::Mutex`-guarded shared-state style in `net/connection.rs`'s
//! `ConnectionManager`), so every mutation here is serialized through one
//! `tokio::sync::Mutex<ExchangeState>` — equivalent to the single serializing
//! actor the distilled spec describes, just expressed as a lock instead of a
//! task boundary.

use crate::connection::Connection;
use crate::digest::Digest;
use crate::store::ObjectStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

struct ExchangeState {
    store: ObjectStore,
    advertisers: HashMap<Digest, HashSet<Connection>>,
    advertised: HashMap<Connection, HashSet<Digest>>,
    downloading: HashSet<Digest>,
}

/// Cheaply-cloneable handle to the engine, passed to every `Endpoint` and
/// `Connection`.
#[derive(Clone)]
pub struct ExchangeHandle(Arc<Mutex<ExchangeState>>);

/// Constructs the engine's shared state. Named distinctly from the handle
/// it returns so callers read `Exchange::new(store)` rather than
/// constructing `ExchangeState` by hand.
pub struct Exchange;

impl Exchange {
    pub fn new(store: ObjectStore) -> ExchangeHandle {
        ExchangeHandle(Arc::new(Mutex::new(ExchangeState {
            store,
            advertisers: HashMap::new(),
            advertised: HashMap::new(),
            downloading: HashSet::new(),
        })))
    }
}

impl ExchangeHandle {
    /// A neighbor advertised `digest`. If we already hold it, ignore. Else
    /// record the advertisement and, if nobody is currently downloading
    /// this digest, ask `conn` to start the download.
    pub async fn on_advertise(&self, digest: Digest, conn: Connection) {
        let mut state = self.0.lock().await;
        if state.store.contains(&digest).await {
            return;
        }
        state.advertisers.entry(digest).or_default().insert(conn.clone());
        state.advertised.entry(conn.clone()).or_default().insert(digest);

        if state.downloading.contains(&digest) {
            return;
        }
        if conn.try_request(digest, &state.store).await {
            state.downloading.insert(digest);
            info!(%digest, peer = %conn.remote_addr(), "download started");
        }
    }

    /// `conn` finished downloading `digest` (already committed to the
    /// store by the connection layer). Drop bookkeeping for it, then use
    /// this quiescent moment to give every *other* advertiser of `digest` a
    /// chance to start downloading something else they're sitting on.
    pub async fn on_complete(&self, digest: Digest, conn: Connection) {
        let mut state = self.0.lock().await;
        state.downloading.remove(&digest);

        let Some(advertisers) = state.advertisers.remove(&digest) else {
            return;
        };
        for c in &advertisers {
            if let Some(set) = state.advertised.get_mut(c) {
                set.remove(&digest);
            }
        }

        for c in advertisers {
            if c == conn {
                continue;
            }
            let candidate = {
                let advertised = state.advertised.get(&c).cloned().unwrap_or_default();
                advertised
                    .iter()
                    .find(|d| !state.downloading.contains(*d))
                    .copied()
            };
            if let Some(next) = candidate {
                if c.try_request(next, &state.store).await {
                    state.downloading.insert(next);
                }
            }
        }
    }

    /// `conn` failed to deliver `digest` (wire Fail, disconnect mid-
    /// transfer, or a local digest-mismatch). Remove the failed
    /// relationship, then hand the request to another advertiser of the
    /// same digest — iterating the *remaining* advertiser set, never the
    /// connection that just failed.
    ///
    /// The reference implementation this crate is modeled on has a bug
    /// here: it retries on the same failing connection instead of the
    /// other advertisers. That behavior is not reproduced.
    pub async fn on_fail(&self, digest: Digest, conn: Connection) {
        let mut state = self.0.lock().await;
        if let Some(set) = state.advertised.get_mut(&conn) {
            set.remove(&digest);
        }
        let remaining: Vec<Connection> = match state.advertisers.get_mut(&digest) {
            Some(set) => {
                set.remove(&conn);
                set.iter().cloned().collect()
            }
            None => Vec::new(),
        };

        let mut reassigned = false;
        for c in remaining {
            if c.try_request(digest, &state.store).await {
                state.downloading.insert(digest);
                reassigned = true;
                break;
            }
        }
        if !reassigned {
            state.downloading.remove(&digest);
        }
    }

    /// `conn` disconnected. Purge it from every advertiser index; any
    /// download it had in flight was already failed by the connection
    /// layer (via `on_fail`) before this call.
    pub async fn on_connection_lost(&self, conn: Connection) {
        let mut state = self.0.lock().await;
        if let Some(digests) = state.advertised.remove(&conn) {
            for d in digests {
                if let Some(set) = state.advertisers.get_mut(&d) {
                    set.remove(&conn);
                    if set.is_empty() {
                        state.advertisers.remove(&d);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub async fn downloading_count(&self) -> usize {
        self.0.lock().await.downloading.len()
    }

    #[cfg(test)]
    pub async fn advertiser_count(&self, digest: &Digest) -> usize {
        self.0
            .lock()
            .await
            .advertisers
            .get(digest)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}
