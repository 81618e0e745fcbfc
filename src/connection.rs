//! A single peer link: duplex message I/O, the response queue, the single
//! outstanding inbound download ("request slot"), and writer backpressure.
//!
//! Grounded in the reader/writer-half split and chunked read/write style of
//! the teacher's `net/encrypted.rs` `EncryptedStream`, adapted from Noise
//! frame chunking to this protocol's fixed 1024-byte object chunking.
//!
//! Writer backpressure is expressed with a bounded `tokio::sync::mpsc`
//! channel rather than a hand-rolled pause/resume flag: a bounded channel's
//! `send().await` already suspends callers in FIFO order when full and
//! releases them in order as the receiver drains it, which is exactly the
//! "no write ever dropped or reordered" guarantee this module must provide.

use crate::digest::Digest;
use crate::exchange::ExchangeHandle;
use crate::store::{ObjectStore, StoreError};
use crate::wire::{self, FailReason, Message, WireError, CHUNK_SIZE};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Outbound write queue depth. Once this many encoded frames are buffered
/// awaiting the writer task, further sends suspend — the backpressure point
/// required by the distilled spec.
const WRITE_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

struct RequestSlotState {
    digest: Digest,
    file: File,
}

#[derive(Default)]
struct ResponseState {
    queue: VecDeque<Digest>,
    running: bool,
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to one connection, cheap to clone, used as the key type in
/// the exchange engine's advertiser indices.
#[derive(Clone)]
pub struct Connection(Arc<ConnectionInner>);

struct ConnectionInner {
    id: u64,
    remote_addr: SocketAddr,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    request_slot: Mutex<Option<RequestSlotState>>,
    response: Mutex<ResponseState>,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for Connection {}
impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}
impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection(#{}, {})", self.0.id, self.0.remote_addr)
    }
}

impl Connection {
    pub fn remote_addr(&self) -> SocketAddr {
        self.0.remote_addr
    }

    /// Queue an encoded frame for the writer task. Suspends (FIFO, with
    /// every other waiter on this connection) while the writer is behind.
    async fn send(&self, msg: &Message) -> Result<(), ConnectionError> {
        let mut framed = Vec::new();
        let body = msg.encode();
        let len: u16 = body
            .len()
            .try_into()
            .map_err(|_| ConnectionError::Protocol("frame too large".into()))?;
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&body);
        self.0
            .outbound_tx
            .send(framed)
            .await
            .map_err(|_| ConnectionError::Protocol("connection writer gone".into()))
    }

    /// Attempt to start a download of `digest` on this connection. Returns
    /// `false` if a download is already outstanding (request slot full).
    pub async fn try_request(&self, digest: Digest, store: &ObjectStore) -> bool {
        let mut slot = self.0.request_slot.lock().await;
        if slot.is_some() {
            return false;
        }
        let file = match store.staging_create(&digest).await {
            Ok(f) => f,
            Err(e) => {
                warn!(%digest, error = %e, "failed to open staging file for request");
                return false;
            }
        };
        *slot = Some(RequestSlotState { digest, file });
        drop(slot);

        if self.send(&Message::Request(digest)).await.is_err() {
            // Writer already gone; undo the slot so a fresh advertisement
            // can retry elsewhere once connection_lost cleanup runs.
            self.0.request_slot.lock().await.take();
            return false;
        }
        true
    }

    /// Enqueue a digest the peer asked us for; starts a response producer
    /// if none is currently running.
    async fn handle_request(&self, digest: Digest, store: ObjectStore) {
        let mut resp = self.0.response.lock().await;
        resp.queue.push_back(digest);
        if resp.running {
            return;
        }
        resp.running = true;
        drop(resp);
        let conn = self.clone();
        tokio::spawn(async move {
            conn.run_response_loop(store).await;
        });
    }

    /// Serve queued digests strictly in request order — the response slot:
    /// at most one producer in flight per connection so chunks from
    /// different objects never interleave.
    async fn run_response_loop(&self, store: ObjectStore) {
        loop {
            let digest = {
                let mut resp = self.0.response.lock().await;
                match resp.queue.pop_front() {
                    Some(d) => d,
                    None => {
                        resp.running = false;
                        return;
                    }
                }
            };
            if let Err(e) = self.serve_object(digest, &store).await {
                debug!(%digest, error = %e, "response producer stopped early");
                return;
            }
        }
    }

    /// Stream one object's bytes as type-4/type-5 frames, buffering one
    /// chunk behind so the last non-empty chunk can be relabeled type-5 on
    /// EOF. This guarantees exactly one type-5 terminates every successful
    /// response, including zero-byte objects (a single empty type-5) and
    /// objects whose size is an exact multiple of CHUNK_SIZE (the final
    /// full chunk itself is the type-5, no empty trailer).
    async fn serve_object(&self, digest: Digest, store: &ObjectStore) -> Result<(), ConnectionError> {
        let mut file = match store.open(&digest).await {
            Ok(f) => f,
            Err(StoreError::NotFound(_)) => {
                return Ok(self.send(&Message::Fail(FailReason::NotFound)).await?)
            }
            Err(_) => return Ok(self.send(&Message::Fail(FailReason::ReadError)).await?),
        };

        let mut pending: Option<Vec<u8>> = None;
        loop {
            let mut buf = vec![0u8; CHUNK_SIZE];
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => return Ok(self.send(&Message::Fail(FailReason::ReadError)).await?),
            };
            if n == 0 {
                let last = pending.take().unwrap_or_default();
                self.send(&Message::DataFinal(last)).await?;
                return Ok(());
            }
            buf.truncate(n);
            if let Some(prev) = pending.replace(buf) {
                self.send(&Message::DataChunk(prev)).await?;
            }
        }
    }

    /// Append a non-final chunk to the in-flight download.
    async fn handle_data_chunk(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        let mut slot = self.0.request_slot.lock().await;
        let state = slot
            .as_mut()
            .ok_or_else(|| ConnectionError::Protocol("data chunk with no request in flight".into()))?;
        state.file.write_all(&bytes).await?;
        Ok(())
    }

    /// Append the final chunk, verify and commit it to the store, then
    /// report the outcome to the exchange engine: `on_complete` on a
    /// successful commit, `on_fail` if the verified digest didn't match.
    async fn handle_data_final(
        &self,
        bytes: Vec<u8>,
        store: &ObjectStore,
        engine: &ExchangeHandle,
    ) -> Result<(), ConnectionError> {
        let mut slot = self.0.request_slot.lock().await;
        let state = slot
            .take()
            .ok_or_else(|| ConnectionError::Protocol("final chunk with no request in flight".into()))?;
        drop(slot);
        let RequestSlotState { digest, mut file } = state;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        match store.commit_verified(&digest).await {
            Ok(()) => {
                info!(%digest, from = %self.remote_addr(), "object committed");
                engine.on_complete(digest, self.clone()).await;
            }
            Err(e) => {
                warn!(%digest, error = %e, "digest verification failed, treating as object failure");
                engine.on_fail(digest, self.clone()).await;
            }
        }
        Ok(())
    }

    async fn handle_fail(&self, store: &ObjectStore, engine: &ExchangeHandle) -> Result<(), ConnectionError> {
        let mut slot = self.0.request_slot.lock().await;
        let state = slot
            .take()
            .ok_or_else(|| ConnectionError::Protocol("fail with no request in flight".into()))?;
        drop(slot);
        store.staging_discard(&state.digest).await?;
        engine.on_fail(state.digest, self.clone()).await;
        Ok(())
    }

    /// Abort whatever is in flight on this connection — called on
    /// disconnect. The in-progress download, if any, is reported to the
    /// engine as a failure so it can be reassigned to another advertiser.
    async fn on_disconnect(&self, store: &ObjectStore, engine: &ExchangeHandle) {
        let slot = self.0.request_slot.lock().await.take();
        if let Some(state) = slot {
            let _ = store.staging_discard(&state.digest).await;
            engine.on_fail(state.digest, self.clone()).await;
        }
        // The response producer, if any, simply stops making progress once
        // the writer channel's receiver is dropped; no explicit cancel
        // token is needed beyond that.
        engine.on_connection_lost(self.clone()).await;
    }
}

/// Spawn the reader and writer tasks for a freshly upgraded stream and
/// return the resulting `Connection` handle. `on_disconnect` is invoked
/// once the reader loop exits, after engine cleanup, so the caller (the
/// endpoint) can remove this connection from its own table.
pub fn spawn<S>(
    stream: S,
    remote_addr: SocketAddr,
    store: ObjectStore,
    engine: ExchangeHandle,
    on_disconnect: impl FnOnce(Connection) + Send + 'static,
) -> Connection
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = split(stream);
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

    let conn = Connection(Arc::new(ConnectionInner {
        id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
        remote_addr,
        outbound_tx: tx,
        request_slot: Mutex::new(None),
        response: Mutex::new(ResponseState::default()),
    }));

    tokio::spawn(writer_task(write_half, rx));

    {
        let conn = conn.clone();
        let store = store.clone();
        tokio::spawn(async move {
            advertise_everything(&conn, &store).await;
            reader_loop(conn.clone(), read_half, store.clone(), engine.clone()).await;
            conn.on_disconnect(&store, &engine).await;
            on_disconnect(conn);
        });
    }

    conn
}

async fn writer_task<W: AsyncWrite + Unpin>(mut write_half: W, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            return;
        }
    }
}

async fn advertise_everything(conn: &Connection, store: &ObjectStore) {
    let Ok(digests) = store.list().await else {
        return;
    };
    for digest in digests {
        if conn.send(&Message::Advertise(digest)).await.is_err() {
            return;
        }
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(
    conn: Connection,
    mut read_half: R,
    store: ObjectStore,
    engine: ExchangeHandle,
) {
    loop {
        let msg = match wire::read_message(&mut read_half).await {
            Ok(m) => m,
            Err(WireError::Io(e)) => {
                debug!(addr = %conn.remote_addr(), error = %e, "connection closed");
                return;
            }
            Err(e) => {
                warn!(addr = %conn.remote_addr(), error = %e, "decoder desync, dropping connection");
                return;
            }
        };

        let result = match msg {
            Message::Advertise(digest) => {
                engine.on_advertise(digest, conn.clone()).await;
                Ok(())
            }
            Message::Peer(_addr) => {
                // Reserved: accept and ignore, per the wire table.
                Ok(())
            }
            Message::Request(digest) => {
                conn.handle_request(digest, store.clone()).await;
                Ok(())
            }
            Message::DataChunk(bytes) => conn.handle_data_chunk(bytes).await,
            Message::DataFinal(bytes) => conn.handle_data_final(bytes, &store, &engine).await,
            Message::Fail(_reason) => conn.handle_fail(&store, &engine).await,
        };

        if let Err(e) = result {
            warn!(addr = %conn.remote_addr(), error = %e, "per-connection fatal error");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use tempfile::tempdir;

    async fn paired_connections() -> (
        Connection,
        Connection,
        ObjectStore,
        ObjectStore,
        ExchangeHandle,
        ExchangeHandle,
    ) {
        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let a_dir = tempdir().unwrap();
        let b_dir = tempdir().unwrap();
        let a_store = ObjectStore::open(a_dir.path()).await.unwrap();
        let b_store = ObjectStore::open(b_dir.path()).await.unwrap();
        let a_engine = Exchange::new(a_store.clone());
        let b_engine = Exchange::new(b_store.clone());

        let a_conn = spawn(a_io, "127.0.0.1:1".parse().unwrap(), a_store.clone(), a_engine.clone(), |_| {});
        let b_conn = spawn(b_io, "127.0.0.1:2".parse().unwrap(), b_store.clone(), b_engine.clone(), |_| {});
        // keep temp dirs alive for the duration of the test by leaking them
        std::mem::forget(a_dir);
        std::mem::forget(b_dir);
        (a_conn, b_conn, a_store, b_store, a_engine, b_engine)
    }

    #[tokio::test]
    async fn zero_byte_object_yields_single_empty_final_frame() {
        let (a_conn, _b_conn, a_store, _b_store, _a_engine, _b_engine) = paired_connections().await;
        let digest = Digest::of(b"");
        a_store.write_object(&digest, b"").await.unwrap();

        // Drive the response loop directly rather than through the wire,
        // to inspect the exact frame sequence produced.
        let (tx, mut rx) = mpsc::channel(8);
        let probe = Connection(Arc::new(ConnectionInner {
            id: 999,
            remote_addr: "127.0.0.1:3".parse().unwrap(),
            outbound_tx: tx,
            request_slot: Mutex::new(None),
            response: Mutex::new(ResponseState::default()),
        }));
        probe.serve_object(digest, &a_store).await.unwrap();
        drop(probe);

        let frame = rx.recv().await.unwrap();
        let body = &frame[2..];
        let msg = Message::decode(body).unwrap();
        assert_eq!(msg, Message::DataFinal(vec![]));
        assert!(rx.recv().await.is_none());
        let _ = a_conn;
    }

    #[tokio::test]
    async fn exact_multiple_of_chunk_size_has_no_empty_trailer() {
        let (_a_conn, _b_conn, a_store, _b_store, _a_engine, _b_engine) = paired_connections().await;
        let bytes = vec![0xABu8; CHUNK_SIZE * 2];
        let digest = Digest::of(&bytes);
        a_store.write_object(&digest, &bytes).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let probe = Connection(Arc::new(ConnectionInner {
            id: 1000,
            remote_addr: "127.0.0.1:4".parse().unwrap(),
            outbound_tx: tx,
            request_slot: Mutex::new(None),
            response: Mutex::new(ResponseState::default()),
        }));
        probe.serve_object(digest, &a_store).await.unwrap();

        let mut frames = Vec::new();
        while let Some(f) = rx.recv().await {
            frames.push(Message::decode(&f[2..]).unwrap());
        }
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Message::DataChunk(ref b) if b.len() == CHUNK_SIZE));
        assert!(matches!(frames[1], Message::DataFinal(ref b) if b.len() == CHUNK_SIZE));
    }
}
