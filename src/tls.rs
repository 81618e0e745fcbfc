//! Symmetric TLS upgrade resolver.
//!
//! Peer connections are symmetric: either side may have dialed, so there is
//! no a-priori TLS client/server role for a freshly accepted or freshly
//! connected socket. Both sides speculatively start a TLS client handshake,
//! capture their own ClientHello instead of sending it blind, then race: the
//! side whose ClientHello random is lexicographically greater promotes
//! itself to TLS server and replays the peer's captured ClientHello into a
//! freshly built server connection; the other side reuses its already
//! in-flight client connection. Equal randoms (a reflection or replay) abort
//! the connection.
//!
//! No file in the reference corpus demonstrates this raw-ClientHello-capture
//! technique; it is grounded directly in `rustls`'s own low-level connection
//! API (`read_tls` / `write_tls` / `process_new_packets`), driven by hand
//! rather than through the crate's high-level `connect`/`accept` helpers,
//! since those never expose the ClientHello before it is written to the
//! wire.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};

/// Width of the ClientRandom bytes actually compared for the tie-break.
/// TLS's ClientHello.random field is 32 bytes, but historically the first 4
/// were a gmt_unix_time; the race only compares the latter 28 truly-random
/// bytes, beginning at byte offset 15 of the full record (5-byte record
/// header + 4-byte handshake header + 2-byte client_version + 4-byte
/// gmt_unix_time).
const RANDOM_OFFSET: usize = 15;
const RANDOM_LEN: usize = 28;

const TLS_RECORD_HEADER_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("peer sent a reflected/replayed ClientHello (identical random)")]
    ReflectedHandshake,
    #[error("captured ClientHello too short to contain a random")]
    ShortClientHello,
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("certificate/key loading error: {0}")]
    CertLoad(String),
}

/// Loaded mutual-TLS material: this peer's cert chain + key, and the shared
/// CA bundle used to verify the other side's certificate.
#[derive(Clone)]
pub struct TlsMaterial {
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
}

impl TlsMaterial {
    /// Load `cert_path`/`key_path` (this peer's leaf cert + private key,
    /// PEM) and `ca_path` (the shared CA bundle, PEM) and build both a
    /// client and a server TLS config requiring mutual authentication under
    /// that CA.
    pub fn load(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<Self, TlsError> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| TlsError::CertLoad(e.to_string()))?;
        }
        let roots = Arc::new(roots);

        let client_verifier = WebPkiClientVerifier::builder(roots.clone())
            .build()
            .map_err(|e| TlsError::CertLoad(e.to_string()))?;

        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            // PrivateKeyDer::clone_key() is the documented way to duplicate
            // a private key without re-reading it from disk.
            .map_err(|e| TlsError::CertLoad(e.to_string()))?;

        let client_config = ClientConfig::builder()
            .with_root_certificates((*roots).clone())
            .with_client_auth_cert(certs, key)
            .map_err(|e| TlsError::CertLoad(e.to_string()))?;

        Ok(Self {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
        })
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let bytes = std::fs::read(path).map_err(TlsError::Io)?;
    let mut reader = Cursor::new(bytes);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertLoad(format!("{}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let bytes = std::fs::read(path).map_err(TlsError::Io)?;
    let mut reader = Cursor::new(bytes);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::CertLoad(format!("{}: {e}", path.display())))?
        .ok_or_else(|| TlsError::CertLoad(format!("no private key found in {}", path.display())))
}

enum Conn {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Conn {
    fn wants_write(&self) -> bool {
        match self {
            Conn::Client(c) => c.wants_write(),
            Conn::Server(c) => c.wants_write(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Conn::Client(c) => c.wants_read(),
            Conn::Server(c) => c.wants_read(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Conn::Client(c) => c.is_handshaking(),
            Conn::Server(c) => c.is_handshaking(),
        }
    }

    fn write_tls(&mut self, w: &mut dyn Write) -> io::Result<usize> {
        match self {
            Conn::Client(c) => c.write_tls(w),
            Conn::Server(c) => c.write_tls(w),
        }
    }

    fn read_tls(&mut self, r: &mut dyn Read) -> io::Result<usize> {
        match self {
            Conn::Client(c) => c.read_tls(r),
            Conn::Server(c) => c.read_tls(r),
        }
    }

    fn process_new_packets(&mut self) -> Result<(), rustls::Error> {
        match self {
            Conn::Client(c) => c.process_new_packets().map(|_| ()),
            Conn::Server(c) => c.process_new_packets().map(|_| ()),
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Conn::Client(c) => c as &mut dyn Write,
            Conn::Server(c) => c as &mut dyn Write,
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Conn::Client(c) => c.reader(),
            Conn::Server(c) => c.reader(),
        }
    }
}

/// A raw socket carrying a TLS session after [`race`] has resolved the
/// client/server role. Implements `AsyncRead`/`AsyncWrite` so the
/// [`crate::connection::Connection`] layer can use it exactly like any other
/// duplex byte stream.
pub struct SymmetricTlsStream<S> {
    conn: Conn,
    io: S,
    /// Ciphertext produced by `conn` but not yet flushed to `io`.
    write_buf: Vec<u8>,
    write_pos: usize,
}

impl<S> SymmetricTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Drive handshake I/O (both directions) until the session is
    /// established.
    async fn drive_handshake(&mut self) -> io::Result<()> {
        loop {
            while self.conn.wants_write() {
                let mut buf = Vec::new();
                self.conn.write_tls(&mut buf)?;
                self.io.write_all(&buf).await?;
            }
            if !self.conn.is_handshaking() {
                return Ok(());
            }
            if self.conn.wants_read() {
                let mut tmp = [0u8; 4096];
                let n = self.io.read(&mut tmp).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during TLS handshake",
                    ));
                }
                let mut cursor = &tmp[..n];
                self.conn.read_tls(&mut cursor)?;
                self.conn
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            }
        }
    }
}

/// Read exactly one TLS record (header + body) from a raw, not-yet-upgraded
/// socket, returning the full bytes (header included) so they can be
/// replayed into a freshly built server connection if this side becomes the
/// TLS server.
async fn read_one_record<S: AsyncRead + Unpin>(io: &mut S) -> io::Result<Vec<u8>> {
    let mut header = [0u8; TLS_RECORD_HEADER_LEN];
    io.read_exact(&mut header).await?;
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    let mut record = header.to_vec();
    record.extend_from_slice(&body);
    Ok(record)
}

fn extract_random(record: &[u8]) -> Result<&[u8], TlsError> {
    if record.len() < RANDOM_OFFSET + RANDOM_LEN {
        return Err(TlsError::ShortClientHello);
    }
    Ok(&record[RANDOM_OFFSET..RANDOM_OFFSET + RANDOM_LEN])
}

/// Race the symmetric TLS handshake on `io` (a freshly accepted or freshly
/// connected raw socket) and return the authenticated, upgraded stream.
///
/// `server_name` is the name this side presents in its speculative
/// ClientHello's SNI extension; since peers authenticate each other purely
/// via the shared CA and mutual certs, any fixed name the peer's server
/// config is willing to serve under is fine.
pub async fn race<S>(
    mut io: S,
    material: &TlsMaterial,
    server_name: &str,
) -> Result<SymmetricTlsStream<S>, TlsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| TlsError::CertLoad(e.to_string()))?;
    let mut speculative = ClientConnection::new(material.client_config.clone(), name)?;

    // Capture our own ClientHello instead of writing it straight to the
    // socket: a fresh ClientConnection always has a ClientHello queued.
    let mut our_hello = Vec::new();
    while speculative.wants_write() {
        speculative.write_tls(&mut our_hello)?;
    }
    let our_random = extract_random(&our_hello)?.to_vec();

    // Now actually send it, and read the peer's ClientHello in parallel
    // fashion: write first (small, won't block meaningfully), then read.
    io.write_all(&our_hello).await?;
    let peer_hello = read_one_record(&mut io).await?;
    let peer_random = extract_random(&peer_hello)?;

    if our_random == peer_random {
        return Err(TlsError::ReflectedHandshake);
    }

    let conn = if our_random.as_slice() > peer_random {
        debug!("TLS race: we are server");
        let mut server = ServerConnection::new(material.server_config.clone())?;
        let mut cursor = Cursor::new(&peer_hello);
        server.read_tls(&mut cursor)?;
        server
            .process_new_packets()
            .map_err(|e| TlsError::Rustls(e))?;
        Conn::Server(server)
    } else {
        debug!("TLS race: we are client");
        // `speculative` already sent its ClientHello over the real socket;
        // the peer's ClientHello we just read was only needed for the
        // random comparison above and is discarded here.
        Conn::Client(speculative)
    };

    let mut stream = SymmetricTlsStream {
        conn,
        io,
        write_buf: Vec::new(),
        write_pos: 0,
    };
    stream.drive_handshake().await?;
    Ok(stream)
}

impl<S> AsyncRead for SymmetricTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut reader = this.conn.reader();
            let mut tmp = vec![0u8; buf.remaining().max(1)];
            match reader.read(&mut tmp) {
                Ok(0) => return Poll::Ready(Ok(())),
                Ok(n) => {
                    buf.put_slice(&tmp[..n]);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No plaintext buffered; pull more ciphertext off the
                    // socket and feed the TLS state machine.
                    let mut raw = [0u8; 4096];
                    let mut raw_buf = ReadBuf::new(&mut raw);
                    match Pin::new(&mut this.io).poll_read(cx, &mut raw_buf)? {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(()) => {
                            let filled = raw_buf.filled();
                            if filled.is_empty() {
                                return Poll::Ready(Ok(()));
                            }
                            let mut cursor = filled;
                            if let Err(e) = this.conn.read_tls(&mut cursor) {
                                return Poll::Ready(Err(e));
                            }
                            if let Err(e) = this.conn.process_new_packets() {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    e.to_string(),
                                )));
                            }
                        }
                    }
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl<S> AsyncWrite for SymmetricTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = this.conn.writer().write(buf)?;
        while this.conn.wants_write() {
            this.conn.write_tls(&mut this.write_buf)?;
        }
        flush_write_buf(this, cx)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match flush_write_buf(this, cx) {
            Ok(true) => Pin::new(&mut this.io).poll_flush(cx),
            Ok(false) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = flush_write_buf(this, cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

/// Drain `write_buf` into the underlying transport as far as it will go
/// without blocking. Returns `Ok(true)` once fully drained, `Ok(false)` if
/// the underlying writer would block (caller should treat as `Pending`).
fn flush_write_buf<S: AsyncWrite + Unpin>(
    this: &mut SymmetricTlsStream<S>,
    cx: &mut Context<'_>,
) -> io::Result<bool> {
    while this.write_pos < this.write_buf.len() {
        match Pin::new(&mut this.io).poll_write(cx, &this.write_buf[this.write_pos..]) {
            Poll::Ready(Ok(0)) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
            }
            Poll::Ready(Ok(n)) => this.write_pos += n,
            Poll::Ready(Err(e)) => return Err(e),
            Poll::Pending => return Ok(false),
        }
    }
    this.write_buf.clear();
    this.write_pos = 0;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_offsets_extract_expected_slice() {
        let mut record = vec![0u8; 43];
        for (i, b) in record.iter_mut().enumerate().skip(RANDOM_OFFSET) {
            *b = i as u8;
        }
        let random = extract_random(&record).unwrap();
        assert_eq!(random.len(), RANDOM_LEN);
        assert_eq!(random[0], RANDOM_OFFSET as u8);
    }

    #[test]
    fn short_record_is_rejected() {
        let record = vec![0u8; 10];
        assert!(matches!(
            extract_random(&record),
            Err(TlsError::ShortClientHello)
        ));
    }
}
