//! Accepts inbound connections and dials outbound ones. Owns the set of
//! live `Connection`s for this peer process, keyed by remote address.

use crate::connection::{self, Connection};
use crate::exchange::ExchangeHandle;
use crate::store::ObjectStore;
use crate::tls::{self, TlsMaterial};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tls(#[from] tls::TlsError),
}

struct EndpointState {
    connections: HashMap<SocketAddr, Connection>,
}

/// One peer process's listening endpoint. `connect`/the accept loop both
/// race a symmetric TLS upgrade on every raw socket before handing it to
/// [`connection::spawn`].
pub struct Endpoint {
    local_addr: SocketAddr,
    store: ObjectStore,
    engine: ExchangeHandle,
    tls: TlsMaterial,
    tls_server_name: String,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    /// Bind a listener on `addr` (with address+port reuse enabled, so a
    /// peer can rebind its outbound-dialing local address to the same
    /// port after a restart) and spawn the accept loop.
    pub async fn bind(
        addr: SocketAddr,
        store: ObjectStore,
        engine: ExchangeHandle,
        tls: TlsMaterial,
        tls_server_name: impl Into<String>,
    ) -> Result<Arc<Self>, EndpointError> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        socket.set_reuseport(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;
        let local_addr = listener.local_addr()?;

        let endpoint = Arc::new(Self {
            local_addr,
            store,
            engine,
            tls,
            tls_server_name: tls_server_name.into(),
            state: Mutex::new(EndpointState {
                connections: HashMap::new(),
            }),
        });

        let accept_endpoint = endpoint.clone();
        tokio::spawn(async move {
            accept_endpoint.accept_loop(listener).await;
        });

        Ok(endpoint)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, remote_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let endpoint = self.clone();
            tokio::spawn(async move {
                endpoint.upgrade_and_register(socket, remote_addr).await;
            });
        }
    }

    /// Dial `peer_addr`. A no-op if a connection to that address already
    /// exists. The outbound socket is bound to this endpoint's own local
    /// address so re-dials after a restart originate from a predictable
    /// source address.
    pub async fn connect(self: &Arc<Self>, peer_addr: SocketAddr) -> Result<(), EndpointError> {
        {
            let state = self.state.lock().await;
            if state.connections.contains_key(&peer_addr) {
                return Ok(());
            }
        }

        let socket = match peer_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        socket.set_reuseport(true)?;
        socket.bind(self.local_addr)?;
        let stream = socket.connect(peer_addr).await?;

        self.upgrade_and_register(stream, peer_addr).await;
        Ok(())
    }

    async fn upgrade_and_register(self: Arc<Self>, socket: TcpStream, remote_addr: SocketAddr) {
        let upgraded = match tls::race(socket, &self.tls, &self.tls_server_name).await {
            Ok(s) => s,
            Err(e) => {
                warn!(addr = %remote_addr, error = %e, "TLS upgrade failed, dropping socket");
                return;
            }
        };

        {
            let mut state = self.state.lock().await;
            if state.connections.contains_key(&remote_addr) {
                // Symmetric connect race: both sides dialed each other and
                // both upgrades completed. Keep the existing connection,
                // let this one drop.
                return;
            }
            let endpoint = self.clone();
            let conn = connection::spawn(
                upgraded,
                remote_addr,
                self.store.clone(),
                self.engine.clone(),
                move |conn| {
                    let endpoint = endpoint.clone();
                    tokio::spawn(async move {
                        endpoint.remove(conn.remote_addr()).await;
                    });
                },
            );
            state.connections.insert(remote_addr, conn);
        }
        info!(addr = %remote_addr, "connection established");
    }

    async fn remove(&self, remote_addr: SocketAddr) {
        self.state.lock().await.connections.remove(&remote_addr);
        info!(addr = %remote_addr, "connection removed");
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }
}
