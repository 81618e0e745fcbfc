pub mod addr;
pub mod config;
pub mod connection;
pub mod digest;
pub mod endpoint;
pub mod exchange;
pub mod store;
pub mod tls;
pub mod tracker;
pub mod wire;

pub use addr::PeerAddr;
pub use connection::Connection;
pub use digest::Digest;
pub use endpoint::Endpoint;
pub use exchange::{Exchange, ExchangeHandle};
pub use store::ObjectStore;
