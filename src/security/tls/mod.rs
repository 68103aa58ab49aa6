//! TLS for the forwarding endpoint via rustls

mod config;
mod stream;

pub use config::PeerTlsConfig;
pub use stream::ForwardingStream;

pub use tokio_rustls::TlsAcceptor;
