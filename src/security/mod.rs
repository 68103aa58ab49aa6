//! Transport security between peers

pub mod tls;

pub use tls::{ForwardingStream, PeerTlsConfig, TlsAcceptor};
