//! Peer forwarding for stateful pipeline stages
//!
//! Nodes agree on which of them owns a record by hashing its identification
//! keys onto a consistent-hash ring. Records owned elsewhere are shipped to
//! their owner over HTTP and land in that node's bounded receive buffer; the
//! owner's stage reads them back alongside its local share.

pub mod buffer;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod forwarding;
pub mod processor;
pub mod security;

pub use buffer::{Buffer, CheckpointState, PeerForwarderReceiveBuffer};
pub use config::PeerForwarderConfig;
pub use error::{BufferError, ConfigurationError, ForwardingFailure};
pub use event::Event;
pub use forwarding::{ForwardingServer, HashRing, PeerForwarder, PeerForwarderProvider};
pub use processor::{decorate_processors, PeerForwardingProcessorDecorator, Processor, RequiresPeerForwarding};
