//! Nostr (NIP-01) building blocks: the signed event model, the array-encoded
//! wire messages, and relay/client engines that keep many WebSocket
//! connections open and fan messages out across them.

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod event;
pub mod info;
pub mod keys;
pub mod message;
pub mod relay;
pub mod subscription;
pub mod tag;
pub mod transport;

pub use client::{Client, ClientOptions};
pub use connection::{Connection, ConnectionId, ConnectionRegistry};
pub use dispatch::{Context, MessageHandler};
pub use envelope::Envelope;
pub use error::{Error, Result, VerificationError};
pub use event::Event;
pub use message::{Auth, Filter, Message, MessageType};
pub use relay::{Relay, RelayOptions};
pub use tag::{Marker, Tag};
