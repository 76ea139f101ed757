//! Bridge between a JSON WebSocket event socket and an XMPP client session.
//!
//! Each socket connection owns one [`Session`], which logs in through a
//! [`Connector`], routes inbound stanzas to tracked-reply callbacks or to an
//! ordered chain of feature [`Listener`]s, and relays their notifications
//! back to the socket.

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod features;
pub mod jid;
pub mod listener;
pub mod session;
pub mod socket;
pub mod stanza;
pub mod tracker;

pub use client::{ClientOptions, Connector, MemoryConnector, StreamConnector};
pub use config::Config;
pub use jid::{Jid, JidKind};
pub use listener::Listener;
pub use session::{ConnectionState, Session, SessionConfig, SessionHandle};
pub use socket::server::BridgeServer;
pub use socket::{Ack, Outbound, SocketCommand, SocketTx};
pub use stanza::Element;
