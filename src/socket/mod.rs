//! JSON event frames exchanged with the socket client.
//!
//! Inbound frames are `{"event", "data", "ack"?}`. Outbound notifications are
//! `{"event", "data"}`; an inbound frame carrying `ack` is answered with
//! `{"ack", "data": [error, result]}`.

pub mod server;

use crate::session::SessionHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    ack: Option<u64>,
}

/// Work for the socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Value),
    /// Close the transport socket.
    Close,
}

/// Sending half of a socket connection.
#[derive(Debug, Clone)]
pub struct SocketTx {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SocketTx {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit a named notification.
    pub fn send(&self, event: &str, data: Value) {
        self.push(Outbound::Frame(json!({ "event": event, "data": data })));
    }

    /// Close the transport socket.
    pub fn end(&self) {
        self.push(Outbound::Close);
    }

    pub fn ack(&self, id: u64) -> Ack {
        Ack {
            id,
            socket: self.clone(),
        }
    }

    fn push(&self, outbound: Outbound) {
        if self.tx.send(outbound).is_err() {
            debug!("Socket writer gone, dropping outbound frame");
        }
    }
}

/// Reply slot for an inbound frame that asked for an acknowledgement.
#[derive(Debug)]
pub struct Ack {
    id: u64,
    socket: SocketTx,
}

impl Ack {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ok(self, result: Value) {
        self.reply(Value::Null, result);
    }

    pub fn err(self, error: Value) {
        self.reply(error, Value::Null);
    }

    fn reply(self, error: Value, result: Value) {
        self.socket
            .push(Outbound::Frame(json!({ "ack": self.id, "data": [error, result] })));
    }
}

/// A decoded inbound frame.
#[derive(Debug)]
pub struct SocketCommand {
    pub event: String,
    pub data: Value,
    pub ack: Option<Ack>,
}

impl SocketCommand {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: Ack) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Decode a text frame; acknowledgements are routed back through `socket`.
    pub fn parse(text: &str, socket: &SocketTx) -> Result<Self, serde_json::Error> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        Ok(Self {
            event: frame.event,
            data: frame.data,
            ack: frame.ack.map(|id| socket.ack(id)),
        })
    }
}

pub type CommandHandler = Arc<dyn Fn(&SessionHandle, Value, Option<Ack>) + Send + Sync>;

/// Socket events registered by listeners, keyed by event name.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    /// Returns true if an existing handler was replaced.
    pub fn on(&mut self, event: &str, handler: CommandHandler) -> bool {
        self.handlers.insert(event.to_string(), handler).is_some()
    }

    pub fn off(&mut self, event: &str) -> bool {
        self.handlers.remove(event).is_some()
    }

    pub fn get(&self, event: &str) -> Option<CommandHandler> {
        self.handlers.get(event).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
