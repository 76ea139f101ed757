//! Protocol client seam.
//!
//! A [`Connector`] turns normalized credentials into a [`ClientHandle`]: the
//! session's end of a running XMPP client. The client reports lifecycle
//! events and inbound stanzas on one channel and takes outbound stanzas and
//! the end request on another.

pub mod dns;
pub mod framing;
pub mod memory;
pub mod stream;

use crate::credentials::Credentials;
use crate::error::ClientError;
use crate::stanza::Element;
use tokio::sync::mpsc;
use tracing::debug;

pub use memory::{MemoryClient, MemoryConnector};
pub use stream::{ClientOptions, StreamConnector};

/// Address the server bound for this connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundJid {
    pub user: String,
    pub domain: String,
    pub resource: String,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Online(BoundJid),
    Error(ClientError),
    Stanza(Element),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Send(Element),
    /// Close the stream and stop the client.
    End,
}

pub trait Connector: Send {
    /// Start a client for `credentials`. Connection progress is reported
    /// through the returned handle, never by blocking here.
    fn connect(&mut self, credentials: Credentials) -> ClientHandle;
}

/// Cloneable outbound half of a client, handed to listeners.
#[derive(Debug, Clone)]
pub struct StanzaSender {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl StanzaSender {
    /// Returns false once the client has stopped.
    pub fn send(&self, stanza: Element) -> bool {
        self.commands.send(ClientCommand::Send(stanza)).is_ok()
    }
}

/// Session side of a running client.
pub struct ClientHandle {
    events: mpsc::UnboundedReceiver<ClientEvent>,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

/// Client side of a [`ClientHandle`].
pub struct ClientEnd {
    events: mpsc::UnboundedSender<ClientEvent>,
    pub commands: mpsc::UnboundedReceiver<ClientCommand>,
}

impl ClientHandle {
    pub fn pair() -> (ClientHandle, ClientEnd) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (
            ClientHandle {
                events: events_rx,
                commands: commands_tx,
            },
            ClientEnd {
                events: events_tx,
                commands: commands_rx,
            },
        )
    }

    pub fn sender(&self) -> StanzaSender {
        StanzaSender {
            commands: self.commands.clone(),
        }
    }

    pub fn send(&self, stanza: Element) -> bool {
        self.commands.send(ClientCommand::Send(stanza)).is_ok()
    }

    /// Ask the client to close its stream. The handle is consumed; events
    /// still in flight are discarded.
    pub fn end(self) {
        if self.commands.send(ClientCommand::End).is_err() {
            debug!("Client already stopped");
        }
    }

    /// Wait for the next event. Never resolves once the client has stopped
    /// and its queued events are drained.
    pub async fn next_event(&mut self) -> ClientEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    pub fn try_next_event(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }
}

impl ClientEnd {
    /// Returns false once the session dropped its handle.
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_flow_to_handle() {
        let (mut handle, end) = ClientHandle::pair();
        assert!(end.emit(ClientEvent::Stanza(Element::new("presence"))));
        match handle.next_event().await {
            ClientEvent::Stanza(s) => assert_eq!(s.name(), "presence"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_sender_reaches_client_until_dropped() {
        let (handle, mut end) = ClientHandle::pair();
        let sender = handle.sender();
        assert!(sender.send(Element::new("message")));
        handle.end();
        assert_eq!(
            end.commands.try_recv().unwrap(),
            ClientCommand::Send(Element::new("message"))
        );
        assert_eq!(end.commands.try_recv().unwrap(), ClientCommand::End);
        drop(end);
        assert!(!sender.send(Element::new("message")));
    }

    #[test]
    fn test_emit_fails_after_handle_dropped() {
        let (handle, end) = ClientHandle::pair();
        drop(handle);
        assert!(!end.emit(ClientEvent::Error(ClientError::Closed("gone".into()))));
    }
}
