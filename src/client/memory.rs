//! In-process connector: every `connect` yields a [`MemoryClient`] the caller
//! drives by hand. Used by the session tests and for embedding the session
//! without a network.

use super::{BoundJid, ClientCommand, ClientEnd, ClientEvent, ClientHandle, Connector};
use crate::credentials::Credentials;
use crate::error::ClientError;
use crate::stanza::Element;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;

/// One client created by a [`MemoryConnector`].
pub struct MemoryClient {
    pub credentials: Credentials,
    end: ClientEnd,
    sent: Vec<Element>,
    ended: bool,
}

impl MemoryClient {
    pub fn online(&self, user: &str, domain: &str, resource: &str) -> bool {
        self.end.emit(ClientEvent::Online(BoundJid {
            user: user.to_string(),
            domain: domain.to_string(),
            resource: resource.to_string(),
        }))
    }

    pub fn stanza(&self, stanza: Element) -> bool {
        self.end.emit(ClientEvent::Stanza(stanza))
    }

    pub fn error(&self, err: ClientError) -> bool {
        self.end.emit(ClientEvent::Error(err))
    }

    fn drain(&mut self) {
        loop {
            match self.end.commands.try_recv() {
                Ok(ClientCommand::Send(stanza)) => self.sent.push(stanza),
                Ok(ClientCommand::End) => self.ended = true,
                Err(TryRecvError::Disconnected) => {
                    self.ended = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    /// Stanzas the session sent since the last call.
    pub fn take_sent(&mut self) -> Vec<Element> {
        self.drain();
        std::mem::take(&mut self.sent)
    }

    /// Whether the session ended this client or dropped its handle.
    pub fn is_ended(&mut self) -> bool {
        self.drain();
        self.ended
    }
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    clients: Arc<Mutex<Vec<MemoryClient>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every client created so far, oldest first.
    pub fn clients(&self) -> MutexGuard<'_, Vec<MemoryClient>> {
        self.clients.lock()
    }

    pub fn attempts(&self) -> usize {
        self.clients.lock().len()
    }

    /// Clients whose session side is still live.
    pub fn live(&self) -> usize {
        self.clients
            .lock()
            .iter_mut()
            .map(MemoryClient::is_ended)
            .filter(|ended| !ended)
            .count()
    }
}

impl Connector for MemoryConnector {
    fn connect(&mut self, credentials: Credentials) -> ClientHandle {
        let (handle, end) = ClientHandle::pair();
        self.clients.lock().push(MemoryClient {
            credentials,
            end,
            sent: Vec::new(),
            ended: false,
        });
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            jid: "bob@example.com".to_string(),
            password: Some("x".to_string()),
            resource: None,
            host: None,
            preferred_mechanism: None,
            register: false,
        }
    }

    #[test]
    fn test_live_counts_clients_not_ended() {
        let mut connector = MemoryConnector::new();
        let first = connector.connect(credentials());
        let _second = connector.connect(credentials());
        assert_eq!(connector.attempts(), 2);
        assert_eq!(connector.live(), 2);

        first.end();
        assert_eq!(connector.live(), 1);
        assert!(connector.clients()[0].is_ended());
    }

    #[test]
    fn test_dropped_handle_counts_as_ended() {
        let mut connector = MemoryConnector::new();
        drop(connector.connect(credentials()));
        assert_eq!(connector.live(), 0);
    }

    #[test]
    fn test_sent_stanzas_are_collected() {
        let mut connector = MemoryConnector::new();
        let handle = connector.connect(credentials());
        assert!(handle.send(Element::new("presence")));
        let sent = connector.clients()[0].take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name(), "presence");
        assert!(connector.clients()[0].take_sent().is_empty());
    }
}
