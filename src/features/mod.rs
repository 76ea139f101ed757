//! Default feature listeners.

pub mod chat;
pub mod presence;
pub mod roster;

pub use chat::ChatListener;
pub use presence::PresenceListener;
pub use roster::RosterListener;

use crate::error::ErrorNotification;
use crate::listener::Listener;
use crate::session::{SessionHandle, EVENT_ERROR};
use crate::socket::Ack;
use crate::stanza::Element;
use serde_json::Value;

/// The default chain, in precedence order.
pub fn default_listeners() -> Vec<Box<dyn Listener>> {
    vec![
        Box::new(RosterListener::default()),
        Box::new(PresenceListener::default()),
        Box::new(ChatListener::default()),
    ]
}

/// Reject a malformed socket request: through its ack when there is one,
/// as `xmpp.error` otherwise.
pub(crate) fn client_error(session: &SessionHandle, ack: Option<Ack>, description: &str, request: Value) {
    let note = ErrorNotification::new("modify", "client-error", description)
        .with_request(request)
        .to_value();
    match ack {
        Some(ack) => ack.err(note),
        None => session.emit(EVENT_ERROR, note),
    }
}

/// Socket view of an `<error/>` carried by a stanza of type `error`.
pub(crate) fn stanza_error(stanza: &Element) -> ErrorNotification {
    let error = stanza.get_child("error", None);
    let kind = error.and_then(|e| e.attr("type")).unwrap_or("cancel");
    let condition = error
        .and_then(|e| e.children().find(|c| c.local_name() != "text"))
        .map(|c| c.local_name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let description = error
        .and_then(|e| e.child_text("text"))
        .unwrap_or_else(|| condition.clone());
    ErrorNotification::new(kind, &condition, description)
}
