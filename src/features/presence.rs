//! Presence broadcast and subscription handling (RFC 6121 §3-4).

use super::{client_error, stanza_error};
use crate::listener::Listener;
use crate::session::SessionHandle;
use crate::socket::Ack;
use crate::stanza::Element;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

pub const EVENT_PRESENCE: &str = "xmpp.presence";
pub const EVENT_PRESENCE_SUBSCRIBE: &str = "xmpp.presence.subscribe";
pub const EVENT_PRESENCE_SUBSCRIPTION: &str = "xmpp.presence.subscription";
pub const EVENT_PRESENCE_ERROR: &str = "xmpp.presence.error";

const SHOW_VALUES: [&str; 4] = ["away", "chat", "dnd", "xa"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PresenceRequest {
    to: Option<String>,
    show: Option<String>,
    status: Option<String>,
    priority: Option<i8>,
}

/// Outbound presence for a `xmpp.presence` request. `online` and no `show`
/// mean plain availability, `offline` means unavailable.
fn build_presence(request: &PresenceRequest) -> Result<Element, &'static str> {
    let mut presence = Element::new("presence");
    if let Some(to) = &request.to {
        presence.set_attr("to", to.as_str());
    }
    match request.show.as_deref() {
        None | Some("online") => {}
        Some("offline") => presence.set_attr("type", "unavailable"),
        Some(show) if SHOW_VALUES.contains(&show) => {
            presence.push_child(Element::new("show").with_text(show))
        }
        Some(_) => return Err("Invalid show value"),
    }
    if let Some(status) = &request.status {
        presence.push_child(Element::new("status").with_text(status.as_str()));
    }
    if let Some(priority) = request.priority {
        presence.push_child(Element::new("priority").with_text(priority.to_string()));
    }
    Ok(presence)
}

fn reply_sent(session: &SessionHandle, ack: Option<Ack>, sent: bool, data: Value) {
    match (ack, sent) {
        (Some(ack), true) => ack.ok(json!(true)),
        (ack, false) => client_error(session, ack, "Not connected", data),
        (None, true) => {}
    }
}

fn send_presence(session: &SessionHandle, data: Value, ack: Option<Ack>) {
    let request: PresenceRequest = match serde_json::from_value(data.clone()) {
        Ok(request) => request,
        Err(_) if data.is_null() => PresenceRequest::default(),
        Err(_) => return client_error(session, ack, "Invalid presence request", data),
    };
    match build_presence(&request) {
        Ok(presence) => {
            let sent = session.send(presence);
            reply_sent(session, ack, sent, data);
        }
        Err(description) => client_error(session, ack, description, data),
    }
}

fn subscribe(session: &SessionHandle, data: Value, ack: Option<Ack>) {
    let Some(to) = data.get("to").and_then(Value::as_str) else {
        return client_error(session, ack, "Missing 'to' key", data);
    };
    let presence = Element::new("presence")
        .with_attr("type", "subscribe")
        .with_attr("to", to);
    let sent = session.send(presence);
    reply_sent(session, ack, sent, data);
}

#[derive(Default)]
pub struct PresenceListener {
    session: Option<SessionHandle>,
}

impl Listener for PresenceListener {
    fn name(&self) -> &'static str {
        "presence"
    }

    fn init(&mut self, session: SessionHandle) {
        session.on(EVENT_PRESENCE, Arc::new(send_presence));
        session.on(EVENT_PRESENCE_SUBSCRIBE, Arc::new(subscribe));
        self.session = Some(session);
    }

    fn unregister_events(&mut self) {
        if let Some(session) = self.session.take() {
            session.off(EVENT_PRESENCE);
            session.off(EVENT_PRESENCE_SUBSCRIBE);
        }
    }

    fn handles(&self, stanza: &Element) -> bool {
        stanza.name() == "presence"
    }

    fn handle(&mut self, stanza: &Element) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let from = stanza.attr("from").unwrap_or_default();
        match stanza.attr("type") {
            Some("subscribe") => session.emit(EVENT_PRESENCE_SUBSCRIBE, json!({ "from": from })),
            Some(kind @ ("subscribed" | "unsubscribe" | "unsubscribed")) => session.emit(
                EVENT_PRESENCE_SUBSCRIPTION,
                json!({ "from": from, "type": kind }),
            ),
            Some("unavailable") => {
                session.emit(EVENT_PRESENCE, json!({ "from": from, "show": "offline" }))
            }
            Some("error") => session.emit(
                EVENT_PRESENCE_ERROR,
                json!({ "from": from, "error": stanza_error(stanza).to_value() }),
            ),
            Some("probe") => debug!(from, "Ignoring presence probe"),
            _ => {
                let mut data = Map::new();
                data.insert("from".to_string(), json!(from));
                data.insert(
                    "show".to_string(),
                    json!(stanza.child_text("show").unwrap_or_else(|| "online".to_string())),
                );
                if let Some(status) = stanza.child_text("status") {
                    data.insert("status".to_string(), json!(status));
                }
                if let Some(priority) = stanza
                    .child_text("priority")
                    .and_then(|p| p.trim().parse::<i8>().ok())
                {
                    data.insert("priority".to_string(), json!(priority));
                }
                session.emit(EVENT_PRESENCE, Value::Object(data));
            }
        }
        true
    }
}
