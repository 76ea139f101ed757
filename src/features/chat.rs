//! One-to-one chat messages, with optional XHTML-IM bodies (XEP-0071).

use super::client_error;
use crate::listener::Listener;
use crate::session::SessionHandle;
use crate::socket::Ack;
use crate::stanza::Element;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const EVENT_CHAT_MESSAGE: &str = "xmpp.chat.message";

pub const NS_CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
pub const NS_XHTML_IM: &str = "http://jabber.org/protocol/xhtml-im";
const NS_XHTML: &str = "http://www.w3.org/1999/xhtml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatRequest {
    to: Option<String>,
    content: Option<String>,
    /// `xhtml` sends `content` as XHTML-IM; anything else is plain text.
    format: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn build_message(request: &ChatRequest) -> Result<Element, &'static str> {
    let content = request
        .content
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or("Message content not provided")?;
    let to = request.to.as_deref().ok_or("Missing 'to' key")?;

    let mut message = Element::new("message")
        .with_attr("to", to)
        .with_attr("type", request.kind.as_deref().unwrap_or("chat"));
    match request.format.as_deref() {
        Some("xhtml") => {
            let rich: Element = content
                .parse::<Element>()
                .map_err(|_| "Can not parse XHTML message")?;
            message.push_child(Element::new("body").with_text(rich.deep_text()));
            message.push_child(
                Element::new("html").with_attr("xmlns", NS_XHTML_IM).with_child(
                    Element::new("body")
                        .with_attr("xmlns", NS_XHTML)
                        .with_child(rich),
                ),
            );
        }
        _ => message.push_child(Element::new("body").with_text(content)),
    }
    Ok(message)
}

fn send_message(session: &SessionHandle, data: Value, ack: Option<Ack>) {
    let request: ChatRequest = serde_json::from_value(data.clone()).unwrap_or_default();
    let message = match build_message(&request) {
        Ok(message) => message,
        Err(description) => return client_error(session, ack, description, data),
    };
    let sent = session.send(message);
    match (ack, sent) {
        (Some(ack), true) => ack.ok(json!(true)),
        (ack, false) => client_error(session, ack, "Not connected", data),
        (None, true) => {}
    }
}

#[derive(Default)]
pub struct ChatListener {
    session: Option<SessionHandle>,
}

impl Listener for ChatListener {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn init(&mut self, session: SessionHandle) {
        session.on(EVENT_CHAT_MESSAGE, Arc::new(send_message));
        self.session = Some(session);
    }

    fn unregister_events(&mut self) {
        if let Some(session) = self.session.take() {
            session.off(EVENT_CHAT_MESSAGE);
        }
    }

    fn handles(&self, stanza: &Element) -> bool {
        stanza.name() == "message"
            && matches!(stanza.attr("type"), None | Some("chat") | Some("normal"))
            && stanza.get_child("body", None).is_some()
    }

    /// A message that also carries a chat state is left for later listeners.
    fn handle(&mut self, stanza: &Element) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let mut data = Map::new();
        data.insert("from".to_string(), json!(stanza.attr("from").unwrap_or_default()));
        data.insert(
            "content".to_string(),
            json!(stanza.child_text("body").unwrap_or_default()),
        );
        if let Some(id) = stanza.id() {
            data.insert("id".to_string(), json!(id));
        }
        session.emit(EVENT_CHAT_MESSAGE, Value::Object(data));
        !stanza.has_child_ns(NS_CHATSTATES)
    }
}
