//! Contact list (RFC 6121 §2): roster retrieval and server pushes.

use super::{client_error, stanza_error};
use crate::error::ReplyError;
use crate::listener::Listener;
use crate::session::SessionHandle;
use crate::socket::Ack;
use crate::stanza::Element;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const NS_ROSTER: &str = "jabber:iq:roster";

pub const EVENT_ROSTER_GET: &str = "xmpp.roster.get";
pub const EVENT_ROSTER_PUSH: &str = "xmpp.roster.push";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterItem {
    pub jid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<String>,
    pub groups: Vec<String>,
}

impl RosterItem {
    /// `None` for an `<item/>` without a `jid`.
    pub fn from_element(item: &Element) -> Option<Self> {
        Some(Self {
            jid: item.attr("jid")?.to_string(),
            name: item.attr("name").map(str::to_string),
            subscription: item.attr("subscription").map(str::to_string),
            ask: item.attr("ask").map(str::to_string),
            groups: item
                .children()
                .filter(|c| c.local_name() == "group")
                .map(Element::text)
                .collect(),
        })
    }
}

/// Items of a roster `<query/>`.
pub fn parse_items(query: &Element) -> Vec<RosterItem> {
    query
        .children()
        .filter(|c| c.local_name() == "item")
        .filter_map(RosterItem::from_element)
        .collect()
}

fn get_roster(session: &SessionHandle, data: Value, ack: Option<Ack>) {
    let Some(ack) = ack else {
        return client_error(session, None, "Missing callback", data);
    };
    if session.full_jid().is_none() {
        return client_error(session, Some(ack), "Not connected", data);
    }
    let iq = Element::new("iq")
        .with_attr("type", "get")
        .with_child(Element::new("query").with_attr("xmlns", NS_ROSTER));
    session.request(
        iq,
        Box::new(move |reply: Result<&Element, ReplyError>| {
            let reply = match reply {
                Ok(reply) => reply,
                Err(err) => return ack.err(err.notification().to_value()),
            };
            if reply.attr("type") == Some("error") {
                return ack.err(stanza_error(reply).to_value());
            }
            let items = reply
                .get_child("query", Some(NS_ROSTER))
                .map(parse_items)
                .unwrap_or_default();
            ack.ok(json!(items));
        }),
    );
}

#[derive(Default)]
pub struct RosterListener {
    session: Option<SessionHandle>,
}

impl RosterListener {
    /// A push is only trusted from the account itself (RFC 6121 §2.1.6).
    fn push_from_account(&self, session: &SessionHandle, stanza: &Element) -> bool {
        match stanza.attr("from") {
            None => true,
            Some(from) => session.bare_jid().as_deref() == Some(from),
        }
    }
}

impl Listener for RosterListener {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn init(&mut self, session: SessionHandle) {
        session.on(EVENT_ROSTER_GET, Arc::new(get_roster));
        self.session = Some(session);
    }

    fn unregister_events(&mut self) {
        if let Some(session) = self.session.take() {
            session.off(EVENT_ROSTER_GET);
        }
    }

    fn handles(&self, stanza: &Element) -> bool {
        stanza.name() == "iq" && stanza.get_child("query", Some(NS_ROSTER)).is_some()
    }

    fn handle(&mut self, stanza: &Element) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if stanza.attr("type") != Some("set") {
            debug!(stanza = %stanza, "Ignoring untracked roster iq");
            return true;
        }
        if !self.push_from_account(session, stanza) {
            warn!(from = stanza.attr("from"), "Ignoring roster push from foreign address");
            return true;
        }

        let mut result = Element::new("iq").with_attr("type", "result");
        if let Some(id) = stanza.id() {
            result.set_attr("id", id);
        }
        session.send(result);

        if let Some(query) = stanza.get_child("query", Some(NS_ROSTER)) {
            for item in parse_items(query) {
                session.emit(EVENT_ROSTER_PUSH, json!(item));
            }
        }
        true
    }
}
