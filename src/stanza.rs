//! Owned XML element tree for stanzas exchanged with the XMPP server.
//!
//! Parsing and serialization go through quick-xml. The tree keeps qualified
//! names as written on the wire (e.g. `stream:features`) and attributes in
//! document order; namespaces are not resolved, `ns()` only reports the
//! element's own `xmlns` attribute.

use crate::error::StanzaError;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Qualified name as it appeared on the wire.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without any `prefix:`.
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// The correlation identifier, if present and non-empty.
    pub fn id(&self) -> Option<&str> {
        self.attr("id").filter(|id| !id.is_empty())
    }

    pub fn ns(&self) -> Option<&str> {
        self.attr("xmlns")
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.push_child(child);
        self
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        self.children.push(Node::Text(text.into()));
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.push_text(text);
        self
    }

    /// Direct element children, skipping text nodes.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First direct child with the given local name and, when given, `xmlns`.
    pub fn get_child(&self, name: &str, ns: Option<&str>) -> Option<&Element> {
        self.children()
            .find(|c| c.local_name() == name && (ns.is_none() || c.ns() == ns))
    }

    /// Whether any direct child declares the given namespace.
    pub fn has_child_ns(&self, ns: &str) -> bool {
        self.children().any(|c| c.ns() == Some(ns))
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// All character data in document order, descendants included.
    pub fn deep_text(&self) -> String {
        let mut text = String::new();
        self.collect_text(&mut text);
        text
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.collect_text(out),
            }
        }
    }

    pub fn child_text(&self, name: &str) -> Option<String> {
        self.get_child(name, None).map(Element::text)
    }

    /// Parse exactly one complete element from `xml`.
    ///
    /// Leading declarations, comments and whitespace are skipped. An element
    /// that is opened but never closed (such as a stream header) yields
    /// `StanzaError::Incomplete`.
    pub fn parse(xml: &str) -> Result<Element, StanzaError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Element> = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => stack.push(element_from_start(&e)?),
                Ok(Event::Empty(e)) => {
                    let element = element_from_start(&e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.push_child(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| StanzaError::Malformed("unbalanced end tag".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.push_child(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::Text(t)) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = t
                            .unescape()
                            .map_err(|e| StanzaError::Malformed(e.to_string()))?;
                        if !text.is_empty() {
                            parent.push_text(text.into_owned());
                        }
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.push_text(String::from_utf8_lossy(&c.into_inner()).into_owned());
                    }
                }
                Ok(Event::Eof) => return Err(StanzaError::Incomplete),
                Ok(_) => {}
                Err(e) => return Err(StanzaError::Malformed(e.to_string())),
            }
        }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, StanzaError> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(|e| StanzaError::Malformed(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| StanzaError::Malformed(e.to_string()))?
            .into_owned();
        element.attrs.push((key, value));
    }
    Ok(element)
}

impl FromStr for Element {
    type Err = StanzaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Element::parse(s)
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        for (key, value) in &self.attrs {
            write!(f, " {}=\"{}\"", key, escape(value.as_str()))?;
        }
        if self.children.is_empty() {
            return f.write_str("/>");
        }
        f.write_str(">")?;
        for child in &self.children {
            match child {
                Node::Element(e) => write!(f, "{}", e)?,
                Node::Text(t) => f.write_str(&escape(t.as_str()))?,
            }
        }
        write!(f, "</{}>", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roster_result() {
        let iq = Element::parse(
            "<iq type='result' id='r1'><query xmlns='jabber:iq:roster'>\
             <item jid='alice@example.com' name='Alice'><group>Friends</group></item>\
             </query></iq>",
        )
        .unwrap();
        assert_eq!(iq.name(), "iq");
        assert_eq!(iq.id(), Some("r1"));
        let query = iq.get_child("query", Some("jabber:iq:roster")).unwrap();
        let item = query.children().next().unwrap();
        assert_eq!(item.attr("name"), Some("Alice"));
        assert_eq!(item.child_text("group").as_deref(), Some("Friends"));
    }

    #[test]
    fn test_parse_unescapes_text_and_attributes() {
        let msg = Element::parse(
            r#"<message from="a&amp;b@example.com"><body>1 &lt; 2</body></message>"#,
        )
        .unwrap();
        assert_eq!(msg.attr("from"), Some("a&b@example.com"));
        assert_eq!(msg.child_text("body").as_deref(), Some("1 < 2"));
    }

    #[test]
    fn test_parse_skips_declaration() {
        let el = Element::parse("<?xml version='1.0'?> <presence/>").unwrap();
        assert_eq!(el.name(), "presence");
    }

    #[test]
    fn test_unclosed_element_is_incomplete() {
        let err = Element::parse("<stream:stream xmlns='jabber:client'>").unwrap_err();
        assert!(matches!(err, StanzaError::Incomplete));
    }

    #[test]
    fn test_deep_text_walks_descendants() {
        let el: Element = "<p title='a &gt; b'>one <em>two</em> three &amp; <br/>four</p>"
            .parse()
            .unwrap();
        assert_eq!(el.text(), "one  three & four");
        assert_eq!(el.deep_text(), "one two three & four");
    }

    #[test]
    fn test_empty_id_is_not_an_identifier() {
        let el = Element::new("iq").with_attr("id", "");
        assert_eq!(el.id(), None);
    }

    #[test]
    fn test_serialize_escapes() {
        let msg = Element::new("message")
            .with_attr("to", "bob@example.com")
            .with_child(Element::new("body").with_text("<hi> & \"bye\""));
        let xml = msg.to_string();
        assert!(xml.starts_with(r#"<message to="bob@example.com"><body>"#));
        assert!(xml.contains("&lt;hi&gt; &amp;"));
        let reparsed = Element::parse(&xml).unwrap();
        assert_eq!(reparsed.child_text("body").as_deref(), Some("<hi> & \"bye\""));
    }

    #[test]
    fn test_set_attr_replaces_existing() {
        let mut el = Element::new("iq").with_attr("type", "get");
        el.set_attr("type", "result");
        assert_eq!(el.attr("type"), Some("result"));
        assert_eq!(el.to_string(), r#"<iq type="result"/>"#);
    }

    #[test]
    fn test_local_name_strips_prefix() {
        let el = Element::parse("<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>").unwrap();
        assert_eq!(el.local_name(), "features");
        assert!(el.has_child_ns("urn:ietf:params:xml:ns:xmpp-bind"));
    }
}
