//! Stanza boundaries in the server's XML byte stream.
//!
//! The server stream is one long document: `<stream:stream>` opens it,
//! top-level children are stanzas, `</stream:stream>` ends it. Reads arrive
//! in arbitrary chunks, so the reader accumulates bytes and repeatedly asks
//! [`next_fragment`] for the next complete piece.

use crate::error::StanzaError;
use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;

const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// One complete unit of the server stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// The stream header, XML declaration included.
    StreamOpen(String),
    StreamClose,
    Stanza(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    /// Between top-level elements.
    Idle,
    InStanza,
}

fn is_stream_name(qualified: &[u8], local: &[u8]) -> bool {
    local == b"stream" || qualified == b"stream:stream"
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Take the next complete fragment from the front of `buffer`.
///
/// Returns the fragment and the number of bytes it consumed, `Ok(None)` when
/// more data is needed, or an error when the bytes can never form XML.
pub fn next_fragment(buffer: &[u8]) -> Result<Option<(Fragment, usize)>, StanzaError> {
    // The closing tag arrives without its opening tag in the buffer.
    if let Some(start) = buffer.iter().position(|b| !b.is_ascii_whitespace()) {
        if buffer[start..].starts_with(STREAM_CLOSE) {
            return Ok(Some((Fragment::StreamClose, start + STREAM_CLOSE.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {}
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle
                    && is_stream_name(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Fragment::StreamOpen(bytes_to_string(&buffer[..end])), end)));
                }
                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    if is_stream_name(e.name().as_ref(), e.name().local_name().as_ref()) {
                        return Ok(Some((Fragment::StreamOpen(bytes_to_string(&buffer[..end])), end)));
                    }
                    return Ok(Some((Fragment::Stanza(bytes_to_string(&buffer[pos..end])), end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 && is_stream_name(e.name().as_ref(), e.name().local_name().as_ref()) {
                    return Ok(Some((Fragment::StreamClose, reader.buffer_position() as usize)));
                }
                depth = depth.saturating_sub(1);
                if state == ParserState::InStanza && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((
                        Fragment::Stanza(bytes_to_string(&buffer[stanza_start..end])),
                        end,
                    )));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // A construct cut off at the end of the buffer; the next read completes it.
            Err(quick_xml::Error::Syntax(
                SyntaxError::UnclosedTag
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedCData,
            )) => return Ok(None),
            Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup))
                if buffer.ends_with(b"<!") =>
            {
                return Ok(None)
            }
            Err(e) => return Err(StanzaError::Malformed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(buf: &[u8]) -> (String, usize) {
        match next_fragment(buf).unwrap() {
            Some((Fragment::Stanza(s), n)) => (s, n),
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_open_and_features_in_one_read() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s1' version='1.0'>\
<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>";
        let (open, consumed) = match next_fragment(buf).unwrap() {
            Some((Fragment::StreamOpen(s), n)) => (s, n),
            other => panic!("expected stream open, got {:?}", other),
        };
        assert!(open.contains("id='s1'"));
        let (features, rest) = stanza(&buf[consumed..]);
        assert!(features.starts_with("<stream:features>"));
        assert!(features.ends_with("</stream:features>"));
        assert_eq!(consumed + rest, buf.len());
    }

    #[test]
    fn test_cdata_split_across_reads() {
        let first = b"<message><body><![CDATA[hel";
        assert_eq!(next_fragment(first).unwrap(), None);

        let mut whole = first.to_vec();
        whole.extend_from_slice(b"lo]]></body></message>");
        let (text, consumed) = stanza(&whole);
        assert_eq!(text, "<message><body><![CDATA[hello]]></body></message>");
        assert_eq!(consumed, whole.len());
    }

    #[test]
    fn test_partial_declaration_and_comment_wait_for_more() {
        assert_eq!(next_fragment(b"<?xml vers").unwrap(), None);
        assert_eq!(next_fragment(b"<!-- hel").unwrap(), None);
        assert_eq!(next_fragment(b"<presence/><!").map(|f| f.map(|(_, n)| n)).unwrap(), Some(11));
        assert_eq!(next_fragment(b"<!").unwrap(), None);
    }

    #[test]
    fn test_self_closing_stanza() {
        assert_eq!(stanza(b"<presence/>"), ("<presence/>".to_string(), 11));
    }

    #[test]
    fn test_consecutive_stanzas() {
        let buf = b"<message to='a@b'><body>hi</body></message><presence/><iq type='result' id='1'/>";
        let (first, n1) = stanza(buf);
        assert_eq!(first, "<message to='a@b'><body>hi</body></message>");
        let (second, n2) = stanza(&buf[n1..]);
        assert_eq!(second, "<presence/>");
        let (third, n3) = stanza(&buf[n1 + n2..]);
        assert_eq!(third, "<iq type='result' id='1'/>");
        assert_eq!(n1 + n2 + n3, buf.len());
    }

    #[test]
    fn test_incomplete_stanza_needs_more_data() {
        assert_eq!(next_fragment(b"<iq type='result'><query xmlns='jabber:iq:roster'>").unwrap(), None);
        assert_eq!(next_fragment(b"<message to='a@b").unwrap(), None);
        assert_eq!(next_fragment(b"").unwrap(), None);
        assert_eq!(next_fragment(b"  \n").unwrap(), None);
    }

    #[test]
    fn test_stream_close() {
        assert_eq!(
            next_fragment(b"  </stream:stream>").unwrap(),
            Some((Fragment::StreamClose, 18))
        );
    }

    #[test]
    fn test_entities_and_cdata_kept_verbatim() {
        let (s, _) = stanza(b"<message><body>a &amp; b <![CDATA[<x>]]></body></message>");
        assert!(s.contains("&amp;"));
        assert!(s.contains("<![CDATA[<x>]]>"));
    }
}
