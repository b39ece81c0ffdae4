//! Minimal streaming-XML framing for the hub connection.
//!
//! This is not a general XML parser.  It handles exactly what the hub's
//! stream dialect needs: the XML declaration, the unterminated
//! `<stream:stream …>` open tag, complete depth-1 stanzas with attributes,
//! children, text and CDATA sections, and the five predefined entities.
//! Anything beyond that is a [`XmlError::Malformed`] stream error.
//!
//! The parser is incremental: bytes are appended with
//! [`XmlParser::push_bytes`] and [`XmlParser::next_event`] returns `Ok(None)`
//! until a whole event is buffered, so a stanza split across TCP segments is
//! reassembled transparently.

use std::fmt::Write as _;

use thiserror::Error;

/// Error type for stream framing.
#[derive(Debug, Error, PartialEq)]
pub enum XmlError {
    #[error("malformed stream: {0}")]
    Malformed(String),
}

/// A parsed element: name, attributes, text content, and child elements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// The element name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.attrs.push((name, value));
        }
    }

    /// First child whose local name matches.
    pub fn child(&self, local: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name() == local)
    }

    /// Serialises the element, escaping text and attribute values.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            let _ = write!(out, " {k}=\"{}\"", escape(v));
        }
        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(&self.text));
        for child in &self.children {
            child.write_into(out);
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

/// One framing event from the inbound byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlEvent {
    /// A `<stream:stream …>` open tag (its close tag arrives much later).
    StreamOpen(XmlElement),
    /// The `</stream:stream>` close tag.
    StreamClose,
    /// A complete depth-1 element.
    Stanza(XmlElement),
}

/// Incremental stream parser.
#[derive(Debug, Default)]
pub struct XmlParser {
    buf: Vec<u8>,
    pos: usize,
}

impl XmlParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete event, or `Ok(None)` when more bytes are
    /// needed.
    ///
    /// # Errors
    ///
    /// [`XmlError::Malformed`] when the buffered bytes cannot be part of a
    /// well-formed stream (mismatched close tag, broken attribute, …).
    pub fn next_event(&mut self) -> Result<Option<XmlEvent>, XmlError> {
        loop {
            let mut s = Scanner {
                data: &self.buf,
                pos: self.pos,
            };
            // Inter-stanza bytes are whitespace keepalives; skip to the
            // next tag.
            while s.peek().is_some_and(|b| b != b'<') {
                s.pos += 1;
            }
            self.pos = s.pos;
            if s.peek().is_none() {
                self.compact();
                return Ok(None);
            }

            // XML declaration / processing instruction.
            if s.starts_with("<?") {
                match s.find_from("?>") {
                    Some(end) => {
                        self.pos = end + 2;
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            // A close tag at depth 0 can only be the stream close.
            if s.starts_with("</") {
                s.pos += 2;
                let Some(name) = s.read_name() else {
                    return Ok(None);
                };
                s.skip_ws();
                match s.peek() {
                    None => return Ok(None),
                    Some(b'>') => s.pos += 1,
                    Some(c) => {
                        return Err(XmlError::Malformed(format!(
                            "unexpected byte {:?} in close tag",
                            c as char
                        )))
                    }
                }
                if local(&name) != "stream" {
                    return Err(XmlError::Malformed(format!(
                        "unexpected close tag </{name}> at stream depth"
                    )));
                }
                self.pos = s.pos;
                self.compact();
                return Ok(Some(XmlEvent::StreamClose));
            }

            let Some((mut element, end)) = parse_tag_header(&mut s)? else {
                return Ok(None);
            };
            let event = match end {
                TagEnd::SelfClosed => stanza_or_stream_open(element),
                TagEnd::Open if local(&element.name) == "stream" => {
                    // The stream tag stays open for the whole session; its
                    // children are the depth-1 stanzas.
                    XmlEvent::StreamOpen(element)
                }
                TagEnd::Open => {
                    if parse_content(&mut s, &mut element)?.is_none() {
                        return Ok(None);
                    }
                    XmlEvent::Stanza(element)
                }
            };
            self.pos = s.pos;
            self.compact();
            return Ok(Some(event));
        }
    }

    fn compact(&mut self) {
        if self.pos >= 4096 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

fn stanza_or_stream_open(element: XmlElement) -> XmlEvent {
    if local(&element.name) == "stream" {
        XmlEvent::StreamOpen(element)
    } else {
        XmlEvent::Stanza(element)
    }
}

fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

enum TagEnd {
    Open,
    SelfClosed,
}

struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.data[self.pos..].starts_with(s.as_bytes())
    }

    fn skip_ws(&mut self) {
        while self
            .peek()
            .is_some_and(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        {
            self.pos += 1;
        }
    }

    /// Byte offset of `needle` at or after the cursor.
    fn find_from(&self, needle: &str) -> Option<usize> {
        let bytes = needle.as_bytes();
        self.data[self.pos..]
            .windows(bytes.len())
            .position(|w| w == bytes)
            .map(|i| self.pos + i)
    }

    /// Reads a tag or attribute name.  `None` when the buffer ends before a
    /// delimiter, meaning the name may be truncated.
    fn read_name(&mut self) -> Option<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'=' | b'>' | b'/') {
                let name = String::from_utf8_lossy(&self.data[start..self.pos]).into_owned();
                return (!name.is_empty()).then_some(name);
            }
            self.pos += 1;
        }
        None
    }
}

/// Parses `<name attr="v" …` up to and including the `>` or `/>`.
fn parse_tag_header(s: &mut Scanner) -> Result<Option<(XmlElement, TagEnd)>, XmlError> {
    debug_assert_eq!(s.peek(), Some(b'<'));
    s.pos += 1;
    let Some(name) = s.read_name() else {
        return Ok(None);
    };
    let mut element = XmlElement::new(name);
    loop {
        s.skip_ws();
        match s.peek() {
            None => return Ok(None),
            Some(b'>') => {
                s.pos += 1;
                return Ok(Some((element, TagEnd::Open)));
            }
            Some(b'/') => {
                if s.starts_with("/>") {
                    s.pos += 2;
                    return Ok(Some((element, TagEnd::SelfClosed)));
                }
                if s.pos + 1 >= s.data.len() {
                    return Ok(None);
                }
                return Err(XmlError::Malformed("stray '/' in tag".to_string()));
            }
            Some(_) => {
                let Some(attr_name) = s.read_name() else {
                    return Ok(None);
                };
                s.skip_ws();
                match s.peek() {
                    None => return Ok(None),
                    Some(b'=') => s.pos += 1,
                    Some(c) => {
                        return Err(XmlError::Malformed(format!(
                            "expected '=' after attribute {attr_name}, got {:?}",
                            c as char
                        )))
                    }
                }
                s.skip_ws();
                let quote = match s.peek() {
                    None => return Ok(None),
                    Some(q @ (b'"' | b'\'')) => q,
                    Some(c) => {
                        return Err(XmlError::Malformed(format!(
                            "unquoted attribute value (got {:?})",
                            c as char
                        )))
                    }
                };
                s.pos += 1;
                let start = s.pos;
                let Some(end) = s.data[s.pos..].iter().position(|&b| b == quote) else {
                    return Ok(None);
                };
                let raw = String::from_utf8_lossy(&s.data[start..start + end]).into_owned();
                element.attrs.push((attr_name, unescape(&raw)));
                s.pos = start + end + 1;
            }
        }
    }
}

/// Parses element content up to and including the matching close tag.
/// `Ok(None)` when the buffer ends first.
fn parse_content(s: &mut Scanner, element: &mut XmlElement) -> Result<Option<()>, XmlError> {
    loop {
        match s.peek() {
            None => return Ok(None),
            Some(b'<') => {
                if s.starts_with("</") {
                    s.pos += 2;
                    let Some(close) = s.read_name() else {
                        return Ok(None);
                    };
                    s.skip_ws();
                    match s.peek() {
                        None => return Ok(None),
                        Some(b'>') => s.pos += 1,
                        Some(c) => {
                            return Err(XmlError::Malformed(format!(
                                "unexpected byte {:?} in close tag",
                                c as char
                            )))
                        }
                    }
                    if close != element.name {
                        return Err(XmlError::Malformed(format!(
                            "close tag </{close}> does not match <{}>",
                            element.name
                        )));
                    }
                    return Ok(Some(()));
                }
                if s.starts_with("<![CDATA[") {
                    s.pos += "<![CDATA[".len();
                    let Some(end) = s.find_from("]]>") else {
                        return Ok(None);
                    };
                    element
                        .text
                        .push_str(&String::from_utf8_lossy(&s.data[s.pos..end]));
                    s.pos = end + 3;
                    continue;
                }
                let Some((mut child, end)) = parse_tag_header(s)? else {
                    return Ok(None);
                };
                if matches!(end, TagEnd::Open) && parse_content(s, &mut child)?.is_none() {
                    return Ok(None);
                }
                element.children.push(child);
            }
            Some(_) => {
                let Some(next_tag) = s.find_from("<") else {
                    return Ok(None);
                };
                element
                    .text
                    .push_str(&unescape(&String::from_utf8_lossy(&s.data[s.pos..next_tag])));
                s.pos = next_tag;
            }
        }
    }
}

// ── Entity handling ───────────────────────────────────────────────────────────

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let entity = rest.find(';').map(|semi| &rest[..=semi]);
        let (replacement, consumed) = match entity {
            Some("&lt;") => ("<", 4),
            Some("&gt;") => (">", 4),
            Some("&amp;") => ("&", 5),
            Some("&apos;") => ("'", 6),
            Some("&quot;") => ("\"", 6),
            // Unknown entity: keep the ampersand literally.
            _ => ("&", 1),
        };
        out.push_str(replacement);
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(input: &str) -> XmlEvent {
        let mut parser = XmlParser::new();
        parser.push_bytes(input.as_bytes());
        parser
            .next_event()
            .expect("parse")
            .expect("expected a complete event")
    }

    #[test]
    fn test_self_closing_stanza() {
        let XmlEvent::Stanza(el) = parse_one("<iq/>") else {
            panic!("expected stanza");
        };
        assert_eq!(el.name, "iq");
        assert!(el.attrs.is_empty());
    }

    #[test]
    fn test_stanza_with_attributes_both_quote_styles() {
        let XmlEvent::Stanza(el) = parse_one(r#"<iq id='42' type="get"></iq>"#) else {
            panic!("expected stanza");
        };
        assert_eq!(el.attr("id"), Some("42"));
        assert_eq!(el.attr("type"), Some("get"));
    }

    #[test]
    fn test_stream_open_is_reported_without_waiting_for_close() {
        let input = "<stream:stream from='harmonyhub' id='068adbb1' version='1.0' \
                     xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";
        let XmlEvent::StreamOpen(el) = parse_one(input) else {
            panic!("expected stream open");
        };
        assert_eq!(el.local_name(), "stream");
        assert_eq!(el.attr("from"), Some("harmonyhub"));
    }

    #[test]
    fn test_xml_declaration_is_skipped() {
        let XmlEvent::Stanza(el) = parse_one("<?xml version='1.0'?><presence/>") else {
            panic!("expected stanza");
        };
        assert_eq!(el.name, "presence");
    }

    #[test]
    fn test_stream_close() {
        let mut parser = XmlParser::new();
        parser.push_bytes(b"</stream:stream>");
        assert_eq!(parser.next_event().unwrap(), Some(XmlEvent::StreamClose));
    }

    #[test]
    fn test_nested_children_and_text() {
        let input = "<iq id='1' type='result'>\
                     <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>1111/auth</jid></bind>\
                     </iq>";
        let XmlEvent::Stanza(el) = parse_one(input) else {
            panic!("expected stanza");
        };
        let jid = el.child("bind").and_then(|b| b.child("jid")).expect("jid");
        assert_eq!(jid.text, "1111/auth");
    }

    #[test]
    fn test_cdata_is_taken_verbatim() {
        let XmlEvent::Stanza(el) = parse_one("<oa mime='x'><![CDATA[a=1:b=<raw>]]></oa>") else {
            panic!("expected stanza");
        };
        assert_eq!(el.text, "a=1:b=<raw>");
    }

    #[test]
    fn test_entities_are_unescaped_in_text_and_attrs() {
        let XmlEvent::Stanza(el) = parse_one("<m note='a&amp;b'>1 &lt; 2</m>") else {
            panic!("expected stanza");
        };
        assert_eq!(el.attr("note"), Some("a&b"));
        assert_eq!(el.text, "1 < 2");
    }

    #[test]
    fn test_incremental_feeding_reassembles_split_stanza() {
        let mut parser = XmlParser::new();
        parser.push_bytes(b"<iq id='9' type='ge");
        assert_eq!(parser.next_event().unwrap(), None);
        parser.push_bytes(b"t'><oa mime='m'>k=v</oa></i");
        assert_eq!(parser.next_event().unwrap(), None);
        parser.push_bytes(b"q>");
        let Some(XmlEvent::Stanza(el)) = parser.next_event().unwrap() else {
            panic!("expected stanza after final bytes");
        };
        assert_eq!(el.attr("id"), Some("9"));
        assert_eq!(el.child("oa").map(|o| o.text.as_str()), Some("k=v"));
    }

    #[test]
    fn test_whitespace_keepalives_between_stanzas_are_ignored() {
        let mut parser = XmlParser::new();
        parser.push_bytes(b"  \n <iq/> \n ");
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(XmlEvent::Stanza(_))
        ));
        assert_eq!(parser.next_event().unwrap(), None);
    }

    #[test]
    fn test_mismatched_close_tag_is_malformed() {
        let mut parser = XmlParser::new();
        parser.push_bytes(b"<iq><oa></iq></oa>");
        assert!(parser.next_event().is_err());
    }

    #[test]
    fn test_multiple_stanzas_in_one_buffer() {
        let mut parser = XmlParser::new();
        parser.push_bytes(b"<a/><b/>");
        let Some(XmlEvent::Stanza(a)) = parser.next_event().unwrap() else {
            panic!("first");
        };
        let Some(XmlEvent::Stanza(b)) = parser.next_event().unwrap() else {
            panic!("second");
        };
        assert_eq!(a.name, "a");
        assert_eq!(b.name, "b");
    }

    #[test]
    fn test_to_xml_round_trips_through_parser() {
        let el = XmlElement::new("iq")
            .with_attr("type", "get")
            .with_attr("id", "stanza-7")
            .with_child(
                XmlElement::new("oa")
                    .with_attr("xmlns", "connect.logitech.com")
                    .with_attr("mime", "vnd.logitech.connect/vnd.logitech.pair")
                    .with_text("method=pair:name=x#y"),
            );
        let XmlEvent::Stanza(parsed) = parse_one(&el.to_xml()) else {
            panic!("expected stanza");
        };
        assert_eq!(parsed, el);
    }

    #[test]
    fn test_to_xml_escapes_attribute_values_and_text() {
        let el = XmlElement::new("m")
            .with_attr("a", "x\"y")
            .with_text("1 < 2 & 3");
        let rendered = el.to_xml();
        assert!(rendered.contains("&quot;"), "got {rendered}");
        assert!(rendered.contains("1 &lt; 2 &amp; 3"), "got {rendered}");
    }
}
