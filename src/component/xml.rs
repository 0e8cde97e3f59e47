//! Element tree for parsed stanzas.
//!
//! Fragments coming out of the tokenizer are wrapped in the captured stream header and
//! footer and parsed with quick-xml's namespace-aware reader, so every stanza is a
//! well-formed document of its own and inherits the stream's namespace declarations.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use std::borrow::Cow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed XML: {0}")]
    Parse(#[from] quick_xml::Error),
    #[error("malformed escape sequence: {0}")]
    Escape(#[from] quick_xml::escape::EscapeError),
    #[error("fragment contains no element")]
    Empty,
    #[error("stream header has no root element")]
    MissingStreamRoot,
}

/// A child of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// A parsed XML element with its namespace resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Qualified name as written, e.g. `qos:assured`.
    pub name: String,
    pub local_name: String,
    /// Resolved namespace URI, empty when unbound.
    pub namespace: String,
    /// Attributes in document order, namespace declarations included.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str, namespace: &str) -> Self {
        let local_name = name.rsplit_once(':').map_or(name, |(_, local)| local);
        Self {
            name: name.to_string(),
            local_name: local_name.to_string(),
            namespace: namespace.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.children.push(Node::Text(text.to_string()));
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value, or the empty string when absent.
    pub fn attr_or_empty(&self, name: &str) -> &str {
        self.attr(name).unwrap_or("")
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn first_element(&self) -> Option<&Element> {
        self.elements().next()
    }

    pub fn get_child(&self, local_name: &str, namespace: &str) -> Option<&Element> {
        self.elements()
            .find(|e| e.local_name == local_name && e.namespace == namespace)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    pub fn is(&self, local_name: &str, namespace: &str) -> bool {
        self.local_name == local_name && self.namespace == namespace
    }

    /// Serialize back to XML text.
    ///
    /// Only namespace declarations present on the element itself are written, so a
    /// namespace inherited from the stream root is not repeated.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    /// Serialized children only.
    pub fn inner_xml(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_xml(&mut out),
                Node::Text(t) => out.push_str(&encode(t)),
            }
        }
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&encode(v));
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&self.inner_xml());
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Escape text for use in element content or a quoted attribute value.
pub fn encode(s: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(s)
}

pub fn decode(s: &str) -> Result<Cow<'_, str>, XmlError> {
    Ok(quick_xml::escape::unescape(s)?)
}

/// The opening `<stream:stream>` element received from the server.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    /// Header text without any XML declaration.
    pub header: String,
    /// Matching closing tag.
    pub footer: String,
    pub id: Option<String>,
    pub from: Option<String>,
}

/// Parse the stream-open fragment.
pub fn parse_stream_header(fragment: &str) -> Result<StreamHeader, XmlError> {
    let mut s = fragment.trim_start();
    if s.starts_with("<?") {
        if let Some(end) = s.find("?>") {
            s = &s[end + 2..];
        }
    }
    let header = s.trim().to_string();

    let qualified = header
        .trim_start_matches('<')
        .split(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or(XmlError::MissingStreamRoot)?;
    let footer = format!("</{qualified}>");

    let document = format!("{header}{footer}");
    let mut reader = NsReader::from_str(&document);
    loop {
        match reader.read_resolved_event()? {
            (ns, Event::Start(start)) => {
                let root = element_from_start(&ns, &start)?;
                return Ok(StreamHeader {
                    id: root.attr("id").map(str::to_string),
                    from: root.attr("from").map(str::to_string),
                    header,
                    footer,
                });
            }
            (_, Event::Eof) => return Err(XmlError::MissingStreamRoot),
            _ => {}
        }
    }
}

/// Parse one top-level fragment in the context of the stream header.
pub fn parse_fragment(stream: &StreamHeader, fragment: &str) -> Result<Element, XmlError> {
    let document = format!("{}{}{}", stream.header, fragment, stream.footer);
    let mut reader = NsReader::from_str(&document);
    reader.config_mut().trim_text(false);

    let mut depth = 0usize;
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_resolved_event()? {
            (ns, Event::Start(start)) => {
                if depth > 0 {
                    stack.push(element_from_start(&ns, &start)?);
                }
                depth += 1;
            }
            (ns, Event::Empty(start)) => {
                if depth == 0 {
                    continue;
                }
                let element = element_from_start(&ns, &start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(element)),
                    None => return Ok(element),
                }
            }
            (_, Event::End(_)) => {
                depth = depth.saturating_sub(1);
                if let Some(element) = stack.pop() {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => return Ok(element),
                    }
                }
            }
            (_, Event::Text(text)) => {
                if let Some(parent) = stack.last_mut() {
                    let text = text.unescape()?;
                    push_text(parent, &text);
                }
            }
            (_, Event::CData(data)) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    push_text(parent, &text);
                }
            }
            (_, Event::Eof) => return Err(XmlError::Empty),
            _ => {}
        }
    }
}

fn push_text(parent: &mut Element, text: &str) {
    if let Some(Node::Text(last)) = parent.children.last_mut() {
        last.push_str(text);
    } else {
        parent.children.push(Node::Text(text.to_string()));
    }
}

fn element_from_start(ns: &ResolveResult<'_>, start: &BytesStart<'_>) -> Result<Element, XmlError> {
    let namespace = match ns {
        ResolveResult::Bound(Namespace(uri)) => String::from_utf8_lossy(uri).into_owned(),
        _ => String::new(),
    };
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        local_name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        namespace,
        attributes,
        children: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> StreamHeader {
        parse_stream_header(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:component:accept' xmlns:stream='http://etherx.jabber.org/streams' from='comp.example.org' id='3BF96D32'>",
        )
        .unwrap()
    }

    #[test]
    fn test_stream_header_attributes() {
        let h = header();
        assert_eq!(h.id.as_deref(), Some("3BF96D32"));
        assert_eq!(h.from.as_deref(), Some("comp.example.org"));
        assert_eq!(h.footer, "</stream:stream>");
        assert!(h.header.starts_with("<stream:stream"));
    }

    #[test]
    fn test_stream_header_without_prefix() {
        let h = parse_stream_header("<stream xmlns='jabber:component:accept' id='1'>").unwrap();
        assert_eq!(h.footer, "</stream>");
        assert_eq!(h.id.as_deref(), Some("1"));
        assert_eq!(h.from, None);
    }

    #[test]
    fn test_fragment_inherits_stream_namespace() {
        let iq = parse_fragment(
            &header(),
            "<iq type='get' id='5' from='a@b/c'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
        )
        .unwrap();
        assert_eq!(iq.local_name, "iq");
        assert_eq!(iq.namespace, "jabber:component:accept");
        assert_eq!(iq.attr("type"), Some("get"));
        assert_eq!(iq.attr("to"), None);
        let query = iq.first_element().unwrap();
        assert!(query.is("query", "http://jabber.org/protocol/disco#info"));
    }

    #[test]
    fn test_prefixed_children_and_text() {
        let msg = parse_fragment(
            &header(),
            "<message from='x'><qos:assured xmlns:qos='urn:xmpp:qos' msgId='m1'><body>a &amp; b</body></qos:assured></message>",
        )
        .unwrap();
        let assured = msg.get_child("assured", "urn:xmpp:qos").unwrap();
        assert_eq!(assured.name, "qos:assured");
        assert_eq!(assured.attr("msgId"), Some("m1"));
        let body = assured.first_element().unwrap();
        assert_eq!(body.namespace, "jabber:component:accept");
        assert_eq!(body.text(), "a & b");
    }

    #[test]
    fn test_to_xml_escapes() {
        let msg = parse_fragment(&header(), "<message to='a&apos;b'><body>1 &lt; 2</body></message>").unwrap();
        assert_eq!(msg.to_xml(), "<message to='a&apos;b'><body>1 &lt; 2</body></message>");
        assert_eq!(msg.inner_xml(), "<body>1 &lt; 2</body>");
    }

    #[test]
    fn test_cdata_and_comments_in_text() {
        let msg = parse_fragment(
            &header(),
            "<message><body>x <![CDATA[a>b<c]]><!-- note --> y</body></message>",
        )
        .unwrap();
        let body = msg.first_element().unwrap();
        assert_eq!(body.text(), "x a>b<c y");
        assert_eq!(msg.to_xml(), "<message><body>x a&gt;b&lt;c y</body></message>");
    }

    #[test]
    fn test_malformed_fragment() {
        assert!(parse_fragment(&header(), "<iq><query></iq>").is_err());
    }

    #[test]
    fn test_encode_decode() {
        assert_eq!(encode("<a href='x'>&</a>"), "&lt;a href=&apos;x&apos;&gt;&amp;&lt;/a&gt;");
        assert_eq!(decode("&lt;&amp;&gt;").unwrap(), "<&>");
    }
}
