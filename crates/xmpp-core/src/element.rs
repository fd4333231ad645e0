//! XML element tree
//!
//! Stanza payloads are small XML fragments. This module models them as an
//! owned element tree with builder-style construction, rendered and parsed
//! with quick-xml.

use crate::error::XmppError;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

/// A child node of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An owned XML element: name, optional `xmlns`, attributes, children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn maybe_child(mut self, child: Option<Element>) -> Self {
        if let Some(child) = child {
            self.children.push(Node::Element(child));
        }
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Value of an attribute, if present.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Child elements, in document order.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given name.
    pub fn find_child(&self, name: &str) -> Option<&Element> {
        self.children().find(|el| el.name == name)
    }

    /// First child element with the given name and namespace.
    pub fn find_child_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children()
            .find(|el| el.name == name && el.namespace.as_deref() == Some(ns))
    }

    /// Concatenated text content of this element (direct text nodes only).
    pub fn text_content(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Render this element as an XML string.
    pub fn render(&self) -> Result<String, XmppError> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        self.write_to(&mut writer)?;
        let bytes = writer.into_inner().into_inner();
        String::from_utf8(bytes).map_err(|e| XmppError::Xml(e.to_string()))
    }

    fn write_to(&self, writer: &mut Writer<Cursor<Vec<u8>>>) -> Result<(), XmppError> {
        let mut start = BytesStart::new(self.name.as_str());
        if let Some(ns) = &self.namespace {
            start.push_attribute(("xmlns", ns.as_str()));
        }
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }
        if self.children.is_empty() {
            writer
                .write_event(Event::Empty(start))
                .map_err(|e| XmppError::Xml(e.to_string()))?;
            return Ok(());
        }
        writer
            .write_event(Event::Start(start))
            .map_err(|e| XmppError::Xml(e.to_string()))?;
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_to(writer)?,
                Node::Text(text) => writer
                    .write_event(Event::Text(BytesText::new(text)))
                    .map_err(|e| XmppError::Xml(e.to_string()))?,
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(|e| XmppError::Xml(e.to_string()))?;
        Ok(())
    }

    /// Parse a single element from an XML string.
    pub fn parse(input: &str) -> Result<Element, XmppError> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(true);
        let mut stack: Vec<Element> = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    stack.push(Self::from_start(&start)?);
                }
                Ok(Event::Empty(start)) => {
                    let el = Self::from_start(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(el)),
                        None => return Ok(el),
                    }
                }
                Ok(Event::Text(text)) => {
                    let text = text
                        .unescape()
                        .map_err(|e| XmppError::Xml(e.to_string()))?
                        .into_owned();
                    if let Some(parent) = stack.last_mut() {
                        if !text.is_empty() {
                            parent.children.push(Node::Text(text));
                        }
                    }
                }
                Ok(Event::End(_)) => {
                    let el = stack
                        .pop()
                        .ok_or_else(|| XmppError::Xml("unbalanced end tag".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(el)),
                        None => return Ok(el),
                    }
                }
                Ok(Event::Eof) => {
                    return Err(XmppError::Xml("unexpected end of document".to_string()))
                }
                Ok(_) => {}
                Err(e) => return Err(XmppError::Xml(e.to_string())),
            }
        }
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Element, XmppError> {
        let name = String::from_utf8(start.name().as_ref().to_vec())
            .map_err(|e| XmppError::Xml(e.to_string()))?;
        let mut element = Element::new(name);
        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmppError::Xml(e.to_string()))?;
            let key = String::from_utf8(attr.key.as_ref().to_vec())
                .map_err(|e| XmppError::Xml(e.to_string()))?;
            let value = attr
                .unescape_value()
                .map_err(|e| XmppError::Xml(e.to_string()))?
                .into_owned();
            if key == "xmlns" {
                element.namespace = Some(value);
            } else {
                element.attributes.push((key, value));
            }
        }
        Ok(element)
    }
}
