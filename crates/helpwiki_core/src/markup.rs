//! Owned XHTML element tree.
//!
//! Help topics are XHTML fragments. They are parsed into a small mutable tree
//! so `src`/`href` attributes can be rewritten on a clone and the root element
//! serialized back out. Text and comments are kept in their escaped source
//! form, so round-tripping never re-encodes entities the parser did not need
//! to understand.

use std::borrow::Cow;

use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarkupError {
    #[error("malformed markup at byte {position}: {source}")]
    Syntax {
        position: usize,
        #[source]
        source: quick_xml::Error,
    },

    #[error("malformed markup: {0}")]
    Structure(String),

    #[error("failed to serialize markup: {0}")]
    Write(#[from] quick_xml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    /// Escaped character data exactly as it appeared in the source.
    Text(String),
    CData(String),
    Comment(String),
    Instruction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
    self_closing: bool,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
            self_closing: false,
        }
    }

    /// Element name without any namespace prefix.
    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attribute(&mut self, key: &str, value: &str) {
        match self.attributes.iter_mut().find(|(name, _)| name == key) {
            Some(existing) => existing.1 = value.to_string(),
            None => self.attributes.push((key.to_string(), value.to_string())),
        }
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Unescaped text content of this element and its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }

    fn collect_named<'a>(&'a self, local_name: &str, out: &mut Vec<&'a Element>) {
        if self.local_name().eq_ignore_ascii_case(local_name) {
            out.push(self);
        }
        for child in &self.children {
            if let Node::Element(element) = child {
                element.collect_named(local_name, out);
            }
        }
    }

    fn visit_named_mut<F>(&mut self, local_names: &[&str], visit: &mut F)
    where
        F: FnMut(&mut Element),
    {
        if local_names
            .iter()
            .any(|name| self.local_name().eq_ignore_ascii_case(name))
        {
            visit(self);
        }
        for child in &mut self.children {
            if let Node::Element(element) = child {
                element.visit_named_mut(local_names, visit);
            }
        }
    }
}

/// A parsed document. Only the root element is retained; the XML
/// declaration, doctype and anything outside the root are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    root: Element,
}

impl Document {
    pub fn parse(source: &str) -> Result<Self, MarkupError> {
        let mut reader = Reader::from_str(source);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let position = reader.buffer_position();
            let event = reader
                .read_event()
                .map_err(|source| MarkupError::Syntax { position, source })?;
            match event {
                Event::Start(start) => {
                    let element = element_from_start(&start, false)
                        .map_err(|source| MarkupError::Syntax { position, source })?;
                    stack.push(element);
                }
                Event::Empty(start) => {
                    let element = element_from_start(&start, true)
                        .map_err(|source| MarkupError::Syntax { position, source })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        MarkupError::Structure(format!("unexpected end tag at byte {position}"))
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(lossy(&text)));
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::CData(lossy(&data)));
                    }
                }
                Event::Comment(text) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Comment(lossy(&text)));
                    }
                }
                Event::PI(text) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Instruction(lossy(&text)));
                    }
                }
                Event::Decl(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if let Some(open) = stack.last() {
            return Err(MarkupError::Structure(format!(
                "unclosed element <{}>",
                open.name
            )));
        }
        let root =
            root.ok_or_else(|| MarkupError::Structure("document has no root element".into()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    /// All elements with the given local name, in document order.
    pub fn elements(&self, local_name: &str) -> Vec<&Element> {
        let mut out = Vec::new();
        self.root.collect_named(local_name, &mut out);
        out
    }

    /// Visit every element whose local name is one of `local_names`.
    pub fn for_each_element_mut<F>(&mut self, local_names: &[&str], mut visit: F)
    where
        F: FnMut(&mut Element),
    {
        self.root.visit_named_mut(local_names, &mut visit);
    }

    /// Serialize the root element.
    pub fn to_xml(&self) -> Result<String, MarkupError> {
        let mut writer = Writer::new(Vec::new());
        write_element(&mut writer, &self.root)?;
        String::from_utf8(writer.into_inner())
            .map_err(|error| MarkupError::Structure(error.to_string()))
    }
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), MarkupError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Node::Element(element));
        return Ok(());
    }
    if root.is_some() {
        return Err(MarkupError::Structure(format!(
            "second root element <{}>",
            element.name
        )));
    }
    *root = Some(element);
    Ok(())
}

fn element_from_start(start: &BytesStart<'_>, self_closing: bool) -> quick_xml::Result<Element> {
    let mut element = Element::new(&String::from_utf8_lossy(start.name().as_ref()));
    element.self_closing = self_closing;
    for attribute in start.attributes() {
        let attribute = attribute?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> quick_xml::Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.self_closing && element.children.is_empty() {
        return writer.write_event(Event::Empty(start));
    }

    writer.write_event(Event::Start(start))?;
    for child in &element.children {
        match child {
            Node::Element(inner) => write_element(writer, inner)?,
            Node::Text(raw) => {
                writer.write_event(Event::Text(BytesText::from_escaped(raw.as_str())))?
            }
            Node::CData(data) => writer.write_event(Event::CData(BytesCData::new(data.as_str())))?,
            Node::Comment(raw) => {
                writer.write_event(Event::Comment(BytesText::from_escaped(raw.as_str())))?
            }
            Node::Instruction(raw) => {
                writer.write_event(Event::PI(BytesText::from_escaped(raw.as_str())))?
            }
        }
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))
}

fn collect_text(element: &Element, out: &mut String) {
    for child in &element.children {
        match child {
            Node::Element(inner) => collect_text(inner, out),
            Node::Text(raw) => out.push_str(&unescape_lossy(raw)),
            Node::CData(data) => out.push_str(data),
            Node::Comment(_) | Node::Instruction(_) => {}
        }
    }
}

fn unescape_lossy(raw: &str) -> Cow<'_, str> {
    quick_xml::escape::unescape(raw).unwrap_or(Cow::Borrowed(raw))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
