//! Owned XML element tree backing the GPX writer.

use std::borrow::Cow;
use std::io::{BufRead, Write};

use quick_xml::events::{BytesDecl, BytesEnd, BytesRef, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::GpxError;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// An element holding a single text node, e.g. `<ele>12.5</ele>`.
    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut element = Self::new(name);
        element.children.push(Node::Text(text.into()));
        element
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Name without namespace prefix.
    pub fn local_name(&self) -> &str {
        self.name
            .rsplit_once(':')
            .map_or(self.name.as_str(), |(_, local)| local)
    }

    /// Concatenated text of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|child| match child {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children.retain(|child| matches!(child, Node::Element(_)));
        self.children.insert(0, Node::Text(text.into()));
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|child| match child {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.elements().find(|e| e.local_name() == local_name)
    }

    pub fn child_mut(&mut self, local_name: &str) -> Option<&mut Element> {
        self.elements_mut().find(|e| e.local_name() == local_name)
    }

    pub fn last_child_mut(&mut self, local_name: &str) -> Option<&mut Element> {
        self.children.iter_mut().rev().find_map(|child| match child {
            Node::Element(e) if e.local_name() == local_name => Some(e),
            _ => None,
        })
    }

    /// Index in `children` of the first element whose local name is in `names`.
    pub fn position_of_any(&self, names: &[&str]) -> Option<usize> {
        self.children.iter().position(|child| match child {
            Node::Element(e) => names.contains(&e.local_name()),
            Node::Text(_) => false,
        })
    }

    pub fn push(&mut self, element: Element) {
        self.children.push(Node::Element(element));
    }

    pub fn insert(&mut self, index: usize, element: Element) {
        self.children.insert(index, Node::Element(element));
    }

    /// Inserts before the first child named in `before`, or appends.
    pub fn insert_before_any(&mut self, element: Element, before: &[&str]) -> &mut Element {
        let index = self.position_of_any(before).unwrap_or(self.children.len());
        self.insert(index, element);
        match &mut self.children[index] {
            Node::Element(e) => e,
            Node::Text(_) => unreachable!("an element was inserted at this index"),
        }
    }

    /// Reads a whole document and returns its root element.
    pub fn read<R: BufRead>(source: R) -> Result<Element, GpxError> {
        let mut reader = Reader::from_reader(source);
        let mut buf = Vec::new();
        // Each open element carries the text gathered since its last child.
        let mut stack: Vec<(Element, String)> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event_into(&mut buf).map_err(|source| GpxError::Xml {
                position: reader.buffer_position() as u64,
                source,
            })?;
            match event {
                Event::Start(e) => {
                    flush_text(&mut stack);
                    stack.push((element_from_start(&e), String::new()));
                }
                Event::Empty(e) => {
                    flush_text(&mut stack);
                    let element = element_from_start(&e);
                    attach(&mut stack, &mut root, element);
                }
                Event::End(_) => close(&mut stack, &mut root),
                Event::Text(e) => {
                    if let Some((_, text)) = stack.last_mut() {
                        text.push_str(&String::from_utf8_lossy(e.as_ref()));
                    }
                }
                Event::CData(e) => {
                    if let Some((_, text)) = stack.last_mut() {
                        text.push_str(&String::from_utf8_lossy(e.as_ref()));
                    }
                }
                Event::GeneralRef(e) => {
                    if let Some((_, text)) = stack.last_mut() {
                        push_general_ref(text, &e);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            tracing::warn!(open = stack.len(), "document ended with unclosed elements, closing them");
            while !stack.is_empty() {
                close(&mut stack, &mut root);
            }
        }

        root.ok_or_else(|| GpxError::FileFormat {
            found: String::new(),
        })
    }

    /// Serializes the element as a complete document with an XML declaration.
    pub fn write_document<W: Write>(&self, sink: W) -> std::io::Result<()> {
        let mut writer = Writer::new_with_indent(sink, b' ', 2);
        emit(
            &mut writer,
            Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
        )?;
        self.write_into(&mut writer)?;
        writer.get_mut().write_all(b"\n")
    }

    fn write_into<W: Write>(&self, writer: &mut Writer<W>) -> std::io::Result<()> {
        let start = BytesStart::new(self.name.as_str()).with_attributes(
            self.attributes
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        if self.children.is_empty() {
            return emit(writer, Event::Empty(start));
        }
        emit(writer, Event::Start(start))?;
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_into(writer)?,
                Node::Text(t) => emit(writer, Event::Text(BytesText::new(t)))?,
            }
        }
        emit(writer, Event::End(BytesEnd::new(self.name.as_str())))
    }
}

fn emit<W: Write>(writer: &mut Writer<W>, event: Event<'_>) -> std::io::Result<()> {
    writer.write_event(event).map_err(std::io::Error::other)
}

fn attach(stack: &mut [(Element, String)], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some((parent, _)) => parent.push(element),
        None if root.is_none() => *root = Some(element),
        None => tracing::warn!(name = %element.name, "ignoring element after document root"),
    }
}

fn close(stack: &mut Vec<(Element, String)>, root: &mut Option<Element>) {
    flush_text(stack);
    if let Some((element, _)) = stack.pop() {
        attach(stack, root, element);
    }
}

// Moves the pending text of the innermost element into its children.
// Whitespace-only runs are indentation and are dropped.
fn flush_text(stack: &mut [(Element, String)]) {
    let Some((element, text)) = stack.last_mut() else {
        return;
    };
    let text = std::mem::take(text);
    if text.trim().is_empty() {
        return;
    }
    match element.children.last_mut() {
        Some(Node::Text(existing)) => existing.push_str(&text),
        _ => element.children.push(Node::Text(text)),
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Element {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attribute_value(&attr.value);
        element.attributes.push((key, value));
    }
    element
}

/// Decodes an attribute value, resolving XML escapes when they are well formed.
pub(crate) fn attribute_value(raw: &[u8]) -> String {
    let raw = String::from_utf8_lossy(raw);
    match quick_xml::escape::unescape(&raw) {
        Ok(Cow::Owned(unescaped)) => unescaped,
        Ok(Cow::Borrowed(_)) | Err(_) => raw.into_owned(),
    }
}

/// Appends the text an entity or character reference stands for.
pub(crate) fn push_general_ref(text: &mut String, reference: &BytesRef<'_>) {
    if let Ok(Some(ch)) = reference.resolve_char_ref() {
        text.push(ch);
        return;
    }
    match std::str::from_utf8(reference.as_ref()).unwrap_or_default() {
        "amp" => text.push('&'),
        "lt" => text.push('<'),
        "gt" => text.push('>'),
        "quot" => text.push('"'),
        "apos" => text.push('\''),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_str(xml: &str) -> Element {
        Element::read(xml.as_bytes()).unwrap()
    }

    #[test]
    fn test_read_nested() {
        let root = read_str(
            r#"<?xml version="1.0"?>
<gpx version="1.1"><trk><name>Run &amp; walk</name><number>3</number></trk></gpx>"#,
        );
        assert_eq!(root.name, "gpx");
        assert_eq!(root.attr("version"), Some("1.1"));
        let trk = root.child("trk").unwrap();
        assert_eq!(trk.child("name").unwrap().text(), "Run & walk");
        assert_eq!(trk.child("number").unwrap().text(), "3");
    }

    #[test]
    fn test_spaces_between_references_survive() {
        let root = read_str("<gpx><name>Tom &amp; &apos;Jerry&apos;</name><cmt> &lt;x&gt; &amp; y </cmt></gpx>");
        assert_eq!(root.child("name").unwrap().text(), "Tom & 'Jerry'");
        assert_eq!(root.child("cmt").unwrap().text(), " <x> & y ");
    }

    #[test]
    fn test_invalid_utf8_text_is_kept_lossy() {
        let root = Element::read(&b"<gpx><name>ab\xFFcd</name></gpx>"[..]).unwrap();
        assert_eq!(root.child("name").unwrap().text(), "ab\u{FFFD}cd");
    }

    #[test]
    fn test_indentation_is_not_text() {
        let root = read_str("<gpx>\n  <trk>\n    <number>1</number>\n  </trk>\n</gpx>");
        let trk = root.child("trk").unwrap();
        assert_eq!(trk.children.len(), 1);
        assert!(root.text().is_empty());
    }

    #[test]
    fn test_prefixed_names() {
        let root = read_str(r#"<gpx xmlns:hr="urn:x"><hr:hbtlist><hr:hbt value="60"/></hr:hbtlist></gpx>"#);
        let list = root.child("hbtlist").unwrap();
        assert_eq!(list.name, "hr:hbtlist");
        assert_eq!(list.child("hbt").unwrap().attr("value"), Some("60"));
    }

    #[test]
    fn test_empty_input_is_format_error() {
        assert!(matches!(
            Element::read("".as_bytes()),
            Err(GpxError::FileFormat { .. })
        ));
    }

    #[test]
    fn test_insert_before_any() {
        let mut trk = Element::new("trk");
        trk.push(Element::with_text("number", "1"));
        trk.push(Element::new("trkseg"));
        trk.insert_before_any(Element::with_text("name", "n"), &["cmt", "number", "trkseg"]);
        let names: Vec<_> = trk.elements().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["name", "number", "trkseg"]);
    }

    #[test]
    fn test_write_escapes_and_reads_back() {
        let mut root = Element::new("gpx").with_attr("creator", "a \"b\" & c");
        root.push(Element::with_text("name", "<x> & y"));
        root.push(Element::new("empty"));
        let mut out = Vec::new();
        root.write_document(&mut out).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(text.contains("<empty/>"));

        let back = Element::read(out.as_slice()).unwrap();
        assert_eq!(back.attr("creator"), Some("a \"b\" & c"));
        assert_eq!(back.child("name").unwrap().text(), "<x> & y");
    }
}
