//! Arena-backed XML document tree.
//!
//! Nodes live in a `Vec` and refer to each other by index, so an
//! EncryptedData element can be swapped for its decrypted fragment without
//! any shared mutable pointers. Detached nodes stay in the arena until the
//! document is dropped.
//!
//! Parsing uses quick-xml, which never expands external entities. DOCTYPE
//! declarations are rejected outright.

use crate::error::XmlError;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::borrow::Cow;

/// Index of a node inside a [`Document`].
pub type NodeId = usize;

/// An attribute with its qualified name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// An element with its qualified name and attributes in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<Attribute>,
}

impl Element {
    /// Local part of the qualified name.
    pub fn local_name(&self) -> &str {
        local_part(&self.name)
    }

    /// Prefix of the qualified name, if any.
    pub fn prefix(&self) -> Option<&str> {
        prefix_part(&self.name)
    }
}

/// Node payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// The invisible document node that owns the root element.
    Document,
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
    ProcessingInstruction(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Parsed XML document.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    declaration: Option<String>,
}

const DOCUMENT_NODE: NodeId = 0;

impl Document {
    fn empty() -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
            declaration: None,
        }
    }

    /// Parse a complete document with exactly one root element.
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        let mut doc = Self::empty();
        doc.declaration = doc.parse_into(xml, DOCUMENT_NODE)?;

        let roots = doc.nodes[DOCUMENT_NODE]
            .children
            .iter()
            .filter(|&&id| doc.element(id).is_some())
            .count();
        match roots {
            0 => Err(XmlError("document has no root element".to_string())),
            1 => Ok(doc),
            n => Err(XmlError(format!("document has {} root elements", n))),
        }
    }

    /// Parse a sequence of nodes into this document's arena.
    ///
    /// The returned nodes are detached; splice them in with
    /// [`Document::replace_with`] or [`Document::append_child`].
    pub fn parse_fragment(&mut self, xml: &str) -> Result<Vec<NodeId>, XmlError> {
        let holder = self.push(NodeKind::Element(Element {
            name: "#fragment".to_string(),
            attributes: Vec::new(),
        }));
        let wrapped = format!("<fragment>{}</fragment>", xml);
        self.parse_into(&wrapped, holder)?;

        let wrapper = self.nodes[holder]
            .children
            .first()
            .copied()
            .ok_or_else(|| XmlError("empty fragment".to_string()))?;
        let children = std::mem::take(&mut self.nodes[wrapper].children);
        for &child in &children {
            self.nodes[child].parent = None;
        }
        self.nodes[holder].children.clear();
        Ok(children)
    }

    /// Read events from `xml` and attach the resulting nodes under `parent`.
    /// Returns the XML declaration, if one was present.
    fn parse_into(&mut self, xml: &str, parent: NodeId) -> Result<Option<String>, XmlError> {
        let xml = normalize_line_endings(xml);
        let mut reader = Reader::from_str(&xml);
        reader.config_mut().trim_text(false);

        let top_level = parent == DOCUMENT_NODE;
        let mut declaration = None;
        let mut stack = vec![parent];

        loop {
            let current = *stack.last().unwrap_or(&parent);
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    let id = self.push(NodeKind::Element(start_to_element(e)?));
                    self.append_child(current, id);
                    stack.push(id);
                }
                Ok(Event::Empty(ref e)) => {
                    let id = self.push(NodeKind::Element(start_to_element(e)?));
                    self.append_child(current, id);
                }
                Ok(Event::End(_)) => {
                    if stack.len() <= 1 {
                        return Err(XmlError("unexpected closing tag".to_string()));
                    }
                    stack.pop();
                }
                Ok(Event::Text(ref e)) => {
                    let text = e
                        .unescape()
                        .map_err(|err| XmlError(format!("invalid text: {}", err)))?
                        .into_owned();
                    if top_level && stack.len() == 1 {
                        if !text.trim().is_empty() {
                            return Err(XmlError("text outside the root element".to_string()));
                        }
                        continue;
                    }
                    let id = self.push(NodeKind::Text(text));
                    self.append_child(current, id);
                }
                Ok(Event::CData(ref e)) => {
                    let id = self.push(NodeKind::CData(bytes_to_string(e)?));
                    self.append_child(current, id);
                }
                Ok(Event::Comment(ref e)) => {
                    let id = self.push(NodeKind::Comment(bytes_to_string(e)?));
                    self.append_child(current, id);
                }
                Ok(Event::PI(ref e)) => {
                    let id = self.push(NodeKind::ProcessingInstruction(bytes_to_string(e)?));
                    self.append_child(current, id);
                }
                Ok(Event::Decl(ref e)) => {
                    declaration = Some(format!("<?{}?>", bytes_to_string(e)?));
                }
                Ok(Event::DocType(_)) => {
                    return Err(XmlError("DOCTYPE declarations are not allowed".to_string()));
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(XmlError(format!("{}", e))),
            }
        }

        if stack.len() > 1 {
            return Err(XmlError("unclosed element at end of input".to_string()));
        }
        Ok(declaration)
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    /// The single root element.
    pub fn root(&self) -> NodeId {
        self.nodes[DOCUMENT_NODE]
            .children
            .iter()
            .copied()
            .find(|&id| self.element(id).is_some())
            .unwrap_or(DOCUMENT_NODE)
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id].kind {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[id].kind {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Element children of `id` in document order.
    pub fn child_elements(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .filter(move |&c| self.element(c).is_some())
    }

    /// All descendants of `id` in document order, not including `id`.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut pending: Vec<NodeId> = self.nodes[id].children.iter().rev().copied().collect();
        while let Some(next) = pending.pop() {
            out.push(next);
            pending.extend(self.nodes[next].children.iter().rev().copied());
        }
        out
    }

    /// Resolve `prefix` (or the default namespace for `None`) in scope at `id`.
    pub fn lookup_namespace(&self, id: NodeId, prefix: Option<&str>) -> Option<&str> {
        let wanted = match prefix {
            Some(p) => format!("xmlns:{}", p),
            None => "xmlns".to_string(),
        };
        let mut cursor = Some(id);
        while let Some(node) = cursor {
            if let Some(el) = self.element(node) {
                if let Some(attr) = el.attributes.iter().find(|a| a.name == wanted) {
                    return if attr.value.is_empty() { None } else { Some(&attr.value) };
                }
            }
            cursor = self.nodes[node].parent;
        }
        None
    }

    /// Namespace URI of an element.
    pub fn namespace_of(&self, id: NodeId) -> Option<&str> {
        let el = self.element(id)?;
        self.lookup_namespace(id, el.prefix())
    }

    /// Whether `id` is an element with the given namespace and local name.
    pub fn is_element(&self, id: NodeId, namespace: &str, local_name: &str) -> bool {
        match self.element(id) {
            Some(el) => el.local_name() == local_name && self.namespace_of(id) == Some(namespace),
            None => false,
        }
    }

    /// First child element matching namespace and local name.
    pub fn find_child(&self, id: NodeId, namespace: &str, local_name: &str) -> Option<NodeId> {
        self.child_elements(id)
            .find(|&c| self.is_element(c, namespace, local_name))
    }

    /// All descendant elements matching namespace and local name.
    pub fn find_descendants(&self, id: NodeId, namespace: &str, local_name: &str) -> Vec<NodeId> {
        self.descendants(id)
            .into_iter()
            .filter(|&d| self.is_element(d, namespace, local_name))
            .collect()
    }

    /// Attribute value by exact qualified name.
    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id)?
            .attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Attribute value matched on local name only, ignoring namespace
    /// declarations. Used for `Id`/`wsu:Id` lookups.
    pub fn attribute_by_local_name(&self, id: NodeId, local_name: &str) -> Option<&str> {
        self.element(id)?
            .attributes
            .iter()
            .filter(|a| a.name != "xmlns" && !a.name.starts_with("xmlns:"))
            .find(|a| local_part(&a.name) == local_name)
            .map(|a| a.value.as_str())
    }

    /// Concatenated text of all descendant text and CDATA nodes.
    pub fn text_content(&self, id: NodeId) -> String {
        self.descendants(id)
            .into_iter()
            .filter_map(|d| match &self.nodes[d].kind {
                NodeKind::Text(t) | NodeKind::CData(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Create a detached element.
    pub fn create_element(&mut self, name: &str) -> NodeId {
        self.push(NodeKind::Element(Element {
            name: name.to_string(),
            attributes: Vec::new(),
        }))
    }

    /// Create a detached text node.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Text(text.to_string()))
    }

    /// Set or overwrite an attribute.
    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(el) = self.element_mut(id) {
            match el.attributes.iter_mut().find(|a| a.name == name) {
                Some(attr) => attr.value = value.to_string(),
                None => el.attributes.push(Attribute {
                    name: name.to_string(),
                    value: value.to_string(),
                }),
            }
        }
    }

    /// Declare `prefix` on `id` unless it already resolves to `uri` there.
    pub fn ensure_namespace(&mut self, id: NodeId, prefix: &str, uri: &str) {
        if self.lookup_namespace(id, Some(prefix)) != Some(uri) {
            self.set_attribute(id, &format!("xmlns:{}", prefix), uri);
        }
    }

    /// Append a detached node as the last child of `parent`.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    /// Insert a node as the first child of `parent`.
    pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.insert(0, child);
    }

    /// Create an element and append it to `parent`.
    pub fn append_element(&mut self, parent: NodeId, name: &str) -> NodeId {
        let id = self.create_element(name);
        self.append_child(parent, id);
        id
    }

    /// Create an element holding a single text node and append it.
    pub fn append_text_element(&mut self, parent: NodeId, name: &str, text: &str) -> NodeId {
        let id = self.append_element(parent, name);
        let text_id = self.create_text(text);
        self.append_child(id, text_id);
        id
    }

    /// Unlink a node from its parent. The node keeps its own children.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent.take() {
            self.nodes[parent].children.retain(|&c| c != id);
        }
    }

    /// Detach and return every child of `id`.
    pub fn take_children(&mut self, id: NodeId) -> Vec<NodeId> {
        let children = std::mem::take(&mut self.nodes[id].children);
        for &child in &children {
            self.nodes[child].parent = None;
        }
        children
    }

    /// Put `replacements` where `old` was and detach `old`.
    pub fn replace_with(&mut self, old: NodeId, replacements: &[NodeId]) {
        let Some(parent) = self.nodes[old].parent else {
            return;
        };
        for &r in replacements {
            self.detach(r);
        }
        let Some(position) = self.nodes[parent].children.iter().position(|&c| c == old) else {
            return;
        };
        self.nodes[parent]
            .children
            .splice(position..=position, replacements.iter().copied());
        for &r in replacements {
            self.nodes[r].parent = Some(parent);
        }
        self.nodes[old].parent = None;
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Serialize the whole document, including the XML declaration.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        if let Some(decl) = &self.declaration {
            out.push_str(decl);
            out.push('\n');
        }
        for &child in &self.nodes[DOCUMENT_NODE].children {
            self.write_node(child, &mut out);
        }
        out
    }

    /// Serialize one node and its subtree.
    pub fn node_to_xml(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        out
    }

    /// Serialize only the children of `id` (its inner XML).
    pub fn inner_xml(&self, id: NodeId) -> String {
        let mut out = String::new();
        for &child in &self.nodes[id].children {
            self.write_node(child, &mut out);
        }
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id].kind {
            NodeKind::Document => {
                for &child in &self.nodes[id].children {
                    self.write_node(child, out);
                }
            }
            NodeKind::Element(el) => {
                out.push('<');
                out.push_str(&el.name);
                for attr in &el.attributes {
                    out.push(' ');
                    out.push_str(&attr.name);
                    out.push_str("=\"");
                    out.push_str(&escape_attribute(&attr.value));
                    out.push('"');
                }
                if self.nodes[id].children.is_empty() {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    for &child in &self.nodes[id].children {
                        self.write_node(child, out);
                    }
                    out.push_str("</");
                    out.push_str(&el.name);
                    out.push('>');
                }
            }
            NodeKind::Text(text) => out.push_str(&escape_text(text)),
            NodeKind::CData(text) => {
                out.push_str("<![CDATA[");
                out.push_str(text);
                out.push_str("]]>");
            }
            NodeKind::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeKind::ProcessingInstruction(text) => {
                out.push_str("<?");
                out.push_str(text);
                out.push_str("?>");
            }
        }
    }
}

/// Local part of a qualified name.
pub fn local_part(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, local)| local).unwrap_or(name)
}

/// Prefix of a qualified name, if any.
pub fn prefix_part(name: &str) -> Option<&str> {
    name.split_once(':').map(|(prefix, _)| prefix)
}

fn start_to_element(e: &BytesStart) -> Result<Element, XmlError> {
    let name = bytes_to_string(e.name().as_ref())?;
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| XmlError(format!("invalid attribute: {}", err)))?;
        // Literal whitespace becomes a space; character references survive.
        let raw: String = bytes_to_string(&attr.value)?
            .chars()
            .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
            .collect();
        let value = unescape(&raw)
            .map_err(|err| XmlError(format!("invalid attribute value: {}", err)))?;
        attributes.push(Attribute {
            name: bytes_to_string(attr.key.as_ref())?,
            value: value.into_owned(),
        });
    }
    Ok(Element { name, attributes })
}

/// `\r\n` and lone `\r` become `\n`, as an XML processor must on input.
fn normalize_line_endings(xml: &str) -> Cow<'_, str> {
    if xml.contains('\r') {
        Cow::Owned(xml.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(xml)
    }
}

fn bytes_to_string(bytes: &[u8]) -> Result<String, XmlError> {
    std::str::from_utf8(bytes)
        .map(String::from)
        .map_err(|e| XmlError(format!("Invalid UTF-8: {}", e)))
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attribute(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::SOAP_11_NS;

    const SOAP_11_SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header>
    <m:Trans xmlns:m="http://example.org/trans">234</m:Trans>
  </soap:Header>
  <soap:Body>
    <m:GetPrice xmlns:m="http://example.org/stock">
      <m:Item>Apples &amp; Pears</m:Item>
    </m:GetPrice>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_parse_and_navigate() {
        let doc = Document::parse(SOAP_11_SAMPLE).unwrap();
        let root = doc.root();
        assert!(doc.is_element(root, SOAP_11_NS, "Envelope"));
        let body = doc.find_child(root, SOAP_11_NS, "Body").unwrap();
        let items = doc.find_descendants(body, "http://example.org/stock", "Item");
        assert_eq!(items.len(), 1);
        assert_eq!(doc.text_content(items[0]), "Apples & Pears");
    }

    #[test]
    fn test_serialize_preserves_structure() {
        let doc = Document::parse(SOAP_11_SAMPLE).unwrap();
        let xml = doc.to_xml();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<m:Item>Apples &amp; Pears</m:Item>"));
        let reparsed = Document::parse(&xml).unwrap();
        assert_eq!(reparsed.to_xml(), xml);
    }

    #[test]
    fn test_rejects_doctype() {
        let xml = r#"<?xml version="1.0"?>
<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<root>&xxe;</root>"#;
        let err = Document::parse(xml).unwrap_err();
        assert!(err.0.contains("DOCTYPE"));
    }

    #[test]
    fn test_rejects_unclosed_and_mismatched() {
        assert!(Document::parse("<a><b></b>").is_err());
        assert!(Document::parse("<a><b></a>").is_err());
        assert!(Document::parse("").is_err());
        assert!(Document::parse("<a/><b/>").is_err());
    }

    #[test]
    fn test_fragment_replace_in_place() {
        let mut doc = Document::parse("<r><x/><old/><y/></r>").unwrap();
        let root = doc.root();
        let old = doc.children(root)[1];
        let nodes = doc.parse_fragment("<n1>1</n1>text<n2/>").unwrap();
        assert_eq!(nodes.len(), 3);
        doc.replace_with(old, &nodes);
        assert_eq!(doc.to_xml(), "<r><x/><n1>1</n1>text<n2/><y/></r>");
        assert_eq!(doc.parent(old), None);
    }

    #[test]
    fn test_fragment_rejects_garbage() {
        let mut doc = Document::parse("<r/>").unwrap();
        assert!(doc.parse_fragment("<unclosed>").is_err());
        assert!(doc.parse_fragment("</stray>").is_err());
    }

    #[test]
    fn test_namespace_lookup_and_ensure() {
        let mut doc = Document::parse(r#"<a:r xmlns:a="urn:a"><a:c/></a:r>"#).unwrap();
        let root = doc.root();
        let child = doc.children(root)[0];
        assert_eq!(doc.namespace_of(child), Some("urn:a"));
        doc.ensure_namespace(child, "a", "urn:a");
        assert_eq!(doc.attribute(child, "xmlns:a"), None);
        doc.ensure_namespace(child, "b", "urn:b");
        assert_eq!(doc.attribute(child, "xmlns:b"), Some("urn:b"));
    }

    #[test]
    fn test_line_endings_and_attribute_whitespace_normalized() {
        let doc = Document::parse("<a note=\"x\ty\r\nz&#xA;\">one\r\ntwo\rthree</a>").unwrap();
        let root = doc.root();
        assert_eq!(doc.attribute(root, "note"), Some("x y z\n"));
        assert_eq!(doc.text_content(root), "one\ntwo\nthree");
    }

    #[test]
    fn test_attribute_by_local_name_skips_xmlns() {
        let doc = Document::parse(r#"<r xmlns:Id="urn:x" wsu:Id="B-1" xmlns:wsu="urn:u"/>"#).unwrap();
        assert_eq!(doc.attribute_by_local_name(doc.root(), "Id"), Some("B-1"));
    }
}
