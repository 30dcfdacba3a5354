//! Exclusive XML canonicalization (without comments) of a document subtree.
//!
//! Only namespace declarations visibly utilized by an element or its
//! attributes are rendered, and only when the nearest rendered ancestor
//! did not already bind the same prefix to the same URI.

use crate::document::{local_part, prefix_part, Document, NodeId, NodeKind};
use std::collections::BTreeMap;

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Canonicalize the subtree rooted at `id`.
pub fn canonicalize(doc: &Document, id: NodeId) -> String {
    let mut out = String::new();
    write_node(doc, id, &BTreeMap::new(), &mut out);
    out
}

fn write_node(doc: &Document, id: NodeId, rendered: &BTreeMap<String, String>, out: &mut String) {
    match doc.kind(id) {
        NodeKind::Element(el) => {
            let mut utilized: Vec<&str> = vec![el.prefix().unwrap_or("")];
            for attr in &el.attributes {
                if is_namespace_declaration(&attr.name) {
                    continue;
                }
                if let Some(prefix) = prefix_part(&attr.name) {
                    if prefix != "xml" && !utilized.contains(&prefix) {
                        utilized.push(prefix);
                    }
                }
            }

            let mut scope = rendered.clone();
            let mut declarations: Vec<(&str, String)> = Vec::new();
            for prefix in utilized {
                let lookup = if prefix.is_empty() { None } else { Some(prefix) };
                let uri = doc.lookup_namespace(id, lookup).unwrap_or("");
                if !prefix.is_empty() && uri.is_empty() {
                    continue;
                }
                let current = rendered.get(prefix).map(String::as_str).unwrap_or("");
                if current != uri {
                    declarations.push((prefix, uri.to_string()));
                    scope.insert(prefix.to_string(), uri.to_string());
                }
            }
            declarations.sort_by(|a, b| a.0.cmp(b.0));

            let mut attributes: Vec<(String, &str, &str)> = el
                .attributes
                .iter()
                .filter(|a| !is_namespace_declaration(&a.name))
                .map(|a| {
                    let ns = match prefix_part(&a.name) {
                        Some("xml") => XML_NS.to_string(),
                        Some(p) => doc.lookup_namespace(id, Some(p)).unwrap_or("").to_string(),
                        None => String::new(),
                    };
                    (ns, a.name.as_str(), a.value.as_str())
                })
                .collect();
            attributes.sort_by(|a, b| (a.0.as_str(), local_part(a.1)).cmp(&(b.0.as_str(), local_part(b.1))));

            out.push('<');
            out.push_str(&el.name);
            for (prefix, uri) in &declarations {
                if prefix.is_empty() {
                    out.push_str(" xmlns=\"");
                } else {
                    out.push_str(" xmlns:");
                    out.push_str(prefix);
                    out.push_str("=\"");
                }
                out.push_str(&escape_attribute(uri));
                out.push('"');
            }
            for (_, name, value) in &attributes {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(&escape_attribute(value));
                out.push('"');
            }
            out.push('>');
            for &child in doc.children(id) {
                write_node(doc, child, &scope, out);
            }
            out.push_str("</");
            out.push_str(&el.name);
            out.push('>');
        }
        NodeKind::Text(text) | NodeKind::CData(text) => out.push_str(&escape_text(text)),
        NodeKind::ProcessingInstruction(pi) => {
            out.push_str("<?");
            out.push_str(pi);
            out.push_str("?>");
        }
        NodeKind::Comment(_) => {}
        NodeKind::Document => {
            for &child in doc.children(id) {
                write_node(doc, child, rendered, out);
            }
        }
    }
}

fn is_namespace_declaration(name: &str) -> bool {
    name == "xmlns" || name.starts_with("xmlns:")
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\r', "&#xD;")
}

fn escape_attribute(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('"', "&quot;")
        .replace('\t', "&#x9;")
        .replace('\n', "&#xA;")
        .replace('\r', "&#xD;")
}
