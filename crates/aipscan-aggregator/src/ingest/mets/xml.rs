//! Minimal namespace-aware element tree built from quick-xml events.
//!
//! METS cross-references sections by ID (`ADMID`, `FILEID`), so the parser
//! needs random access to the whole document rather than a single pass.

use crate::error::{AggregatorError, Result};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Attribute {
    /// Name as written, e.g. `xlink:href`.
    pub qname: String,
    /// Resolved namespace of a prefixed attribute.
    pub namespace: Option<String>,
    pub value: String,
}

impl Attribute {
    fn local_name(&self) -> &str {
        local_part(&self.qname)
    }

    fn is_namespace_declaration(&self) -> bool {
        self.qname == "xmlns" || self.qname.starts_with("xmlns:")
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Element {
    pub namespace: Option<String>,
    /// Name as written, e.g. `premis:object`.
    pub qname: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

fn local_part(qname: &str) -> &str {
    qname.rsplit_once(':').map_or(qname, |(_, local)| local)
}

fn prefix_part(qname: &str) -> Option<&str> {
    qname.split_once(':').map(|(prefix, _)| prefix)
}

fn owned_namespace(resolved: ResolveResult<'_>) -> Option<String> {
    match resolved {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        _ => None,
    }
}

fn xml_error(err: impl std::fmt::Display) -> AggregatorError {
    AggregatorError::mets(format!("XML is not well formed: {}", err))
}

impl Element {
    fn from_start(
        namespace: Option<String>,
        start: &BytesStart<'_>,
        reader: &NsReader<&[u8]>,
    ) -> Result<Self> {
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(xml_error)?;
            let qname = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let attr_namespace = if prefix_part(&qname).is_some() {
                owned_namespace(reader.resolve_attribute(attr.key).0)
            } else {
                None
            };
            attributes.push(Attribute {
                qname,
                namespace: attr_namespace,
                value: attr.unescape_value().map_err(xml_error)?.into_owned(),
            });
        }

        Ok(Self {
            namespace,
            qname: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attributes,
            children: Vec::new(),
        })
    }

    pub fn local_name(&self) -> &str {
        local_part(&self.qname)
    }

    pub fn is(&self, local_name: &str) -> bool {
        self.local_name() == local_name
    }

    /// Attribute value by local name, ignoring any prefix.
    pub fn attr(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| !a.is_namespace_declaration() && a.local_name() == local_name)
            .map(|a| a.value.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.elements().find(|el| el.is(local_name))
    }

    /// All descendants named `local_name`, in document order.
    pub fn descendants(&self, local_name: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        self.collect_descendants(local_name, &mut found);
        found
    }

    fn collect_descendants<'a>(&'a self, local_name: &str, found: &mut Vec<&'a Element>) {
        for el in self.elements() {
            if el.is(local_name) {
                found.push(el);
            }
            el.collect_descendants(local_name, found);
        }
    }

    pub fn first_descendant(&self, local_name: &str) -> Option<&Element> {
        for el in self.elements() {
            if el.is(local_name) {
                return Some(el);
            }
            if let Some(found) = el.first_descendant(local_name) {
                return Some(found);
            }
        }
        None
    }

    /// Concatenated text content of this element and its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Element(el) => el.collect_text(out),
            }
        }
    }

    /// Trimmed text of the first descendant named `local_name`; empty
    /// values count as missing.
    pub fn descendant_text(&self, local_name: &str) -> Option<String> {
        self.first_descendant(local_name)
            .map(|el| el.text().trim().to_string())
            .filter(|text| !text.is_empty())
    }

    /// Serialize this subtree, declaring any namespace prefix it uses but
    /// inherited from an ancestor.
    pub fn to_xml(&self) -> String {
        let mut used = BTreeMap::new();
        let mut declared = Vec::new();
        self.collect_namespaces(&mut used, &mut declared);

        let missing: Vec<(String, String)> = used
            .into_iter()
            .filter(|(prefix, _)| !declared.contains(prefix))
            .collect();

        let mut out = String::new();
        self.write_xml(&mut out, &missing);
        out
    }

    fn collect_namespaces(&self, used: &mut BTreeMap<String, String>, declared: &mut Vec<String>) {
        if let Some(ref ns) = self.namespace {
            let prefix = prefix_part(&self.qname).unwrap_or_default().to_string();
            used.entry(prefix).or_insert_with(|| ns.clone());
        }
        for attr in &self.attributes {
            if attr.qname == "xmlns" {
                declared.push(String::new());
            } else if let Some(prefix) = attr.qname.strip_prefix("xmlns:") {
                declared.push(prefix.to_string());
            } else if let (Some(prefix), Some(ns)) = (prefix_part(&attr.qname), &attr.namespace) {
                if prefix != "xml" {
                    used.entry(prefix.to_string()).or_insert_with(|| ns.clone());
                }
            }
        }
        for el in self.elements() {
            el.collect_namespaces(used, declared);
        }
    }

    fn write_xml(&self, out: &mut String, extra_declarations: &[(String, String)]) {
        out.push('<');
        out.push_str(&self.qname);
        for (prefix, ns) in extra_declarations {
            if prefix.is_empty() {
                out.push_str(&format!(" xmlns=\"{}\"", escape(ns.as_str())));
            } else {
                out.push_str(&format!(" xmlns:{}=\"{}\"", prefix, escape(ns.as_str())));
            }
        }
        for attr in &self.attributes {
            out.push_str(&format!(" {}=\"{}\"", attr.qname, escape(attr.value.as_str())));
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        for node in &self.children {
            match node {
                Node::Text(text) => out.push_str(&escape(text.as_str())),
                Node::Element(el) => el.write_xml(out, &[]),
            }
        }
        out.push_str("</");
        out.push_str(&self.qname);
        out.push('>');
    }
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => return Err(AggregatorError::mets("document has more than one root element")),
    }
    Ok(())
}

/// Parse a complete XML document into its root element.
pub fn parse_document(xml: &[u8]) -> Result<Element> {
    let mut reader = NsReader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let (resolved, event) = reader.read_resolved_event_into(&mut buf).map_err(xml_error)?;
        let namespace = owned_namespace(resolved);
        match event {
            Event::Start(ref start) => {
                stack.push(Element::from_start(namespace, start, &reader)?);
            },
            Event::Empty(ref start) => {
                let element = Element::from_start(namespace, start, &reader)?;
                attach(&mut stack, &mut root, element)?;
            },
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| AggregatorError::mets("unexpected closing tag"))?;
                attach(&mut stack, &mut root, element)?;
            },
            Event::Text(ref text) => {
                let text = text.unescape().map_err(xml_error)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::Text(text.into_owned()));
                }
            },
            Event::CData(ref data) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(data).into_owned();
                    parent.children.push(Node::Text(text));
                }
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(AggregatorError::mets("document ended inside an open element"));
    }
    root.ok_or_else(|| AggregatorError::mets("document has no root element"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0"?>
<mets:mets xmlns:mets="http://www.loc.gov/METS/" xmlns:premis="http://www.loc.gov/premis/v3"
           xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <mets:amdSec ID="amdSec_1">
    <premis:object xsi:type="premis:file">
      <premis:size>42</premis:size>
      <premis:note>a &amp; b</premis:note>
    </premis:object>
  </mets:amdSec>
  <mets:file ID="file-1"/>
</mets:mets>"#;

    #[test]
    fn test_tree_and_namespaces() {
        let root = parse_document(DOC.as_bytes()).unwrap();
        assert!(root.is("mets"));
        assert_eq!(root.namespace.as_deref(), Some("http://www.loc.gov/METS/"));

        let object = root.first_descendant("object").unwrap();
        assert_eq!(object.namespace.as_deref(), Some("http://www.loc.gov/premis/v3"));
        assert_eq!(object.descendant_text("size").as_deref(), Some("42"));
        assert_eq!(object.descendant_text("note").as_deref(), Some("a & b"));
        assert_eq!(root.child("amdSec").unwrap().attr("ID"), Some("amdSec_1"));
        assert_eq!(root.descendants("file").len(), 1);
    }

    #[test]
    fn test_subtree_serialization_declares_prefix() {
        let root = parse_document(DOC.as_bytes()).unwrap();
        let xml = root.first_descendant("object").unwrap().to_xml();
        assert!(xml.starts_with(
            r#"<premis:object xmlns:premis="http://www.loc.gov/premis/v3" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="premis:file">"#
        ), "{}", xml);
        assert!(xml.contains("<premis:note>a &amp; b</premis:note>"));

        let reparsed = parse_document(xml.as_bytes()).unwrap();
        assert_eq!(reparsed.descendant_text("size").as_deref(), Some("42"));
    }

    #[test]
    fn test_malformed_documents() {
        assert!(parse_document(b"<mets><file></mets>").is_err());
        assert!(parse_document(b"<mets>").is_err());
        assert!(parse_document(b"").is_err());
    }
}
