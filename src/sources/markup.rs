//! XML reader: the most frequent record-like element becomes a row, its leaf
//! children (and attributes) the columns.

use super::{row_from_cells, SourceKind, TabularSource};
use crate::error::{PipelineError, Result};
use crate::types::RawRow;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Default)]
struct Node {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<usize>,
}

fn local_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn open_node(nodes: &mut Vec<Node>, stack: &[usize], e: &BytesStart) -> Result<usize> {
    let mut node = Node {
        name: local_name(e.local_name().as_ref()),
        ..Node::default()
    };
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        node.attributes.push((
            local_name(attr.key.local_name().as_ref()),
            attr.unescape_value()?.into_owned(),
        ));
    }
    let idx = nodes.len();
    nodes.push(node);
    if let Some(&parent) = stack.last() {
        nodes[parent].children.push(idx);
    }
    Ok(idx)
}

fn parse_tree(content: &str) -> Result<Vec<Node>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut nodes: Vec<Node> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let idx = open_node(&mut nodes, &stack, &e)?;
                stack.push(idx);
            }
            Event::Empty(e) => {
                open_node(&mut nodes, &stack, &e)?;
            }
            Event::Text(t) => {
                if let Some(&current) = stack.last() {
                    nodes[current].text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(&current) = stack.last() {
                    nodes[current].text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(nodes)
}

fn is_leaf(node: &Node) -> bool {
    node.children.is_empty()
}

/// Name of the most frequent element whose children are all leaves.
fn record_element(nodes: &[Node]) -> Option<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for node in nodes {
        if node.children.is_empty() || !node.children.iter().all(|&c| is_leaf(&nodes[c])) {
            continue;
        }
        match counts.iter_mut().find(|(n, _)| *n == node.name) {
            Some((_, count)) => *count += 1,
            None => counts.push((node.name.clone(), 1)),
        }
    }
    let mut best: Option<(String, usize)> = None;
    for (name, count) in counts {
        if best.as_ref().map(|(_, c)| count > *c).unwrap_or(true) {
            best = Some((name, count));
        }
    }
    best.map(|(name, _)| name)
}

/// Fields of one record in document order; repeated names get `_2`, `_3`.
fn record_fields(nodes: &[Node], record: &Node) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = record.attributes.clone();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (name, _) in &fields {
        seen.insert(name.clone(), 1);
    }
    for &child in &record.children {
        let node = &nodes[child];
        let count = seen.entry(node.name.clone()).or_insert(0);
        *count += 1;
        let key = if *count == 1 {
            node.name.clone()
        } else {
            format!("{}_{}", node.name, count)
        };
        let mut value = node.text.clone();
        if value.is_empty() {
            if let Some((_, v)) = node.attributes.first() {
                value = v.clone();
            }
        }
        fields.push((key, value));
    }
    fields
}

pub(super) fn open(path: &Path) -> Result<TabularSource> {
    let content = fs::read_to_string(path)?;
    let nodes = parse_tree(&content)?;
    let record = record_element(&nodes)
        .ok_or_else(|| PipelineError::Extraction("no repeated record element found".to_string()))?;

    let records: Vec<Vec<(String, String)>> = nodes
        .iter()
        .filter(|n| n.name == record && !n.children.is_empty())
        .map(|n| record_fields(&nodes, n))
        .collect();

    let mut headers: Vec<String> = Vec::new();
    for fields in &records {
        for (key, _) in fields {
            if !headers.contains(key) {
                headers.push(key.clone());
            }
        }
    }
    tracing::debug!(record = %record, rows = records.len(), columns = headers.len(), "xml records found");

    let row_headers = headers.clone();
    let rows = records.into_iter().map(move |fields| -> Result<RawRow> {
        let cells = row_headers.iter().map(|h| {
            fields
                .iter()
                .find(|(k, _)| k == h)
                .map(|(_, v)| Value::String(v.clone()))
                .unwrap_or(Value::Null)
        });
        Ok(row_from_cells(&row_headers, cells.collect::<Vec<_>>()))
    });

    Ok(TabularSource::new(SourceKind::Xml, headers, 0.85, Box::new(rows)))
}

#[cfg(test)]
mod tests {
    use super::super::open_source;
    use super::*;
    use serde_json::json;

    const CATALOG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<catalogo generado="2024-03-01">
  <producto codigo="A-1">
    <nombre>Tornillo &amp; tuerca</nombre>
    <precio>0.25</precio>
  </producto>
  <producto codigo="A-2">
    <nombre><![CDATA[Arandela]]></nombre>
    <precio>0.10</precio>
    <stock>40</stock>
  </producto>
</catalogo>"#;

    #[test]
    fn record_element_is_the_repeated_one() {
        let nodes = parse_tree(CATALOG).unwrap();
        assert_eq!(record_element(&nodes).as_deref(), Some("producto"));
    }

    #[test]
    fn records_become_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalogo.xml");
        std::fs::write(&path, CATALOG).unwrap();
        let source = open_source(&path, None).unwrap();
        assert_eq!(source.headers, vec!["codigo", "nombre", "precio", "stock"]);
        let rows: Vec<_> = source.map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["nombre"], json!("Tornillo & tuerca"));
        assert_eq!(rows[0]["stock"], json!(null));
        assert_eq!(rows[1]["nombre"], json!("Arandela"));
        assert_eq!(rows[1]["codigo"], json!("A-2"));
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_tree("<a><b></a>").is_err());
    }
}
