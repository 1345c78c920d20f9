//! Preferences document model and its XML form
//!
//! ```xml
//! <preferences>
//!   <root type="user">
//!     <node name="app">
//!       <map>
//!         <entry key="x.y.z" value="42" meta="[i,n]"/>
//!       </map>
//!     </node>
//!   </root>
//! </preferences>
//! ```
//!
//! Lookups are linear scans; documents hold a few hundred entries at most.

use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::name::QName;

use crate::constants::flat::PATH_SEPARATOR;
use crate::constants::tree::*;
use crate::error::{CfgError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub key: String,
    pub value: String,
    pub meta: String,
}

/// One `node` element and the entries of its `map`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeNode {
    pub name: String,
    pub entries: Vec<TreeEntry>,
}

impl TreeNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn entry(&self, key: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    /// Overwrite the entry for `key`, appending it if absent
    pub fn upsert(&mut self, key: &str, value: &str, meta: &str) {
        match self.entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => {
                entry.value = value.to_string();
                entry.meta = meta.to_string();
            }
            None => self.entries.push(TreeEntry {
                key: key.to_string(),
                value: value.to_string(),
                meta: meta.to_string(),
            }),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.key != key);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Upsert every entry of `other`; entries only present here are kept
    pub fn merge_from(&mut self, other: &TreeNode) {
        for entry in &other.entries {
            self.upsert(&entry.key, &entry.value, &entry.meta);
        }
    }
}

/// The user root of a preferences document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefsTree {
    pub nodes: Vec<TreeNode>,
}

impl PrefsTree {
    pub fn node(&self, name: &str) -> Option<&TreeNode> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut TreeNode> {
        self.nodes.iter_mut().find(|node| node.name == name)
    }

    pub fn node_or_insert(&mut self, name: &str) -> &mut TreeNode {
        let index = self.node_index_or_insert(name);
        &mut self.nodes[index]
    }

    fn node_index_or_insert(&mut self, name: &str) -> usize {
        match self.nodes.iter().position(|node| node.name == name) {
            Some(index) => index,
            None => {
                self.nodes.push(TreeNode::new(name));
                self.nodes.len() - 1
            }
        }
    }

    /// Parse a preferences document.
    ///
    /// Nested `node` elements are flattened to `parent/child` names. Entries
    /// missing `key`, `value` or `meta` fail the whole document.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut tree = PrefsTree::default();
        let mut seen_document = false;
        let mut in_user_root = false;
        // Depth inside a root other than the user root
        let mut skip_depth = 0usize;
        let mut node_stack: Vec<usize> = Vec::new();
        let mut in_map = false;

        loop {
            match reader.read_event()? {
                Event::Start(ref e) => {
                    if skip_depth > 0 {
                        skip_depth += 1;
                        continue;
                    }
                    match e.name().as_ref() {
                        name if !seen_document => {
                            check_document_element(name)?;
                            seen_document = true;
                        }
                        b"root" if !in_user_root => {
                            if attribute(e, ROOT_TYPE_ATTR)?.as_deref() == Some(ROOT_TYPE_USER) {
                                in_user_root = true;
                            } else {
                                skip_depth = 1;
                            }
                        }
                        b"node" if in_user_root => {
                            let index = open_node(&mut tree, &node_stack, e)?;
                            node_stack.push(index);
                        }
                        b"map" if !node_stack.is_empty() => in_map = true,
                        b"entry" if in_map => push_entry(&mut tree, &node_stack, e)?,
                        _ => {}
                    }
                }
                Event::Empty(ref e) => {
                    if skip_depth > 0 {
                        continue;
                    }
                    match e.name().as_ref() {
                        name if !seen_document => {
                            check_document_element(name)?;
                            seen_document = true;
                        }
                        b"node" if in_user_root => {
                            open_node(&mut tree, &node_stack, e)?;
                        }
                        b"entry" if in_map => push_entry(&mut tree, &node_stack, e)?,
                        _ => {}
                    }
                }
                Event::End(ref e) => {
                    if skip_depth > 0 {
                        skip_depth -= 1;
                        continue;
                    }
                    match e.name().as_ref() {
                        b"map" => in_map = false,
                        b"node" => {
                            node_stack.pop();
                        }
                        b"root" => in_user_root = false,
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_document {
            return Err(CfgError::invalid(format!("missing '{PREFERENCES}' element")));
        }
        Ok(tree)
    }

    /// Serialize the whole tree as an indented UTF-8 document
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', INDENT);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("no"))))?;
        writer.write_event(Event::Start(BytesStart::new(PREFERENCES)))?;

        let mut root = BytesStart::new(ROOT);
        root.push_attribute((ROOT_TYPE_ATTR, ROOT_TYPE_USER));
        writer.write_event(Event::Start(root))?;

        for node in &self.nodes {
            let mut element = BytesStart::new(NODE);
            element.push_attribute(escaped_attribute(NODE_NAME_ATTR, &node.name));
            writer.write_event(Event::Start(element))?;

            if node.entries.is_empty() {
                writer.write_event(Event::Empty(BytesStart::new(MAP)))?;
            } else {
                writer.write_event(Event::Start(BytesStart::new(MAP)))?;
                for entry in &node.entries {
                    let mut element = BytesStart::new(ENTRY);
                    element.push_attribute(escaped_attribute(KEY_ATTR, &entry.key));
                    element.push_attribute(escaped_attribute(VALUE_ATTR, &entry.value));
                    element.push_attribute(escaped_attribute(META_ATTR, &entry.meta));
                    writer.write_event(Event::Empty(element))?;
                }
                writer.write_event(Event::End(BytesEnd::new(MAP)))?;
            }
            writer.write_event(Event::End(BytesEnd::new(NODE)))?;
        }

        writer.write_event(Event::End(BytesEnd::new(ROOT)))?;
        writer.write_event(Event::End(BytesEnd::new(PREFERENCES)))?;

        let mut xml = String::from_utf8(writer.into_inner())
            .map_err(|err| CfgError::invalid(err.to_string()))?;
        xml.push('\n');
        Ok(xml)
    }
}

fn check_document_element(name: &[u8]) -> Result<()> {
    if name == PREFERENCES.as_bytes() {
        return Ok(());
    }
    Err(CfgError::invalid(format!(
        "document element is '{}', expected '{PREFERENCES}'",
        String::from_utf8_lossy(name)
    )))
}

/// Attribute with markup and whitespace control characters escaped, so
/// readers that normalize attribute whitespace keep newlines and tabs
fn escaped_attribute<'a>(name: &'a str, value: &str) -> Attribute<'a> {
    let escaped = escape(value)
        .replace('\n', "&#10;")
        .replace('\r', "&#13;")
        .replace('\t', "&#9;");
    Attribute {
        key: QName(name.as_bytes()),
        value: Cow::Owned(escaped.into_bytes()),
    }
}

/// Unescaped value of attribute `name`, if present
fn attribute(element: &BytesStart, name: &str) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == name.as_bytes() {
            let raw = std::str::from_utf8(&attr.value)?;
            let value: Cow<str> = unescape(raw)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn required_attribute(element: &BytesStart, name: &str) -> Result<String> {
    attribute(element, name)?.ok_or_else(|| {
        CfgError::invalid(format!(
            "<{}> is missing required attribute '{name}'",
            String::from_utf8_lossy(element.name().as_ref())
        ))
    })
}

fn open_node(tree: &mut PrefsTree, node_stack: &[usize], element: &BytesStart) -> Result<usize> {
    let name = required_attribute(element, NODE_NAME_ATTR)?;
    let full_name = match node_stack.last() {
        Some(&parent) => format!("{}{PATH_SEPARATOR}{name}", tree.nodes[parent].name),
        None => name,
    };
    Ok(tree.node_index_or_insert(&full_name))
}

fn push_entry(tree: &mut PrefsTree, node_stack: &[usize], element: &BytesStart) -> Result<()> {
    let key = required_attribute(element, KEY_ATTR)?;
    let value = required_attribute(element, VALUE_ATTR)?;
    let meta = required_attribute(element, META_ATTR)?;
    if let Some(&index) = node_stack.last() {
        tree.nodes[index].upsert(&key, &value, &meta);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<!DOCTYPE preferences SYSTEM "http://java.sun.com/dtd/preferences.dtd">
<preferences EXTERNAL_XML_VERSION="1.0">
  <root type="system">
    <map/>
    <node name="ignored">
      <map><entry key="k" value="v" meta="[s,n]"/></map>
    </node>
  </root>
  <root type="user">
    <map/>
    <node name="app1">
      <map>
        <entry key="x.y.z" value="42" meta="[i,n]"/>
        <entry key="title" value="Fish &amp; &quot;Chips&quot;" meta="[s,r]"/>
      </map>
      <node name="child">
        <map>
          <entry key="frame" value="1,2,3,4" meta="[r,n]"/>
        </map>
      </node>
    </node>
    <node name="app2">
      <map/>
    </node>
  </root>
</preferences>
"#;

    #[test]
    fn test_parse_sample_document() {
        let tree = PrefsTree::parse(SAMPLE).unwrap();
        let names: Vec<&str> = tree.nodes.iter().map(|node| node.name.as_str()).collect();
        assert_eq!(names, ["app1", "app1/child", "app2"]);

        let app1 = tree.node("app1").unwrap();
        assert_eq!(app1.entries.len(), 2);
        assert_eq!(app1.entry("x.y.z").unwrap().value, "42");
        assert_eq!(app1.entry("title").unwrap().value, "Fish & \"Chips\"");
        assert_eq!(app1.entry("title").unwrap().meta, "[s,r]");

        assert_eq!(tree.node("app1/child").unwrap().entry("frame").unwrap().meta, "[r,n]");
        assert!(tree.node("app2").unwrap().entries.is_empty());
        assert!(tree.node("ignored").is_none());
    }

    #[test]
    fn test_missing_entry_attribute_is_an_error() {
        for entry in [
            r#"<entry value="1" meta="[i,n]"/>"#,
            r#"<entry key="k" meta="[i,n]"/>"#,
            r#"<entry key="k" value="1"/>"#,
        ] {
            let xml = format!(
                r#"<preferences><root type="user"><node name="app"><map>{entry}</map></node></root></preferences>"#
            );
            assert!(
                matches!(PrefsTree::parse(&xml), Err(CfgError::InvalidEncoding(_))),
                "expected failure for {entry}"
            );
        }
    }

    #[test]
    fn test_wrong_document_element() {
        assert!(PrefsTree::parse("<settings/>").is_err());
        assert!(PrefsTree::parse("").is_err());
        assert_eq!(PrefsTree::parse("<preferences/>").unwrap(), PrefsTree::default());
    }

    #[test]
    fn test_serialize_then_parse() {
        let mut tree = PrefsTree::default();
        let node = tree.node_or_insert("app");
        node.upsert("a", "<tag> & 'quote'", "[s,n]");
        node.upsert("b", "3,4", "[p,r]");
        tree.node_or_insert("empty");

        let xml = tree.to_xml().unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"no\"?>"));
        assert!(xml.contains(r#"<root type="user">"#));
        assert!(xml.contains(r#"<node name="app">"#));
        assert!(!xml.contains("<tag>"));

        assert_eq!(PrefsTree::parse(&xml).unwrap(), tree);
    }

    #[test]
    fn test_multiline_value_survives_attribute_normalization() {
        let mut tree = PrefsTree::default();
        tree.node_or_insert("app").upsert("notes", "line1\nline2\tx\r\nend", "[s,n]");

        let xml = tree.to_xml().unwrap();
        assert!(xml.contains(r#"value="line1&#10;line2&#9;x&#13;&#10;end""#));
        assert!(xml.lines().all(|line| !line.trim_start().starts_with("line2")));

        let parsed = PrefsTree::parse(&xml).unwrap();
        assert_eq!(
            parsed.node("app").unwrap().entry("notes").unwrap().value,
            "line1\nline2\tx\r\nend"
        );
    }

    #[test]
    fn test_node_merge_keeps_unrelated_entries() {
        let mut cache = TreeNode::new("app");
        cache.upsert("keep", "1", "[i,n]");
        cache.upsert("shared", "old", "[s,n]");

        let mut parsed = TreeNode::new("app");
        parsed.upsert("shared", "new", "[s,r]");
        parsed.upsert("added", "true", "[b,n]");

        cache.merge_from(&parsed);
        assert_eq!(cache.entries.len(), 3);
        assert_eq!(cache.entry("keep").unwrap().value, "1");
        assert_eq!(cache.entry("shared").unwrap().value, "new");
        assert_eq!(cache.entry("shared").unwrap().meta, "[s,r]");
        assert_eq!(cache.entry("added").unwrap().value, "true");
    }

    #[test]
    fn test_remove_and_clear() {
        let mut node = TreeNode::new("app");
        node.upsert("a", "1", "[i,n]");
        node.upsert("b", "2", "[i,n]");
        assert!(node.remove("a"));
        assert!(!node.remove("a"));
        assert_eq!(node.entries.len(), 1);
        node.clear();
        assert!(node.entries.is_empty());
    }
}
