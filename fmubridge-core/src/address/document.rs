//! Address document parsing.

use std::convert::TryFrom;
use std::path::Path;

use roxmltree::{Document, Node};

use crate::error::{Error, Result};
use crate::util;

use super::AddressEntry;

const ROOT_ELEMENT: &str = "ADDRESS-CALCULATOR";
const MEMORY_ELEMENT: &str = "MEMORY-ELEMENT";
const LABEL_NAME: &str = "LABEL-NAME";
const NAME: &str = "NAME";
const ABSOLUTE_ADDRESS: &str = "ABSOLUTE-ADDRESS";
const ROOT_OFFSET: &str = "ROOT-OFFSET";
const SIZE: &str = "SIZE";
const ARRAY_NBR_ELEMENTS: &str = "ARRAY-NBR-ELEMENTS";
const ARRAY_ELEMENT_SIZE: &str = "ARRAY-ELEMENT-SIZE";
const CATEGORY: &str = "CATEGORY";
const EXTERNAL: &str = "EXTERNAL";

/// Parses the whole document, returning every memory element it describes.
///
/// `source` is the document's file stem. With `multiple` set, keys are
/// prefixed with it.
pub(crate) fn parse(path: &Path, source: &str, text: &str, multiple: bool) -> Result<Vec<AddressEntry>> {
    let doc = Document::parse(text).map_err(|e| malformed(path, e.to_string()))?;
    let root = doc.root_element();
    if !root.has_tag_name(ROOT_ELEMENT) {
        return Err(malformed(
            path,
            format!(
                "root element is `{}`, expected `{}`",
                root.tag_name().name(),
                ROOT_ELEMENT
            ),
        ));
    }
    if !is_closed(text, root) {
        return Err(malformed(
            path,
            format!("`{}` is not closed, document truncated", ROOT_ELEMENT),
        ));
    }

    let mut entries = Vec::new();
    for node in root.children().filter(|n| n.has_tag_name(MEMORY_ELEMENT)) {
        let entry = parse_memory_element(node, source, multiple)
            .map_err(|reason| malformed(path, reason))?;
        entries.push(entry);
    }
    trace!("parsed {} memory elements from {:?}", entries.len(), path);
    Ok(entries)
}

fn parse_memory_element(
    node: Node,
    source: &str,
    multiple: bool,
) -> std::result::Result<AddressEntry, String> {
    let is_external = !child_text(node, EXTERNAL).is_empty();
    let name = if is_external {
        child_text(node, NAME)
    } else {
        child_text(node, LABEL_NAME)
    };
    let name = if multiple {
        format!("{}_{}", source, name)
    } else {
        name.to_string()
    };

    let offset = auto_radix_field(node, ROOT_OFFSET)?;
    Ok(AddressEntry {
        address: auto_radix_field(node, ABSOLUTE_ADDRESS)?,
        offset: u32::try_from(offset)
            .map_err(|e| format!("{} out of range: {}", ROOT_OFFSET, e))?,
        size: decimal_field(node, SIZE)?,
        element_count: decimal_field(node, ARRAY_NBR_ELEMENTS)?,
        element_size: decimal_field(node, ARRAY_ELEMENT_SIZE)?,
        is_array: !child_text(node, CATEGORY).is_empty(),
        source: source.to_string(),
        name,
    })
}

/// Whether the root element ends with its own end tag or is self-closing.
fn is_closed(text: &str, root: Node) -> bool {
    let span = match text.get(root.range().start..) {
        Some(s) => s,
        None => return false,
    };
    let end_tag = format!("</{}", ROOT_ELEMENT);
    match span.rfind(&end_tag) {
        Some(pos) => span[pos + end_tag.len()..].trim_start().starts_with('>'),
        None => {
            !root.has_children()
                && span.find('>').map_or(false, |end| span[..end].ends_with('/'))
        }
    }
}

/// Text of the first child element with the given tag, or an empty string.
fn child_text<'a>(node: Node<'a, '_>, tag: &str) -> &'a str {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map(str::trim)
        .unwrap_or("")
}

fn auto_radix_field(node: Node, tag: &str) -> std::result::Result<i64, String> {
    let text = child_text(node, tag);
    if text.is_empty() {
        return Ok(0);
    }
    util::parse_auto_radix(text).map_err(|e| util::invalid_literal(tag, text, e))
}

fn decimal_field<T>(node: Node, tag: &str) -> std::result::Result<T, String>
where
    T: std::str::FromStr + Default,
    T::Err: Into<Error>,
{
    let text = child_text(node, tag);
    if text.is_empty() {
        return Ok(T::default());
    }
    text.parse::<T>()
        .map_err(|e| util::invalid_literal(tag, text, e.into()))
}

fn malformed(path: &Path, reason: String) -> Error {
    Error::AddressDocument {
        path: path.to_path_buf(),
        reason,
    }
}
