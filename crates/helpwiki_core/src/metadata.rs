use std::collections::BTreeMap;
use std::path::Path;

use encoding_rs::Encoding;

use crate::error::{Error, Result};
use crate::markup::Document;

/// Synthetic key recording where a document is written to.
pub const PARENT_PATH_KEY: &str = "parent_path";

/// `<meta name>` → every `content` declared for it, in document order.
pub type Metadata = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub metadata: Metadata,
    pub content: Document,
}

/// Resolve an encoding label such as `windows-1252` or `utf-8`.
pub fn encoding_for_label(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

/// A byte order mark takes precedence over `encoding` and is stripped.
pub fn decode(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

/// Decode and parse one help topic, collecting its metadata.
///
/// `source_path` is only used for error messages; `destination` is recorded
/// under [`PARENT_PATH_KEY`].
pub fn parse_document(
    source_path: &str,
    destination: &Path,
    bytes: &[u8],
    encoding: &'static Encoding,
) -> Result<ParsedDocument> {
    let text = decode(bytes, encoding);
    let content = Document::parse(&text).map_err(|error| Error::parse(source_path, error))?;

    let mut metadata = collect_metadata(&content);
    metadata.insert(
        PARENT_PATH_KEY.to_string(),
        vec![destination.to_string_lossy().replace('\\', "/")],
    );
    Ok(ParsedDocument { metadata, content })
}

pub fn collect_metadata(document: &Document) -> Metadata {
    let mut metadata = Metadata::new();
    for element in document.elements("meta") {
        if let (Some(name), Some(content)) = (element.attribute("name"), element.attribute("content"))
        {
            metadata
                .entry(name.to_string())
                .or_default()
                .push(content.to_string());
        }
    }
    metadata
}

pub fn first_value<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
}

/// Text of the first `<title>` element, if any.
pub fn document_title(document: &Document) -> Option<String> {
    document
        .elements("title")
        .first()
        .map(|title| title.text().trim().to_string())
        .filter(|title| !title.is_empty())
}
