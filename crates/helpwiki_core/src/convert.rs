use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::escape::escape;
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::{Catalog, DESCRIPTION_KEY, DocumentRecord, TITLE_KEY};
use crate::error::{Error, Result};
use crate::hierarchy::Forest;
use crate::markup::Document;
use crate::metadata::first_value;
use crate::paths::{display_path, relative_path};
use crate::resolve::ReferenceResolver;

pub const INDEX_FILENAME: &str = "index.html";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvertReport {
    pub output_root: PathBuf,
    pub documents_written: usize,
    pub assets_written: usize,
    pub index_path: PathBuf,
    pub index_entries: usize,
}

/// Write a browsable copy of the catalog under `output_root`: every asset,
/// every document with its links made relative, and an `index.html` outline.
pub fn convert_standalone(
    catalog: &Catalog,
    forest: &Forest,
    output_root: &Path,
) -> Result<ConvertReport> {
    let mut report = ConvertReport {
        output_root: output_root.to_path_buf(),
        ..ConvertReport::default()
    };

    for (destination, bytes) in catalog.assets().iter() {
        write_file(destination, bytes)?;
        report.assets_written += 1;
    }
    debug!(count = report.assets_written, "assets written");

    let resolver = ReferenceResolver::standalone(catalog);
    for record in catalog.documents() {
        let content = rewrite_standalone(&resolver, record)?;
        let xml = content
            .to_xml()
            .map_err(|error| Error::parse(&record.source_path, error))?;
        write_file(&record.destination_path, xml.as_bytes())?;
        report.documents_written += 1;
    }

    let lines = index_lines(catalog, forest, output_root);
    report.index_entries = lines.len();
    report.index_path = output_root.join(INDEX_FILENAME);
    write_file(&report.index_path, lines.concat().as_bytes())?;

    info!(
        documents = report.documents_written,
        assets = report.assets_written,
        index = %report.index_path.display(),
        "standalone conversion complete"
    );
    Ok(report)
}

/// Clone of the document with `img src`, `a href` and `link href` rewritten
/// relative to the document's own directory.
pub fn rewrite_standalone(
    resolver: &ReferenceResolver<'_>,
    record: &DocumentRecord,
) -> Result<Document> {
    let mut content = record.content.clone();
    let base = record.destination_dir();
    let mut failure = None;

    for (elements, attribute) in [(&["img"][..], "src"), (&["a", "link"][..], "href")] {
        content.for_each_element_mut(elements, |element| {
            if failure.is_some() {
                return;
            }
            let Some(reference) = element.attribute(attribute) else {
                return;
            };
            match resolver.resolve(reference, Some(base)) {
                Ok(rewritten) => element.set_attribute(attribute, &rewritten),
                Err(error) => failure = Some(error),
            }
        });
    }

    match failure {
        Some(error) => Err(error),
        None => Ok(content),
    }
}

fn index_lines(catalog: &Catalog, forest: &Forest, output_root: &Path) -> Vec<String> {
    forest
        .preorder()
        .filter_map(|node_id| {
            let record = catalog.document(&forest.node(node_id).internal_id)?;
            let title = first_value(&record.metadata, TITLE_KEY)
                .map(ToString::to_string)
                .unwrap_or_else(|| display_path(&record.destination_path));
            let description = first_value(&record.metadata, DESCRIPTION_KEY)
                .filter(|description| *description != title);
            let href = relative_path(&record.destination_path, output_root);

            let title_attribute = description
                .map(|description| format!(" title=\"{}\"", escape(description)))
                .unwrap_or_default();
            Some(format!(
                "{} <a{title_attribute} href=\"{}\">{}</a> <br />\n",
                "&nbsp;".repeat(forest.depth(node_id) + 1),
                escape(href.as_str()),
                escape(title.as_str()),
            ))
        })
        .collect()
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|error| Error::io(parent, error))?;
    }
    fs::write(path, bytes).map_err(|error| Error::io(path, error))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::convert_standalone;
    use crate::archive::ArchiveEntry;
    use crate::catalog::Catalog;
    use crate::catalog::tests::{asset, mshc_options, topic};
    use crate::error::Error;
    use crate::hierarchy::Forest;

    #[test]
    fn writes_documents_assets_and_index() {
        let temp = tempdir().expect("tempdir");
        let output_root = temp.path().join("out");
        let output = output_root.to_string_lossy().into_owned();

        let catalog = Catalog::build(
            vec![
                topic(
                    "docs/a/index.html",
                    "100",
                    None,
                    r#"<link href="shared.css"/><img src="images/foo.png"/><a href="default.htm?Id=12345#s">next</a><a href="http://example.com">ext</a>"#,
                ),
                topic("docs/b/page.html", "12345", Some("100"), ""),
                asset("images/foo.png"),
                asset("shared.css"),
            ],
            &mshc_options(&output),
        )
        .expect("catalog");
        let forest = Forest::from_catalog(&catalog).expect("forest");
        let original = catalog.document("100").expect("doc").content.clone();

        let report = convert_standalone(&catalog, &forest, &output_root).expect("convert");
        assert_eq!(report.documents_written, 2);
        assert_eq!(report.assets_written, 2);
        assert_eq!(report.index_entries, 2);

        assert!(output_root.join("images/foo.png").exists());
        assert!(output_root.join("shared.css").exists());

        let page = fs::read_to_string(output_root.join("docs/a/index.html")).expect("page");
        assert!(page.contains("src=\"../../images/foo.png\""));
        assert!(page.contains("href=\"../../shared.css\""));
        assert!(page.contains("href=\"../b/page.html#s\""));
        assert!(page.contains("href=\"http://example.com\""));
        assert_eq!(catalog.document("100").expect("doc").content, original);

        let index = fs::read_to_string(output_root.join("index.html")).expect("index");
        let lines = index.lines().collect::<Vec<_>>();
        assert_eq!(
            lines[0],
            "&nbsp; <a href=\"docs/a/index.html\">Topic 100</a> <br />"
        );
        assert!(lines[1].starts_with("&nbsp;&nbsp; <a href=\"docs/b/page.html\">"));
    }

    #[test]
    fn index_escapes_title_and_description() {
        let temp = tempdir().expect("tempdir");
        let output_root = temp.path().join("out");
        let entry = ArchiveEntry {
            path: "a.htm".to_string(),
            bytes: br#"<html><head><meta name="Microsoft.Help.Id" content="1"/><meta name="Title" content="A &amp; B"/><meta name="Description" content="x &lt; y"/></head></html>"#.to_vec(),
        };
        let catalog = Catalog::build(
            vec![entry],
            &mshc_options(&output_root.to_string_lossy()),
        )
        .expect("catalog");
        let forest = Forest::from_catalog(&catalog).expect("forest");

        convert_standalone(&catalog, &forest, &output_root).expect("convert");
        let index = fs::read_to_string(output_root.join("index.html")).expect("index");
        assert!(index.contains("title=\"x &lt; y\""));
        assert!(index.contains(">A &amp; B</a>"));
    }

    #[test]
    fn entries_outside_the_output_root_are_never_written() {
        let temp = tempdir().expect("tempdir");
        let output_root = temp.path().join("out");
        let catalog = Catalog::build(
            vec![topic("a.htm", "1", None, ""), asset("../escaped.txt")],
            &mshc_options(&output_root.to_string_lossy()),
        )
        .expect("catalog");
        let forest = Forest::from_catalog(&catalog).expect("forest");

        let report = convert_standalone(&catalog, &forest, &output_root).expect("convert");
        assert_eq!(report.assets_written, 0);
        assert!(!temp.path().join("escaped.txt").exists());
        assert!(output_root.join("a.htm").exists());
    }

    #[test]
    fn unknown_internal_link_fails_conversion() {
        let temp = tempdir().expect("tempdir");
        let output_root = temp.path().join("out");
        let catalog = Catalog::build(
            vec![topic("a.htm", "1", None, r#"<a href="x.htm?Id=404">gone</a>"#)],
            &mshc_options(&output_root.to_string_lossy()),
        )
        .expect("catalog");
        let forest = Forest::from_catalog(&catalog).expect("forest");

        let error = convert_standalone(&catalog, &forest, &output_root).expect_err("must fail");
        assert!(matches!(error, Error::UnresolvedReference { .. }));
    }
}
