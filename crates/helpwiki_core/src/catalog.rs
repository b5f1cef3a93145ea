//! In-memory view of one help source: documents by internal id, assets by
//! destination path, and the shared paths emitted at the output root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::archive::{ArchiveEntry, EntryKind};
use crate::error::{Error, Result};
use crate::markup::Document;
use crate::metadata::{Metadata, document_title, first_value, parse_document};
use crate::paths::{basename, is_enclosed, lookup_key, normalize_lexically};

pub const DEFAULT_ID_KEY: &str = "Microsoft.Help.Id";
pub const DEFAULT_PARENT_KEY: &str = "Microsoft.Help.TOCParent";
pub const TITLE_KEY: &str = "Title";
pub const DESCRIPTION_KEY: &str = "Description";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseFailurePolicy {
    #[default]
    Abort,
    Skip,
}

impl ParseFailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Skip => "skip",
        }
    }
}

/// How documents get their identity and parent.
#[derive(Debug, Clone)]
pub enum CatalogLayout {
    /// Identity and TOC parent come from reserved `<meta>` keys.
    Mshc { id_key: String, parent_key: String },
    /// Identity comes from a CHM table of contents. The first listed topic
    /// becomes the parent of every other listed topic.
    ChmToc { order: Vec<String>, id_prefix: String },
}

impl CatalogLayout {
    pub fn mshc() -> Self {
        Self::Mshc {
            id_key: DEFAULT_ID_KEY.to_string(),
            parent_key: DEFAULT_PARENT_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogOptions {
    pub output_root: PathBuf,
    pub encoding: &'static Encoding,
    pub layout: CatalogLayout,
    pub on_parse_error: ParseFailurePolicy,
}

#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub internal_id: String,
    pub parent_id: Option<String>,
    pub source_path: String,
    pub destination_path: PathBuf,
    /// Index in the table of contents, for layouts that have one.
    pub toc_position: Option<usize>,
    pub metadata: Metadata,
    pub content: Document,
}

impl DocumentRecord {
    /// Directory the document is written to; relative links resolve from here.
    pub fn destination_dir(&self) -> &Path {
        self.destination_path.parent().unwrap_or(Path::new(""))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssetStore {
    by_destination: BTreeMap<PathBuf, Vec<u8>>,
    by_key: BTreeMap<String, PathBuf>,
    by_basename: BTreeMap<String, Vec<PathBuf>>,
}

impl AssetStore {
    pub fn insert(&mut self, destination: PathBuf, bytes: Vec<u8>) {
        self.by_key.insert(lookup_key(&destination), destination.clone());
        let name = basename(&destination.to_string_lossy()).to_lowercase();
        let same_name = self.by_basename.entry(name).or_default();
        if !same_name.contains(&destination) {
            same_name.push(destination.clone());
        }
        self.by_destination.insert(destination, bytes);
    }

    pub fn get(&self, destination: &Path) -> Option<&[u8]> {
        self.by_destination.get(destination).map(Vec::as_slice)
    }

    /// First candidate path present in the store (case-insensitive), then a
    /// unique basename match.
    pub fn find(&self, candidates: &[PathBuf]) -> Option<(&Path, &[u8])> {
        for candidate in candidates {
            if let Some(path) = self.by_key.get(&lookup_key(candidate)) {
                return self.entry(path);
            }
        }

        let name = candidates
            .first()
            .map(|candidate| basename(&candidate.to_string_lossy()).to_lowercase())?;
        match self.by_basename.get(&name).map(Vec::as_slice) {
            Some([only]) => self.entry(only),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &[u8])> {
        self.by_destination
            .iter()
            .map(|(path, bytes)| (path.as_path(), bytes.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.by_destination.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_destination.is_empty()
    }

    fn entry(&self, path: &Path) -> Option<(&Path, &[u8])> {
        self.by_destination
            .get_key_value(path)
            .map(|(path, bytes)| (path.as_path(), bytes.as_slice()))
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    output_root: PathBuf,
    documents: BTreeMap<String, DocumentRecord>,
    assets: AssetStore,
    shared_paths: BTreeMap<String, PathBuf>,
    skipped: Vec<String>,
}

pub fn destination_path(output_root: &Path, source_path: &str) -> PathBuf {
    output_root.join(source_path.trim_start_matches('/'))
}

impl Catalog {
    pub fn build(entries: Vec<ArchiveEntry>, options: &CatalogOptions) -> Result<Self> {
        let mut catalog = Self {
            output_root: options.output_root.clone(),
            documents: BTreeMap::new(),
            assets: AssetStore::default(),
            shared_paths: BTreeMap::new(),
            skipped: Vec::new(),
        };

        let toc = match &options.layout {
            CatalogLayout::ChmToc { order, .. } => Some(toc_positions(order)),
            CatalogLayout::Mshc { .. } => None,
        };

        for entry in entries {
            if !is_enclosed(&entry.path) {
                warn!(path = %entry.path, "skipping entry that escapes the output root");
                continue;
            }
            let destination = destination_path(&options.output_root, &entry.path);
            match entry.kind() {
                EntryKind::Asset => {
                    if destination.parent() == Some(options.output_root.as_path()) {
                        catalog
                            .shared_paths
                            .insert(entry.path.clone(), destination.clone());
                    }
                    catalog.assets.insert(destination, entry.bytes);
                }
                EntryKind::Document => {
                    let toc_position = match &toc {
                        Some(toc) => match toc.get(&entry.path.to_lowercase()) {
                            Some(&position) => Some(position),
                            None => {
                                debug!(path = %entry.path, "document not listed in table of contents");
                                continue;
                            }
                        },
                        None => None,
                    };
                    match catalog.parse_entry(&entry, &destination, toc_position, options) {
                        Ok(record) => catalog.add_document(record)?,
                        Err(error) if options.on_parse_error == ParseFailurePolicy::Skip => {
                            warn!(path = %entry.path, %error, "skipping unparseable document");
                            catalog.skipped.push(entry.path);
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
        }

        if let CatalogLayout::ChmToc { order, .. } = &options.layout {
            catalog.link_toc_parents(order);
        }
        Ok(catalog)
    }

    fn parse_entry(
        &self,
        entry: &ArchiveEntry,
        destination: &Path,
        toc_position: Option<usize>,
        options: &CatalogOptions,
    ) -> Result<DocumentRecord> {
        let parsed = parse_document(&entry.path, destination, &entry.bytes, options.encoding)?;
        let mut metadata = parsed.metadata;

        let (internal_id, parent_id) = match &options.layout {
            CatalogLayout::Mshc { id_key, parent_key } => {
                let id = first_value(&metadata, id_key)
                    .ok_or_else(|| Error::parse(&entry.path, format!("missing <meta name=\"{id_key}\">")))?
                    .to_string();
                let parent = first_value(&metadata, parent_key).map(ToString::to_string);
                (id, parent)
            }
            CatalogLayout::ChmToc { id_prefix, .. } => {
                if !metadata.contains_key(TITLE_KEY)
                    && let Some(title) = document_title(&parsed.content)
                {
                    metadata.insert(TITLE_KEY.to_string(), vec![title]);
                }
                (chm_topic_id(id_prefix, &entry.path), None)
            }
        };

        Ok(DocumentRecord {
            internal_id,
            parent_id,
            source_path: entry.path.clone(),
            destination_path: destination.to_path_buf(),
            toc_position,
            metadata,
            content: parsed.content,
        })
    }

    fn add_document(&mut self, record: DocumentRecord) -> Result<()> {
        if let Some(existing) = self.documents.get(&record.internal_id) {
            return Err(Error::DuplicateDocument {
                id: record.internal_id.clone(),
                first: existing.source_path.clone(),
                second: record.source_path,
            });
        }
        self.documents.insert(record.internal_id.clone(), record);
        Ok(())
    }

    fn link_toc_parents(&mut self, order: &[String]) {
        let by_path = self
            .documents
            .values()
            .map(|record| (record.source_path.to_lowercase(), record.internal_id.clone()))
            .collect::<BTreeMap<_, _>>();

        let mut listed = order
            .iter()
            .filter_map(|path| match by_path.get(&path.to_lowercase()) {
                Some(id) => Some(id.clone()),
                None => {
                    warn!(path = %path, "table of contents entry has no matching document");
                    None
                }
            })
            .collect::<Vec<_>>();
        listed.dedup();

        let Some((root_id, rest)) = listed.split_first() else {
            return;
        };
        for id in rest {
            if id == root_id {
                continue;
            }
            if let Some(record) = self.documents.get_mut(id) {
                record.parent_id = Some(root_id.clone());
            }
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn document(&self, internal_id: &str) -> Option<&DocumentRecord> {
        self.documents.get(internal_id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentRecord> {
        self.documents.values()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn assets(&self) -> &AssetStore {
        &self.assets
    }

    pub fn shared_destination(&self, reference: &str) -> Option<&Path> {
        self.shared_paths.get(reference).map(PathBuf::as_path)
    }

    pub fn shared_paths(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.shared_paths
            .iter()
            .map(|(source, destination)| (source.as_str(), destination.as_path()))
    }

    /// Source paths of documents dropped under [`ParseFailurePolicy::Skip`].
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Locate the asset an `<img src>` in `document` refers to. `reference`
    /// must already be percent-decoded.
    pub fn find_asset(&self, reference: &str, document: &DocumentRecord) -> Option<(&Path, &[u8])> {
        let candidates = vec![
            destination_path(&self.output_root, reference),
            normalize_lexically(&document.destination_dir().join(reference)),
        ];
        self.assets.find(&candidates)
    }
}

/// Internal id for a CHM topic: `<prefix>_<file stem>`.
pub fn chm_topic_id(prefix: &str, source_path: &str) -> String {
    let name = basename(source_path);
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    format!("{prefix}_{stem}")
}

fn toc_positions(order: &[String]) -> BTreeMap<String, usize> {
    order
        .iter()
        .enumerate()
        .rev()
        .map(|(index, path)| (path.to_lowercase(), index))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::{Path, PathBuf};

    use super::{
        Catalog, CatalogLayout, CatalogOptions, ParseFailurePolicy, TITLE_KEY, chm_topic_id,
    };
    use crate::archive::ArchiveEntry;
    use crate::error::Error;
    use crate::hierarchy::Forest;
    use crate::metadata::{encoding_for_label, first_value};

    pub(crate) fn topic(path: &str, id: &str, parent: Option<&str>, body: &str) -> ArchiveEntry {
        let parent_meta = parent
            .map(|parent| format!("<meta name=\"Microsoft.Help.TOCParent\" content=\"{parent}\"/>"))
            .unwrap_or_default();
        ArchiveEntry {
            path: path.to_string(),
            bytes: format!(
                "<html><head><meta name=\"Microsoft.Help.Id\" content=\"{id}\"/>{parent_meta}<meta name=\"Title\" content=\"Topic {id}\"/></head><body>{body}</body></html>"
            )
            .into_bytes(),
        }
    }

    pub(crate) fn asset(path: &str) -> ArchiveEntry {
        ArchiveEntry {
            path: path.to_string(),
            bytes: path.as_bytes().to_vec(),
        }
    }

    pub(crate) fn mshc_options(output_root: &str) -> CatalogOptions {
        CatalogOptions {
            output_root: PathBuf::from(output_root),
            encoding: encoding_for_label("utf-8").expect("utf-8"),
            layout: CatalogLayout::mshc(),
            on_parse_error: ParseFailurePolicy::Abort,
        }
    }

    #[test]
    fn mshc_documents_are_keyed_by_metadata_id() {
        let catalog = Catalog::build(
            vec![
                topic("docs/a/index.html", "100", None, ""),
                topic("docs/b/page.html", "12345", Some("100"), ""),
                asset("images/foo.png"),
                asset("shared.css"),
            ],
            &mshc_options("out"),
        )
        .expect("catalog");

        assert_eq!(catalog.document_count(), 2);
        let child = catalog.document("12345").expect("child");
        assert_eq!(child.parent_id.as_deref(), Some("100"));
        assert_eq!(child.destination_path, Path::new("out/docs/b/page.html"));
        assert_eq!(catalog.assets().len(), 2);
        assert_eq!(
            catalog.shared_destination("shared.css"),
            Some(Path::new("out/shared.css"))
        );
        assert!(catalog.shared_destination("images/foo.png").is_none());
    }

    #[test]
    fn destination_strips_leading_slash() {
        let catalog = Catalog::build(
            vec![topic("/docs/x.htm", "1", None, "")],
            &mshc_options("out"),
        )
        .expect("catalog");
        assert_eq!(
            catalog.document("1").expect("doc").destination_path,
            Path::new("out/docs/x.htm")
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let error = Catalog::build(
            vec![topic("a.htm", "7", None, ""), topic("b.htm", "7", None, "")],
            &mshc_options("out"),
        )
        .expect_err("must fail");
        assert!(matches!(error, Error::DuplicateDocument { .. }));
    }

    #[test]
    fn parse_failures_abort_by_default_and_skip_when_configured() {
        let broken = ArchiveEntry {
            path: "broken.htm".to_string(),
            bytes: b"<html><body></html>".to_vec(),
        };
        let entries = vec![topic("ok.htm", "1", None, ""), broken];

        let error = Catalog::build(entries.clone(), &mshc_options("out")).expect_err("abort");
        assert!(matches!(error, Error::MetadataParse { .. }));

        let mut options = mshc_options("out");
        options.on_parse_error = ParseFailurePolicy::Skip;
        let catalog = Catalog::build(entries, &options).expect("skip");
        assert_eq!(catalog.document_count(), 1);
        assert_eq!(catalog.skipped().to_vec(), vec!["broken.htm".to_string()]);
    }

    #[test]
    fn missing_identity_key_is_a_parse_error() {
        let entry = ArchiveEntry {
            path: "anon.htm".to_string(),
            bytes: b"<html><head/></html>".to_vec(),
        };
        let error = Catalog::build(vec![entry], &mshc_options("out")).expect_err("must fail");
        assert!(error.to_string().contains("Microsoft.Help.Id"));
    }

    #[test]
    fn asset_lookup_tries_root_then_document_dir_then_basename() {
        let catalog = Catalog::build(
            vec![
                topic("docs/a/index.html", "1", None, ""),
                asset("Images/Foo.png"),
                asset("docs/a/local.gif"),
                asset("deep/nested/unique.jpg"),
                asset("x/dup.png"),
                asset("y/dup.png"),
            ],
            &mshc_options("out"),
        )
        .expect("catalog");
        let document = catalog.document("1").expect("doc");

        let (path, _) = catalog.find_asset("/images/foo.png", document).expect("root");
        assert_eq!(path, Path::new("out/Images/Foo.png"));
        let (path, _) = catalog.find_asset("local.gif", document).expect("relative");
        assert_eq!(path, Path::new("out/docs/a/local.gif"));
        let (path, _) = catalog.find_asset("../../unique.jpg", document).expect("basename");
        assert_eq!(path, Path::new("out/deep/nested/unique.jpg"));
        assert!(catalog.find_asset("dup.png", document).is_none());
    }

    #[test]
    fn chm_layout_uses_toc_order_and_first_topic_as_root() {
        let chm_topic = |path: &str, title: &str| ArchiveEntry {
            path: path.to_string(),
            bytes: format!("<html><head><title>{title}</title></head><body/></html>").into_bytes(),
        };
        let options = CatalogOptions {
            layout: CatalogLayout::ChmToc {
                order: vec![
                    "overview.htm".to_string(),
                    "setup.htm".to_string(),
                    "usage.htm".to_string(),
                ],
                id_prefix: "tc3".to_string(),
            },
            ..mshc_options("out")
        };
        let catalog = Catalog::build(
            vec![
                chm_topic("overview.htm", "Overview"),
                chm_topic("setup.htm", "Setup"),
                chm_topic("usage.htm", "Usage"),
                chm_topic("unlisted.htm", "Hidden"),
            ],
            &options,
        )
        .expect("catalog");

        assert_eq!(catalog.document_count(), 3);
        assert!(catalog.document("tc3_overview").expect("root").parent_id.is_none());
        let setup = catalog.document("tc3_setup").expect("setup");
        assert_eq!(setup.parent_id.as_deref(), Some("tc3_overview"));
        assert_eq!(first_value(&setup.metadata, TITLE_KEY), Some("Setup"));
    }

    #[test]
    fn chm_siblings_follow_toc_order() {
        let chm_topic = |path: &str| ArchiveEntry {
            path: path.to_string(),
            bytes: b"<html><head><title>t</title></head><body/></html>".to_vec(),
        };
        let options = CatalogOptions {
            layout: CatalogLayout::ChmToc {
                order: vec![
                    "intro.htm".to_string(),
                    "setup.htm".to_string(),
                    "advanced.htm".to_string(),
                ],
                id_prefix: "tc".to_string(),
            },
            ..mshc_options("out")
        };
        let catalog = Catalog::build(
            vec![
                chm_topic("advanced.htm"),
                chm_topic("intro.htm"),
                chm_topic("setup.htm"),
            ],
            &options,
        )
        .expect("catalog");
        assert_eq!(catalog.document("tc_setup").expect("setup").toc_position, Some(1));

        let forest = Forest::from_catalog(&catalog).expect("forest");
        let order = forest
            .preorder()
            .map(|id| forest.node(id).internal_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["tc_intro", "tc_setup", "tc_advanced"]);
    }

    #[test]
    fn entries_escaping_the_output_root_are_skipped() {
        let catalog = Catalog::build(
            vec![
                topic("a.htm", "1", None, ""),
                topic("../outside.htm", "2", None, ""),
                asset("../escaped.txt"),
                asset("img/../../escaped.png"),
                asset("img/ok.png"),
            ],
            &mshc_options("out"),
        )
        .expect("catalog");

        assert_eq!(catalog.document_count(), 1);
        assert!(catalog.document("2").is_none());
        let assets = catalog.assets().iter().map(|(path, _)| path).collect::<Vec<_>>();
        assert_eq!(assets, vec![Path::new("out/img/ok.png")]);
    }

    #[test]
    fn chm_topic_id_uses_file_stem() {
        assert_eq!(chm_topic_id("tc3", "html/Intro.htm"), "tc3_Intro");
        assert_eq!(chm_topic_id("tc3", "README"), "tc3_README");
    }
}
