//! Publishing a catalog as a Confluence page tree.
//!
//! Publishing runs in two passes. `create_outline` creates one empty page per
//! forest node, parents first, and records every new page id in the
//! identifier map. `build_all` then fills each page with its rewritten topic
//! body, which needs the complete map so cross-topic links can resolve.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, DESCRIPTION_KEY, DocumentRecord, TITLE_KEY};
use crate::confluence::{ConfluenceApi, NewPage, PageUpdate};
use crate::error::{Error, Result};
use crate::hierarchy::{Forest, NodeId};
use crate::idmap::IdentifierMap;
use crate::metadata::{Metadata, first_value};
use crate::paths::basename;
use crate::resolve::{ReferenceResolver, attachment_url};

const SHORT_DESCRIPTION_LIMIT: usize = 30;
const PROGRESS_INTERVAL: usize = 100;

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub space_key: String,
    /// Parent page for forest roots; roots land at the space top level when unset.
    pub root_parent_id: Option<String>,
    pub shared_attachment_page_id: Option<String>,
    pub property_key: String,
    pub dry_run: bool,
    /// Where the identifier map is saved after every page creation.
    pub checkpoint_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutlineEntry {
    pub internal_id: String,
    pub external_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutlineReport {
    pub dry_run: bool,
    pub created: Vec<OutlineEntry>,
    pub existing: usize,
    pub would_create: Vec<String>,
    pub properties_written: usize,
    pub properties_existing: usize,
    pub request_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildPageResult {
    pub internal_id: String,
    pub external_id: String,
    pub title: String,
    /// Version the page was written at; the fetched version in dry-run mode.
    pub version: u64,
    pub attachments_uploaded: Vec<String>,
    pub attachment_conflicts: Vec<String>,
    pub missing_assets: Vec<String>,
    /// Image references whose attachment name was already taken by a
    /// different image on the same page.
    pub name_collisions: Vec<String>,
    pub body_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub dry_run: bool,
    pub built: usize,
    pub pages: Vec<BuildPageResult>,
    pub missing_outline: Vec<String>,
    pub request_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SharedUploadReport {
    pub dry_run: bool,
    pub page_id: Option<String>,
    pub uploaded: Vec<String>,
    pub conflicts: Vec<String>,
    pub missing: Vec<String>,
    pub request_count: usize,
}

pub struct Publisher<'a, A: ConfluenceApi> {
    catalog: &'a Catalog,
    forest: &'a Forest,
    id_map: &'a mut IdentifierMap,
    api: &'a mut A,
    options: PublishOptions,
}

impl<'a, A: ConfluenceApi> Publisher<'a, A> {
    pub fn new(
        catalog: &'a Catalog,
        forest: &'a Forest,
        id_map: &'a mut IdentifierMap,
        api: &'a mut A,
        options: PublishOptions,
    ) -> Self {
        Self {
            catalog,
            forest,
            id_map,
            api,
            options,
        }
    }

    /// Create a page for every node that has none yet, parents before children.
    pub fn create_outline(&mut self) -> Result<OutlineReport> {
        let mut report = OutlineReport {
            dry_run: self.options.dry_run,
            ..OutlineReport::default()
        };

        let forest: &'a Forest = self.forest;
        for node_id in forest.preorder() {
            let node = forest.node(node_id);
            let record = self.record(&node.internal_id)?;

            let external_id = match self.id_map.external_id(&node.internal_id) {
                Some(external_id) => {
                    report.existing += 1;
                    external_id.to_string()
                }
                None if self.options.dry_run => {
                    report.would_create.push(node.internal_id.clone());
                    continue;
                }
                None => {
                    let entry = self.create_page(node_id, record)?;
                    let external_id = entry.external_id.clone();
                    report.created.push(entry);
                    external_id
                }
            };

            if self.options.dry_run {
                continue;
            }
            let properties = collapse_metadata(&record.metadata);
            match self
                .api
                .create_property(&external_id, &self.options.property_key, &properties)
            {
                Ok(()) => report.properties_written += 1,
                Err(error) if error.is_recoverable() => {
                    debug!(page_id = %external_id, %error, "content property already present");
                    report.properties_existing += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }

        report.request_count = self.api.request_count();
        info!(
            created = report.created.len(),
            existing = report.existing,
            would_create = report.would_create.len(),
            "outline complete"
        );
        Ok(report)
    }

    fn create_page(&mut self, node_id: NodeId, record: &DocumentRecord) -> Result<OutlineEntry> {
        let forest: &'a Forest = self.forest;
        let node = forest.node(node_id);
        let parent_id = match node.parent {
            Some(parent) => self
                .id_map
                .external_id(&forest.node(parent).internal_id)
                .map(ToString::to_string),
            None => self.options.root_parent_id.clone(),
        };
        let title = derive_title(&node.internal_id, &record.metadata);

        let page = self.api.create_page(&NewPage {
            title: title.clone(),
            space_key: self.options.space_key.clone(),
            parent_id,
            body: String::new(),
        })?;
        self.id_map
            .record(&node.internal_id, &record.source_path, &page.id);
        if let Some(path) = &self.options.checkpoint_path {
            self.id_map.save(path)?;
        }
        info!(id = %node.internal_id, page_id = %page.id, %title, "created page");

        Ok(OutlineEntry {
            internal_id: node.internal_id.clone(),
            external_id: page.id,
            title,
        })
    }

    /// Fill one outlined page with its rewritten topic body.
    pub fn build_page(&mut self, node_id: NodeId) -> Result<BuildPageResult> {
        let forest: &'a Forest = self.forest;
        let internal_id = forest.node(node_id).internal_id.as_str();
        let record = self.record(internal_id)?;
        let external_id = self
            .id_map
            .external_id(internal_id)
            .ok_or_else(|| Error::UnresolvedReference {
                reference: record.source_path.clone(),
                id: internal_id.to_string(),
            })?
            .to_string();

        let page = self.api.get_page(&external_id)?;
        if page.space_key != self.options.space_key {
            return Err(Error::WrongDestination {
                page_id: external_id,
                expected: self.options.space_key.clone(),
                actual: page.space_key,
            });
        }

        let mut content = record.content.clone();

        let mut images = Vec::new();
        content.for_each_element_mut(&["img"], |image| {
            let Some(src) = image.attribute("src") else {
                return;
            };
            if src.is_empty() || is_external_image(src) {
                return;
            }
            let decoded = percent_decode_str(src).decode_utf8_lossy().into_owned();
            let file_name = basename(&decoded).to_string();
            image.set_attribute("src", &attachment_url(&external_id, &file_name));
            images.push((file_name, decoded));
        });

        let resolver = ReferenceResolver::publishing(
            self.catalog,
            self.id_map,
            self.options.shared_attachment_page_id.as_deref(),
        );
        let mut failure = None;
        content.for_each_element_mut(&["a", "link"], |link| {
            if failure.is_some() {
                return;
            }
            let Some(href) = link.attribute("href") else {
                return;
            };
            match resolver.resolve(href, None) {
                Ok(rewritten) => link.set_attribute("href", &rewritten),
                Err(error) => failure = Some(error),
            }
        });
        if let Some(error) = failure {
            return Err(error);
        }

        let body = wrap_html(
            &content
                .to_xml()
                .map_err(|error| Error::parse(&record.source_path, error))?,
        );

        let mut result = BuildPageResult {
            internal_id: internal_id.to_string(),
            external_id: external_id.clone(),
            title: page.title.clone(),
            version: page.version,
            body_bytes: body.len(),
            ..BuildPageResult::default()
        };

        let mut seen = BTreeSet::new();
        let mut attached: BTreeMap<String, &Path> = BTreeMap::new();
        for (file_name, reference) in images {
            if !seen.insert(reference.clone()) {
                continue;
            }
            let Some((asset_path, bytes)) = self.catalog.find_asset(&reference, record) else {
                warn!(page = %record.source_path, image = %reference, "image asset not found");
                result.missing_assets.push(reference);
                continue;
            };
            match attached.get(&file_name) {
                Some(&first) if first == asset_path => continue,
                Some(&first) => {
                    warn!(
                        page = %record.source_path,
                        attachment = %file_name,
                        kept = %first.display(),
                        shadowed = %reference,
                        "different images share an attachment name"
                    );
                    result.name_collisions.push(reference);
                    continue;
                }
                None => {
                    attached.insert(file_name.clone(), asset_path);
                }
            }
            if self.options.dry_run {
                result.attachments_uploaded.push(file_name);
                continue;
            }
            match self.api.add_attachment(&external_id, &file_name, bytes) {
                Ok(()) => result.attachments_uploaded.push(file_name),
                Err(error) if error.is_recoverable() => {
                    warn!(page_id = %external_id, attachment = %file_name, %error, "attachment already exists, skipping");
                    result.attachment_conflicts.push(file_name);
                }
                Err(error) => return Err(error.into()),
            }
        }

        if !self.options.dry_run {
            let updated = self.api.update_page(&PageUpdate {
                id: page.id,
                title: page.title,
                version: page.version + 1,
                body,
            })?;
            result.version = updated.version;
        }
        debug!(id = %internal_id, page_id = %external_id, "built page");
        Ok(result)
    }

    /// Build every outlined node in pre-order.
    pub fn build_all(&mut self) -> Result<BuildReport> {
        let mut report = BuildReport {
            dry_run: self.options.dry_run,
            ..BuildReport::default()
        };
        let forest: &'a Forest = self.forest;
        let total = forest.len();

        for (done, node_id) in forest.preorder().enumerate() {
            if done % PROGRESS_INTERVAL == 0 {
                info!(done, total, "building pages");
            }
            let internal_id = &forest.node(node_id).internal_id;
            if !self.id_map.contains(internal_id) {
                warn!(id = %internal_id, "no page in identifier map; run outline first");
                report.missing_outline.push(internal_id.clone());
                continue;
            }
            let page = self.build_page(node_id)?;
            report.pages.push(page);
        }

        report.built = report.pages.len();
        report.request_count = self.api.request_count();
        info!(built = report.built, missing = report.missing_outline.len(), "build complete");
        Ok(report)
    }

    /// Upload root-level assets once to the shared attachment page.
    pub fn upload_shared_assets(&mut self) -> Result<SharedUploadReport> {
        let mut report = SharedUploadReport {
            dry_run: self.options.dry_run,
            page_id: self.options.shared_attachment_page_id.clone(),
            ..SharedUploadReport::default()
        };
        let Some(page_id) = self.options.shared_attachment_page_id.clone() else {
            info!("no shared attachment page configured; skipping shared assets");
            return Ok(report);
        };

        for (source, destination) in self.catalog.shared_paths() {
            let file_name = basename(source).to_string();
            let Some(bytes) = self.catalog.assets().get(destination) else {
                report.missing.push(source.to_string());
                continue;
            };
            if self.options.dry_run {
                report.uploaded.push(file_name);
                continue;
            }
            match self.api.add_attachment(&page_id, &file_name, bytes) {
                Ok(()) => report.uploaded.push(file_name),
                Err(error) if error.is_recoverable() => {
                    warn!(page_id = %page_id, attachment = %file_name, %error, "shared attachment already exists, skipping");
                    report.conflicts.push(file_name);
                }
                Err(error) => return Err(error.into()),
            }
        }

        report.request_count = self.api.request_count();
        Ok(report)
    }

    fn record(&self, internal_id: &str) -> Result<&'a DocumentRecord> {
        let catalog: &'a Catalog = self.catalog;
        catalog
            .document(internal_id)
            .ok_or_else(|| Error::UnresolvedReference {
                reference: internal_id.to_string(),
                id: internal_id.to_string(),
            })
    }
}

/// `Title`, else a short `Description`, else the id; always suffixed with
/// ` (<internal_id>)` so titles stay unique within a space.
pub fn derive_title(internal_id: &str, metadata: &Metadata) -> String {
    let base = first_value(metadata, TITLE_KEY)
        .or_else(|| {
            first_value(metadata, DESCRIPTION_KEY)
                .filter(|description| description.chars().count() < SHORT_DESCRIPTION_LIMIT)
        })
        .unwrap_or(internal_id);
    format!("{base} ({internal_id})")
}

/// Metadata as a content-property value: single values become plain strings.
pub fn collapse_metadata(metadata: &Metadata) -> Value {
    let mut map = Map::new();
    for (key, values) in metadata {
        let value = match values.as_slice() {
            [only] => Value::String(only.clone()),
            many => Value::Array(many.iter().cloned().map(Value::String).collect()),
        };
        map.insert(key.clone(), value);
    }
    Value::Object(map)
}

/// Embed serialized XHTML in the raw-HTML macro.
pub fn wrap_html(html: &str) -> String {
    let escaped = html.replace("]]>", "]]]]><![CDATA[>");
    format!(
        "<ac:structured-macro ac:name=\"html\">\n  <ac:plain-text-body><![CDATA[{escaped}]]></ac:plain-text-body>\n</ac:structured-macro>\n"
    )
}

fn is_external_image(src: &str) -> bool {
    src.starts_with("http") || src.starts_with("data:")
}
