//! Rewriting of `src`/`href` references found in help topics.

use std::path::Path;

use crate::catalog::{Catalog, destination_path};
use crate::error::{Error, Result};
use crate::idmap::IdentifierMap;
use crate::paths::{basename, display_path, relative_path};

pub const ID_QUERY_MARKER: &str = "?Id=";
const PASS_THROUGH_PREFIXES: &[&str] = &["http", "mailto", "#"];

pub fn page_view_url(external_id: &str) -> String {
    format!("/pages/viewpage.action?pageId={external_id}")
}

pub fn attachment_url(external_id: &str, file_name: &str) -> String {
    format!("/download/attachments/{external_id}/{file_name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind<'r> {
    Empty,
    /// External URL, mail link or in-page anchor.
    PassThrough,
    InternalById {
        id: &'r str,
        fragment: Option<&'r str>,
    },
    SharedAsset,
    Relative,
}

pub fn classify<'r>(reference: &'r str, catalog: &Catalog) -> ReferenceKind<'r> {
    if reference.is_empty() {
        return ReferenceKind::Empty;
    }
    if PASS_THROUGH_PREFIXES
        .iter()
        .any(|prefix| reference.starts_with(prefix))
    {
        return ReferenceKind::PassThrough;
    }
    if let Some((_, query)) = reference.split_once(ID_QUERY_MARKER) {
        let (id, fragment) = match query.split_once('#') {
            Some((id, fragment)) => (id, Some(fragment)),
            None => (query, None),
        };
        return ReferenceKind::InternalById { id, fragment };
    }
    if catalog.shared_destination(reference).is_some() {
        return ReferenceKind::SharedAsset;
    }
    ReferenceKind::Relative
}

#[derive(Debug, Clone, Copy)]
pub enum ResolveMode<'a> {
    /// Rewrite to filesystem paths under the catalog's output root.
    Standalone,
    /// Rewrite to wiki URLs using the persisted identifier map.
    Publishing {
        id_map: &'a IdentifierMap,
        shared_attachment_page_id: Option<&'a str>,
    },
}

/// Maps a reference to its rewritten form. Resolution never mutates
/// anything, so the same reference always yields the same result.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceResolver<'a> {
    catalog: &'a Catalog,
    mode: ResolveMode<'a>,
}

impl<'a> ReferenceResolver<'a> {
    pub fn standalone(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            mode: ResolveMode::Standalone,
        }
    }

    pub fn publishing(
        catalog: &'a Catalog,
        id_map: &'a IdentifierMap,
        shared_attachment_page_id: Option<&'a str>,
    ) -> Self {
        Self {
            catalog,
            mode: ResolveMode::Publishing {
                id_map,
                shared_attachment_page_id,
            },
        }
    }

    /// `relative_to` is the directory of the referring document; it only
    /// affects standalone results.
    pub fn resolve(&self, reference: &str, relative_to: Option<&Path>) -> Result<String> {
        match classify(reference, self.catalog) {
            ReferenceKind::Empty => Ok(String::new()),
            ReferenceKind::PassThrough => Ok(reference.to_string()),
            ReferenceKind::InternalById { id, fragment } => {
                let target = self.resolve_internal(reference, id, relative_to)?;
                Ok(match fragment {
                    Some(fragment) => format!("{target}#{fragment}"),
                    None => target,
                })
            }
            ReferenceKind::SharedAsset => Ok(self.resolve_shared(reference, relative_to)),
            ReferenceKind::Relative => Ok(self.resolve_relative(reference, relative_to)),
        }
    }

    fn resolve_internal(
        &self,
        reference: &str,
        id: &str,
        relative_to: Option<&Path>,
    ) -> Result<String> {
        let unresolved = || Error::UnresolvedReference {
            reference: reference.to_string(),
            id: id.to_string(),
        };
        match self.mode {
            ResolveMode::Standalone => {
                let record = self.catalog.document(id).ok_or_else(unresolved)?;
                Ok(express(&record.destination_path, relative_to))
            }
            ResolveMode::Publishing { id_map, .. } => {
                let external_id = id_map.external_id(id).ok_or_else(unresolved)?;
                Ok(page_view_url(external_id))
            }
        }
    }

    fn resolve_shared(&self, reference: &str, relative_to: Option<&Path>) -> String {
        match self.mode {
            ResolveMode::Standalone => match self.catalog.shared_destination(reference) {
                Some(destination) => express(destination, relative_to),
                None => reference.to_string(),
            },
            ResolveMode::Publishing {
                shared_attachment_page_id: Some(page_id),
                ..
            } => attachment_url(page_id, basename(reference)),
            ResolveMode::Publishing { .. } => reference.to_string(),
        }
    }

    fn resolve_relative(&self, reference: &str, relative_to: Option<&Path>) -> String {
        match self.mode {
            ResolveMode::Standalone => {
                let destination = destination_path(self.catalog.output_root(), reference);
                express(&destination, relative_to)
            }
            ResolveMode::Publishing { id_map, .. } => match id_map.external_id_for_file(reference)
            {
                Some(external_id) => page_view_url(external_id),
                None => reference.to_string(),
            },
        }
    }
}

fn express(destination: &Path, relative_to: Option<&Path>) -> String {
    match relative_to {
        Some(base) => relative_path(destination, base),
        None => display_path(destination),
    }
}
