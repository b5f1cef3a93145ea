use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Persisted correlation between help-source identifiers and wiki page ids.
///
/// `by_id` maps internal ids, `by_file` maps archive paths. The reverse view
/// (page id → internal id) is rebuilt on load and never written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentifierMap {
    #[serde(default, deserialize_with = "deserialize_ids")]
    by_file: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_ids")]
    by_id: BTreeMap<String, String>,
    #[serde(skip)]
    by_external: HashMap<String, String>,
}

impl IdentifierMap {
    /// Load a map; a missing file yields an empty map.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|error| Error::io(path, error))?;
        let mut map: Self = serde_json::from_str(&content).map_err(|error| Error::IdMap {
            path: path.to_path_buf(),
            message: format!("failed to parse: {error}"),
        })?;
        map.rebuild_reverse();
        Ok(map)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|error| Error::io(parent, error))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|error| Error::IdMap {
            path: path.to_path_buf(),
            message: format!("failed to serialize: {error}"),
        })?;
        fs::write(path, content).map_err(|error| Error::io(path, error))
    }

    pub fn external_id(&self, internal_id: &str) -> Option<&str> {
        self.by_id.get(internal_id).map(String::as_str)
    }

    pub fn external_id_for_file(&self, source_path: &str) -> Option<&str> {
        self.by_file.get(source_path).map(String::as_str)
    }

    pub fn internal_id(&self, external_id: &str) -> Option<&str> {
        self.by_external.get(external_id).map(String::as_str)
    }

    pub fn contains(&self, internal_id: &str) -> bool {
        self.by_id.contains_key(internal_id)
    }

    /// Record a newly created page under both keys.
    pub fn record(&mut self, internal_id: &str, source_path: &str, external_id: &str) {
        if let Some(previous) = self
            .by_id
            .insert(internal_id.to_string(), external_id.to_string())
        {
            self.by_external.remove(&previous);
        }
        self.by_file
            .insert(source_path.to_string(), external_id.to_string());
        self.by_external
            .insert(external_id.to_string(), internal_id.to_string());
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn rebuild_reverse(&mut self) {
        self.by_external = self
            .by_id
            .iter()
            .map(|(internal, external)| (external.clone(), internal.clone()))
            .collect();
    }
}

/// Page ids were written as JSON numbers by older tooling; accept both.
fn deserialize_ids<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| match value {
            Value::String(id) => Ok((key, id)),
            Value::Number(id) => Ok((key, id.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "page id for {key} must be a string or number, got {other}"
            ))),
        })
        .collect()
}
