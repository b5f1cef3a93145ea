use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};

use crate::catalog::{
    CatalogLayout, CatalogOptions, DEFAULT_ID_KEY, DEFAULT_PARENT_KEY, ParseFailurePolicy,
};
use crate::metadata::encoding_for_label;

pub const DEFAULT_USER_AGENT: &str = "helpwiki/0.1";
pub const DEFAULT_PROPERTY_KEY: &str = "helpwiki";
pub const DEFAULT_ENCODING: &str = "windows-1252";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HelpwikiConfig {
    #[serde(default)]
    pub confluence: ConfluenceSection,
    #[serde(default)]
    pub archive: ArchiveSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfluenceSection {
    pub url: Option<String>,
    pub space_key: Option<String>,
    pub parent_page_id: Option<String>,
    pub shared_attachment_page_id: Option<String>,
    pub property_key: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ArchiveSection {
    pub encoding: Option<String>,
    pub id_key: Option<String>,
    pub parent_key: Option<String>,
    #[serde(default)]
    pub on_parse_error: ParseFailurePolicy,
    pub checkpoint: Option<bool>,
}

impl HelpwikiConfig {
    /// Resolve the Confluence base URL: env CONFLUENCE_URL > config > None.
    pub fn confluence_url(&self) -> Option<String> {
        env_override("CONFLUENCE_URL").or_else(|| self.confluence.url.clone())
    }

    /// Resolve the target space: env CONFLUENCE_SPACE_KEY > config > None.
    pub fn space_key(&self) -> Option<String> {
        env_override("CONFLUENCE_SPACE_KEY").or_else(|| self.confluence.space_key.clone())
    }

    /// Resolve user agent: env CONFLUENCE_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("CONFLUENCE_USER_AGENT")
            .or_else(|| self.confluence.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        self.confluence.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn property_key(&self) -> &str {
        self.confluence
            .property_key
            .as_deref()
            .unwrap_or(DEFAULT_PROPERTY_KEY)
    }

    pub fn checkpoint(&self) -> bool {
        self.archive.checkpoint.unwrap_or(true)
    }

    pub fn encoding(&self) -> Result<&'static Encoding> {
        let label = self
            .archive
            .encoding
            .as_deref()
            .unwrap_or(DEFAULT_ENCODING);
        match encoding_for_label(label) {
            Some(encoding) => Ok(encoding),
            None => bail!("unknown [archive].encoding label: {label}"),
        }
    }

    /// Catalog options for a metadata-driven (MSHC) archive.
    pub fn mshc_options(&self, output_root: PathBuf) -> Result<CatalogOptions> {
        Ok(CatalogOptions {
            output_root,
            encoding: self.encoding()?,
            layout: CatalogLayout::Mshc {
                id_key: self
                    .archive
                    .id_key
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ID_KEY.to_string()),
                parent_key: self
                    .archive
                    .parent_key
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PARENT_KEY.to_string()),
            },
            on_parse_error: self.archive.on_parse_error,
        })
    }

    /// Catalog options for an extracted CHM directory with a TOC order.
    pub fn chm_options(
        &self,
        output_root: PathBuf,
        order: Vec<String>,
        id_prefix: &str,
    ) -> Result<CatalogOptions> {
        Ok(CatalogOptions {
            output_root,
            encoding: self.encoding()?,
            layout: CatalogLayout::ChmToc {
                order,
                id_prefix: id_prefix.to_string(),
            },
            on_parse_error: self.archive.on_parse_error,
        })
    }
}

/// Load and parse a HelpwikiConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<HelpwikiConfig> {
    if !config_path.exists() {
        return Ok(HelpwikiConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: HelpwikiConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert!(config.confluence.url.is_none());
        assert!(config.checkpoint());
        assert_eq!(config.property_key(), "helpwiki");
        assert_eq!(config.archive.on_parse_error, ParseFailurePolicy::Abort);
    }

    #[test]
    fn load_config_parses_both_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[confluence]
url = "https://confluence.example.org"
space_key = "DOCS"
parent_page_id = "123"
shared_attachment_page_id = "456"
property_key = "tc3"
timeout_ms = 5000

[archive]
encoding = "utf-8"
id_key = "Help.Id"
on_parse_error = "skip"
checkpoint = false
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.confluence.url.as_deref(),
            Some("https://confluence.example.org")
        );
        assert_eq!(config.confluence.parent_page_id.as_deref(), Some("123"));
        assert_eq!(
            config.confluence.shared_attachment_page_id.as_deref(),
            Some("456")
        );
        assert_eq!(config.property_key(), "tc3");
        assert_eq!(config.timeout_ms(), 5000);
        assert_eq!(config.archive.on_parse_error, ParseFailurePolicy::Skip);
        assert!(!config.checkpoint());
        assert_eq!(config.encoding().expect("encoding"), encoding_rs::UTF_8);

        let options = config.mshc_options(PathBuf::from("out")).expect("options");
        match options.layout {
            CatalogLayout::Mshc { id_key, parent_key } => {
                assert_eq!(id_key, "Help.Id");
                assert_eq!(parent_key, DEFAULT_PARENT_KEY);
            }
            other => panic!("unexpected layout: {other:?}"),
        }
    }

    #[test]
    fn default_encoding_is_windows_1252() {
        let config = HelpwikiConfig::default();
        assert_eq!(config.encoding().expect("encoding"), encoding_rs::WINDOWS_1252);
    }

    #[test]
    fn unknown_encoding_label_is_rejected() {
        let mut config = HelpwikiConfig::default();
        config.archive.encoding = Some("klingon".to_string());
        let error = config.encoding().expect_err("must fail");
        assert!(error.to_string().contains("klingon"));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[confluence\nurl = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn invalid_parse_policy_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[archive]\non_parse_error = \"ignore\"\n").expect("write config");
        assert!(load_config(&config_path).is_err());
    }

    #[test]
    fn default_user_agent() {
        let config = HelpwikiConfig::default();
        assert_eq!(config.user_agent(), "helpwiki/0.1");
    }
}
