use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use encoding_rs::Encoding;
use tracing::warn;
use walkdir::WalkDir;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::{Error, Result};

pub const DOCUMENT_EXTENSIONS: &[&str] = &["htm", "html"];
pub const CHM_TOC_FILENAME: &str = "index.hhc";

/// One file from a help container, keyed by its archive-internal path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Document,
    Asset,
}

impl EntryKind {
    pub fn classify(path: &str) -> Self {
        let extension = Path::new(path)
            .extension()
            .and_then(|value| value.to_str())
            .unwrap_or("");
        if DOCUMENT_EXTENSIONS
            .iter()
            .any(|candidate| extension.eq_ignore_ascii_case(candidate))
        {
            Self::Document
        } else {
            Self::Asset
        }
    }
}

impl ArchiveEntry {
    pub fn kind(&self) -> EntryKind {
        EntryKind::classify(&self.path)
    }
}

/// Read every file entry of a ZIP-based help container (`.mshc`).
/// Entries whose names would land outside the extraction root are skipped.
pub fn read_zip_archive(path: &Path) -> Result<Vec<ArchiveEntry>> {
    let archive_error = |source: ZipError| Error::ArchiveRead {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|error| archive_error(ZipError::Io(error)))?;
    let mut archive = ZipArchive::new(file).map_err(archive_error)?;

    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(archive_error)?;
        if file.is_dir() {
            continue;
        }
        if file.enclosed_name().is_none() {
            warn!(archive = %path.display(), entry = %file.name(), "skipping unsafe entry name");
            continue;
        }
        let mut bytes = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
        file.read_to_end(&mut bytes)
            .map_err(|error| archive_error(ZipError::Io(error)))?;
        entries.push(ArchiveEntry {
            path: file.name().to_string(),
            bytes,
        });
    }
    Ok(entries)
}

/// Read a help project that was already extracted to a directory, e.g. a
/// decompiled `.chm`. Paths are relative to `root` with `/` separators.
pub fn read_extracted_dir(root: &Path) -> Result<Vec<ArchiveEntry>> {
    let archive_error = |source: std::io::Error| Error::ArchiveRead {
        path: root.to_path_buf(),
        source: ZipError::Io(source),
    };

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|error| archive_error(error.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let bytes = fs::read(entry.path()).map_err(archive_error)?;
        entries.push(ArchiveEntry {
            path: relative,
            bytes,
        });
    }
    Ok(entries)
}

/// Ordered topic filenames listed in a CHM table of contents (`index.hhc`).
pub fn read_toc_order(root: &Path, encoding: &'static Encoding) -> Result<Vec<String>> {
    let toc_path = root.join(CHM_TOC_FILENAME);
    let bytes = fs::read(&toc_path).map_err(|error| Error::io(&toc_path, error))?;
    let (text, _, _) = encoding.decode(&bytes);
    Ok(parse_toc_locals(&text))
}

pub fn parse_toc_locals(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| line.contains("Local"))
        .filter_map(|line| {
            let (_, rest) = line.split_once("value=\"")?;
            let value = match rest.find('"') {
                Some(end) => &rest[..end],
                None => rest.trim_end_matches(['>', '"']),
            };
            (!value.is_empty()).then(|| value.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use tempfile::tempdir;
    use zip::ZipWriter;
    use zip::write::FileOptions;

    use super::{EntryKind, parse_toc_locals, read_extracted_dir, read_zip_archive};
    use crate::error::Error;

    #[test]
    fn classifies_documents_by_extension() {
        assert_eq!(EntryKind::classify("a/b/topic.htm"), EntryKind::Document);
        assert_eq!(EntryKind::classify("TOPIC.HTML"), EntryKind::Document);
        assert_eq!(EntryKind::classify("images/logo.png"), EntryKind::Asset);
        assert_eq!(EntryKind::classify("styles.css"), EntryKind::Asset);
        assert_eq!(EntryKind::classify("noextension"), EntryKind::Asset);
    }

    #[test]
    fn reads_every_zip_file_entry() {
        let temp = tempdir().expect("tempdir");
        let archive_path = temp.path().join("help.mshc");
        let file = fs::File::create(&archive_path).expect("create archive");
        let mut writer = ZipWriter::new(file);
        writer.add_directory("images/", FileOptions::default()).expect("dir");
        writer
            .start_file("topic.htm", FileOptions::default())
            .expect("start topic");
        writer.write_all(b"<html/>").expect("write topic");
        writer
            .start_file("images/logo.png", FileOptions::default())
            .expect("start image");
        writer.write_all(&[0x89, 0x50]).expect("write image");
        writer.finish().expect("finish");

        let entries = read_zip_archive(&archive_path).expect("read archive");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "topic.htm");
        assert_eq!(entries[0].bytes, b"<html/>");
        assert_eq!(entries[1].path, "images/logo.png");
        assert_eq!(entries[1].kind(), EntryKind::Asset);
    }

    #[test]
    fn entries_naming_parent_directories_are_skipped() {
        let temp = tempdir().expect("tempdir");
        let archive_path = temp.path().join("slip.mshc");
        let file = fs::File::create(&archive_path).expect("create archive");
        let mut writer = ZipWriter::new(file);
        writer
            .start_file("../escaped.txt", FileOptions::default())
            .expect("start escaped");
        writer.write_all(b"x").expect("write escaped");
        writer
            .start_file("topic.htm", FileOptions::default())
            .expect("start topic");
        writer.write_all(b"<html/>").expect("write topic");
        writer.finish().expect("finish");

        let entries = read_zip_archive(&archive_path).expect("read archive");
        let paths = entries.iter().map(|e| e.path.as_str()).collect::<Vec<_>>();
        assert_eq!(paths, vec!["topic.htm"]);
    }

    #[test]
    fn corrupt_zip_is_an_archive_read_error() {
        let temp = tempdir().expect("tempdir");
        let archive_path = temp.path().join("broken.mshc");
        fs::write(&archive_path, b"not a zip file").expect("write");

        let error = read_zip_archive(&archive_path).expect_err("must fail");
        assert!(matches!(error, Error::ArchiveRead { .. }));
    }

    #[test]
    fn missing_zip_is_an_archive_read_error() {
        let error = read_zip_archive(std::path::Path::new("/nonexistent/help.mshc"))
            .expect_err("must fail");
        assert!(matches!(error, Error::ArchiveRead { .. }));
    }

    #[test]
    fn reads_extracted_directory_with_relative_paths() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("img")).expect("create img");
        fs::write(temp.path().join("a.htm"), "<html/>").expect("write a");
        fs::write(temp.path().join("img").join("b.gif"), [1u8, 2]).expect("write b");

        let entries = read_extracted_dir(temp.path()).expect("read dir");
        let paths = entries.iter().map(|e| e.path.as_str()).collect::<Vec<_>>();
        assert_eq!(paths, vec!["a.htm", "img/b.gif"]);
    }

    #[test]
    fn toc_locals_keep_declaration_order() {
        let toc = r#"<UL>
	<LI> <OBJECT type="text/sitemap">
		<param name="Name" value="Overview">
		<param name="Local" value="overview.htm">
		</OBJECT>
	<LI> <OBJECT type="text/sitemap">
		<param name="Local" value="setup.htm">
		</OBJECT>
</UL>"#;
        assert_eq!(parse_toc_locals(toc), vec!["overview.htm", "setup.htm"]);
    }
}
