use std::path::PathBuf;

use thiserror::Error;

use crate::confluence::ApiError;

/// Fatal failures of a conversion or publishing run.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read archive {}: {source}", path.display())]
    ArchiveRead {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("failed to parse {path}: {message}")]
    MetadataParse { path: String, message: String },

    #[error("duplicate document id {id} in {first} and {second}")]
    DuplicateDocument {
        id: String,
        first: String,
        second: String,
    },

    #[error("unresolved reference {reference}: no document with id {id}")]
    UnresolvedReference { reference: String, id: String },

    #[error("page {page_id} is in space {actual}, expected {expected}")]
    WrongDestination {
        page_id: String,
        expected: String,
        actual: String,
    },

    #[error("parent cycle detected among documents: {}", ids.join(", "))]
    CycleDetected { ids: Vec<String> },

    #[error("identifier map {}: {message}", path.display())]
    IdMap { path: PathBuf, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<String>, message: impl ToString) -> Self {
        Self::MetadataParse {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
