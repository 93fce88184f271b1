use std::path::PathBuf;

use asset_common::AssetGuid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CuratorError {
    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("asset cache database error")]
    Database(#[from] redb::Error),
    #[error("failed to encode cache entry")]
    Encoding(#[from] bincode::Error),
    #[error("invalid asset document {path:?}")]
    InvalidDocument {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to watch directory {path:?}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify_debouncer_full::notify::Error,
    },
    #[error("unknown asset {0}")]
    UnknownAsset(AssetGuid),
    #[error("{0:?} is not inside any data directory")]
    OutsideDataDirectories(PathBuf),
    #[error("file type of {0:?} is not supported by this generator")]
    UnsupportedFileType(PathBuf),
    #[error("generator produced a '{actual}' document, expected '{expected}'")]
    WrongDocumentKind { expected: String, actual: String },
    #[error("generating an asset document from {path:?} failed")]
    GenerationFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CuratorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = CuratorError> = std::result::Result<T, E>;
