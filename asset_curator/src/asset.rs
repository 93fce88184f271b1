use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use asset_common::{AssetGuid, TransformState};
use serde::{Deserialize, Serialize};

use crate::{
    data_directory::normalize_path,
    error::{CuratorError, Result},
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AssetDocumentHeader {
    pub guid: AssetGuid,
    pub asset_type: String,
    #[serde(default)]
    pub document_version: u32,
}

/// The on-disk asset document. Stored as JSON, the file extension tells the document type.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AssetDocument {
    pub header: AssetDocumentHeader,
    /// Inputs the transform reads. Asset GUIDs or paths; relative paths are relative to
    /// the data directory that contains the document.
    #[serde(default)]
    pub transform_dependencies: Vec<String>,
    /// Inputs only the thumbnail needs.
    #[serde(default)]
    pub thumbnail_dependencies: Vec<String>,
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl AssetDocument {
    pub fn new(asset_type: impl Into<String>) -> Self {
        Self {
            header: AssetDocumentHeader {
                guid: AssetGuid::new_random(),
                asset_type: asset_type.into(),
                document_version: 0,
            },
            transform_dependencies: Vec::new(),
            thumbnail_dependencies: Vec::new(),
            properties: serde_json::Value::Null,
        }
    }

    pub fn guid(&self) -> AssetGuid {
        self.header.guid
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read(path).map_err(|e| CuratorError::io(path, e))?;
        serde_json::from_slice(&content).map_err(|source| CuratorError::InvalidDocument {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(self).map_err(|source| CuratorError::InvalidDocument {
                path: path.to_path_buf(),
                source,
            })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CuratorError::io(parent, e))?;
        }
        fs::write(path, content).map_err(|e| CuratorError::io(path, e))
    }
}

/// Something an asset reads, after resolving the string from the document.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum AssetDependency {
    File(PathBuf),
    Asset(AssetGuid),
}

impl AssetDependency {
    pub fn resolve(value: &str, data_directory: &Path) -> Self {
        if let Some(guid) = AssetGuid::parse(value) {
            return Self::Asset(guid);
        }
        Self::File(normalize_path(&data_directory.join(value)))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ProcessPhase {
    Transform,
    Thumbnail,
}

/// Attempts that failed stick until the inputs of that phase change.
#[derive(Clone, Debug)]
pub(crate) struct RecordedFailure {
    pub phase: ProcessPhase,
    /// Transform or thumbnail hash at the time of the failure.
    pub hash: u64,
    pub state: TransformState,
    pub message: Option<String>,
}

/// What the curator knows about one asset document.
#[derive(Clone, Debug)]
pub struct AssetInfo {
    pub guid: AssetGuid,
    /// Absolute path of the document.
    pub path: PathBuf,
    pub asset_type: String,
    pub document: Arc<AssetDocument>,
    pub transform_dependencies: Vec<AssetDependency>,
    /// Thumbnail dependencies.
    pub references: Vec<AssetDependency>,
    pub transform_state: TransformState,
    pub last_error: Option<String>,
    /// 0 when it couldn't be computed.
    pub transform_hash: u64,
    pub thumbnail_hash: u64,
    pub(crate) recorded_failure: Option<RecordedFailure>,
    /// Set when the document on disk stopped parsing. The last good document is kept.
    pub(crate) document_error: Option<String>,
}

impl AssetInfo {
    pub fn new(path: PathBuf, document: AssetDocument, data_directory: &Path) -> Self {
        let resolve = |values: &[String]| -> Vec<AssetDependency> {
            let mut dependencies: Vec<AssetDependency> = values
                .iter()
                .map(|v| AssetDependency::resolve(v, data_directory))
                .collect();
            dependencies.sort();
            dependencies.dedup();
            dependencies
        };
        Self {
            guid: document.guid(),
            path,
            asset_type: document.header.asset_type.clone(),
            transform_dependencies: resolve(&document.transform_dependencies),
            references: resolve(&document.thumbnail_dependencies),
            document: Arc::new(document),
            transform_state: TransformState::Unknown,
            last_error: None,
            transform_hash: 0,
            thumbnail_hash: 0,
            recorded_failure: None,
            document_error: None,
        }
    }

    /// Asset GUIDs this asset needs transformed before it can be transformed itself.
    pub fn asset_dependencies(&self) -> impl Iterator<Item = AssetGuid> + '_ {
        self.transform_dependencies.iter().filter_map(|d| match d {
            AssetDependency::Asset(guid) => Some(*guid),
            AssetDependency::File(_) => None,
        })
    }
}
