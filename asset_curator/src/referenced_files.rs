use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use asset_common::AssetGuid;
use serde::{Deserialize, Serialize};

use crate::file_change::FileTimestamp;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum FileState {
    /// Known from the cache, not yet confirmed on disk.
    Unknown,
    Valid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileStatus {
    pub timestamp: FileTimestamp,
    /// Content hash, 0 while it hasn't been computed.
    pub hash: u64,
    pub state: FileState,
    /// Set when the file is an asset document.
    pub asset_guid: Option<AssetGuid>,
}

impl FileStatus {
    pub fn new(timestamp: FileTimestamp, hash: u64) -> Self {
        Self {
            timestamp,
            hash,
            state: FileState::Valid,
            asset_guid: None,
        }
    }
}

/// Every file the curator has seen, keyed by absolute path.
///
/// Sorted, so that everything below a folder is one contiguous range.
#[derive(Default)]
pub struct ReferencedFiles {
    files: BTreeMap<PathBuf, FileStatus>,
}

impl ReferencedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<&FileStatus> {
        self.files.get(path)
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut FileStatus> {
        self.files.get_mut(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn insert(&mut self, path: PathBuf, status: FileStatus) -> Option<FileStatus> {
        self.files.insert(path, status)
    }

    pub fn remove(&mut self, path: &Path) -> Option<FileStatus> {
        self.files.remove(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &FileStatus)> {
        self.files.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PathBuf, &mut FileStatus)> {
        self.files.iter_mut()
    }

    /// Known files inside `folder`, at any depth.
    /// `Path` ordering is per component, so `/a/b/..` sorts before `/a/bc`.
    pub fn files_in_folder(&self, folder: &Path) -> BTreeSet<PathBuf> {
        self.files
            .range(folder.to_path_buf()..)
            .take_while(|(path, _)| path.starts_with(folder))
            .filter(|(path, _)| path.as_path() != folder)
            .map(|(path, _)| path.clone())
            .collect()
    }
}
