use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use relative_path::RelativePathBuf;
use walkdir::WalkDir;

/// A file found while walking a folder on disk.
pub struct FoundFile {
    pub path: PathBuf,
    pub metadata: fs::Metadata,
}

/// Every file below `folder`. Entries that vanish or can't be stat'ed while walking are skipped.
pub fn iterate_files(folder: &Path) -> Vec<FoundFile> {
    let mut files = Vec::new();
    for entry in WalkDir::new(folder)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Failed to get metadata for {:?}: {}", entry.path(), e);
                continue;
            }
        };
        files.push(FoundFile {
            path: entry.into_path(),
            metadata,
        });
    }
    files
}

/// The data directory that contains `path`, if any.
pub fn find_data_directory<'a>(path: &Path, data_directories: &'a [PathBuf]) -> Option<&'a Path> {
    data_directories
        .iter()
        .filter(|dir| path.starts_with(dir))
        // Nested data directories: the innermost one wins.
        .max_by_key(|dir| dir.components().count())
        .map(|dir| dir.as_path())
}

/// `path` relative to the data directory it is in.
pub fn make_data_directory_relative(
    path: &Path,
    data_directories: &[PathBuf],
) -> Option<RelativePathBuf> {
    let dir = find_data_directory(path, data_directories)?;
    let relative = path.strip_prefix(dir).ok()?;
    RelativePathBuf::from_path(relative).ok()
}

/// Folds `.` and `..` without touching the disk, so that a path spelled in a document
/// compares equal to the same path reported by the walker or the watcher.
/// `..` at the root stays at the root, leading `..` of a relative path are kept.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                Some(Component::ParentDir) | Some(Component::CurDir) | None => {
                    normalized.push("..")
                }
            },
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Lower-cased extension, or the whole lower-cased file name for files without one.
pub fn file_type_key(path: &Path) -> Option<String> {
    match path.extension() {
        Some(extension) => Some(extension.to_string_lossy().to_lowercase()),
        None => path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase()),
    }
}
