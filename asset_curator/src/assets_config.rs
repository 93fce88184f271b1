use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{CuratorError, Result};

/// Project-level settings, stored as JSON next to the project.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AssetsConfig {
    /// Bumping this throws away the target folder and the file cache.
    pub version: u64,
    /// Folders that are scanned and watched. Either plain paths or `>name/sub/folder`,
    /// where `name` is looked up in `special_directories`.
    pub data_directories: Vec<String>,
    pub special_directories: HashMap<String, PathBuf>,
    /// Where transformed outputs and thumbnails go.
    pub target: PathBuf,
    /// Number of ticks a file system event waits before it is acted upon.
    pub frame_delay: u32,
    pub processor_workers: usize,
    pub tick_interval_ms: u64,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            version: 1,
            data_directories: vec!["assets".into()],
            special_directories: HashMap::new(),
            target: "target-assets".into(),
            frame_delay: 5,
            processor_workers: 1,
            tick_interval_ms: 16,
        }
    }
}

impl AssetsConfig {
    pub fn from_str(value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|e| CuratorError::Config(e.to_string()))
    }

    /// Reads the config, or writes out the defaults if there is none yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_str(&content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                log::info!("Created default config at {:?}", path);
                Ok(config)
            }
            Err(err) => Err(CuratorError::io(path, err)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| CuratorError::Config(e.to_string()))?;
        fs::write(path, content).map_err(|e| CuratorError::io(path, e))
    }

    pub fn get_asset_cache_db_path(&self) -> PathBuf {
        self.target.join("asset_cache.redb")
    }

    pub fn get_thumbnail_dir(&self) -> PathBuf {
        self.target.join("thumbnails")
    }

    /// Turns `>name/rest` into the configured special directory joined with `rest`.
    pub fn resolve_special_directory(&self, directory: &str) -> Option<PathBuf> {
        let Some(special) = directory.strip_prefix('>') else {
            return Some(PathBuf::from(directory));
        };
        let (name, rest) = special.split_once(['/', '\\']).unwrap_or((special, ""));
        let root = self.special_directories.get(name)?;
        if rest.is_empty() {
            Some(root.clone())
        } else {
            Some(root.join(rest))
        }
    }

    /// Absolute, canonical data directories.
    /// Directories that cannot be resolved are logged and left out.
    pub fn resolve_data_directories(&self) -> Vec<PathBuf> {
        let mut resolved: Vec<PathBuf> = Vec::new();
        for directory in &self.data_directories {
            let Some(path) = self.resolve_special_directory(directory) else {
                log::error!("Unknown special directory in data directory {:?}", directory);
                continue;
            };
            match fs::canonicalize(&path) {
                Ok(path) if path.is_dir() => {
                    if !resolved.contains(&path) {
                        resolved.push(path);
                    }
                }
                Ok(path) => log::error!("Data directory {:?} is not a directory", path),
                Err(err) => log::error!("Failed to resolve data directory {:?}: {}", path, err),
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_special_directories() {
        let mut config = AssetsConfig::default();
        config
            .special_directories
            .insert("sdk".into(), PathBuf::from("/opt/engine"));

        assert_eq!(
            config.resolve_special_directory(">sdk/Data/Base"),
            Some(PathBuf::from("/opt/engine/Data/Base"))
        );
        assert_eq!(
            config.resolve_special_directory(">sdk"),
            Some(PathBuf::from("/opt/engine"))
        );
        assert_eq!(config.resolve_special_directory(">project/Data"), None);
        assert_eq!(
            config.resolve_special_directory("assets"),
            Some(PathBuf::from("assets"))
        );
    }

    #[test]
    fn skips_unresolvable_data_directories() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("textures");
        fs::create_dir(&existing).unwrap();

        let config = AssetsConfig {
            data_directories: vec![
                existing.to_string_lossy().into_owned(),
                dir.path().join("missing").to_string_lossy().into_owned(),
                ">nowhere/Data".into(),
            ],
            ..Default::default()
        };
        let resolved = config.resolve_data_directories();
        assert_eq!(resolved, vec![fs::canonicalize(&existing).unwrap()]);
    }

    #[test]
    fn load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset_curator.json");

        let created = AssetsConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = AssetsConfig::load_or_create(&path).unwrap();
        assert_eq!(created.frame_delay, loaded.frame_delay);
        assert_eq!(loaded.data_directories, vec!["assets".to_string()]);

        fs::write(&path, r#"{ "frame_delay": 2 }"#).unwrap();
        let partial = AssetsConfig::load_or_create(&path).unwrap();
        assert_eq!(partial.frame_delay, 2);
        assert_eq!(partial.processor_workers, 1);
    }
}
