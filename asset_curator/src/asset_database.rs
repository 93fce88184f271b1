use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::{
    assets_config::AssetsConfig,
    error::{CuratorError, Result},
    file_change::FileTimestamp,
};

const METADATA_TABLE: TableDefinition<&str, u64> = TableDefinition::new("metadata");
const FILE_STATUS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("file_status");
const VERSION_KEY: &str = "version";

/// What survives a restart of the curator for a single file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CachedFileStatus {
    pub timestamp: FileTimestamp,
    pub hash: u64,
}

pub struct AssetDatabase<State> {
    db: Database,
    _state: State,
}

pub struct AssetDatabaseNew;
pub struct AssetDatabaseMigrated;

impl AssetDatabase<AssetDatabaseNew> {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            _state: AssetDatabaseNew,
        }
    }

    pub fn needs_migration(&self, version: u64) -> bool {
        // Poor person's try block, see https://github.com/rust-lang/rust/issues/31436#issuecomment-1736412533
        (|| {
            let read = self.db.begin_read().ok()?;
            let metadata = read.open_table(METADATA_TABLE).ok()?;
            let old_version = metadata.get(VERSION_KEY).ok()??.value();
            Some(old_version != version)
        })()
        .unwrap_or(true)
    }

    pub fn finished_migration(
        self,
        version: u64,
    ) -> Result<AssetDatabase<AssetDatabaseMigrated>, redb::Error> {
        let write = self.db.begin_write()?;
        {
            let mut metadata = write.open_table(METADATA_TABLE)?;
            metadata.insert(VERSION_KEY, version)?;
        }
        write.commit()?;
        Ok(AssetDatabase {
            db: self.db,
            _state: AssetDatabaseMigrated,
        })
    }
}

impl AssetDatabase<AssetDatabaseMigrated> {
    pub fn load_file_cache(&self) -> Result<HashMap<PathBuf, CachedFileStatus>> {
        let mut cache = HashMap::new();
        for (path, bytes) in self.read_file_status_entries()? {
            match bincode::deserialize::<CachedFileStatus>(&bytes) {
                Ok(status) => {
                    cache.insert(PathBuf::from(path), status);
                }
                Err(err) => {
                    log::error!("Failed to deserialize cached file status of {}: {:?}", path, err);
                }
            }
        }
        Ok(cache)
    }

    /// Replaces the whole file cache.
    pub fn store_file_cache<'a>(
        &self,
        files: impl IntoIterator<Item = (&'a Path, CachedFileStatus)>,
    ) -> Result<()> {
        let mut entries = Vec::new();
        for (path, status) in files {
            entries.push((path.to_string_lossy().into_owned(), bincode::serialize(&status)?));
        }
        self.write_file_status_entries(&entries)?;
        Ok(())
    }

    fn read_file_status_entries(&self) -> Result<Vec<(String, Vec<u8>)>, redb::Error> {
        let read = self.db.begin_read()?;
        let table = match read.open_table(FILE_STATUS_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }

    fn write_file_status_entries(&self, entries: &[(String, Vec<u8>)]) -> Result<(), redb::Error> {
        let write = self.db.begin_write()?;
        write.delete_table(FILE_STATUS_TABLE)?;
        {
            let mut table = write.open_table(FILE_STATUS_TABLE)?;
            for (path, bytes) in entries {
                table.insert(path.as_str(), bytes.as_slice())?;
            }
        }
        write.commit()?;
        Ok(())
    }
}

/// Opens the cache in the target folder. A cache from another version takes the whole
/// target folder with it, since the outputs might not be compatible either.
pub fn load_asset_database(config: &AssetsConfig) -> Result<AssetDatabase<AssetDatabaseMigrated>> {
    let database_config = redb::Builder::new();
    fs::create_dir_all(&config.target).map_err(|e| CuratorError::io(&config.target, e))?;

    let mut asset_database = AssetDatabase::new(
        database_config
            .create(config.get_asset_cache_db_path())
            .map_err(redb::Error::from)?,
    );
    if asset_database.needs_migration(config.version) {
        std::mem::drop(asset_database);
        log::info!("Asset cache is outdated, clearing {:?}", config.target);
        fs::remove_dir_all(&config.target).map_err(|e| CuratorError::io(&config.target, e))?;
        fs::create_dir_all(&config.target).map_err(|e| CuratorError::io(&config.target, e))?;
        asset_database = AssetDatabase::new(
            database_config
                .create(config.get_asset_cache_db_path())
                .map_err(redb::Error::from)?,
        );
    }
    Ok(asset_database.finished_migration(config.version)?)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;

    fn config(target: PathBuf, version: u64) -> AssetsConfig {
        AssetsConfig {
            version,
            target,
            ..Default::default()
        }
    }

    #[test]
    fn file_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path().join("target"), 3);
        let timestamp = FileTimestamp::new(SystemTime::UNIX_EPOCH + Duration::from_secs(42));
        {
            let db = load_asset_database(&config).unwrap();
            db.store_file_cache([(
                Path::new("/proj/a.png"),
                CachedFileStatus { timestamp, hash: 7 },
            )])
            .unwrap();
        }

        let db = load_asset_database(&config).unwrap();
        let cache = db.load_file_cache().unwrap();
        assert_eq!(
            cache.get(Path::new("/proj/a.png")),
            Some(&CachedFileStatus { timestamp, hash: 7 })
        );
    }

    #[test]
    fn version_change_clears_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        {
            let db = load_asset_database(&config(target.clone(), 1)).unwrap();
            db.store_file_cache([(
                Path::new("/proj/a.png"),
                CachedFileStatus {
                    timestamp: FileTimestamp::unknown(),
                    hash: 1,
                },
            )])
            .unwrap();
        }
        fs::write(target.join("stale.bin"), "old output").unwrap();

        let db = load_asset_database(&config(target.clone(), 2)).unwrap();
        assert!(!target.join("stale.bin").exists());
        assert!(db.load_file_cache().unwrap().is_empty());
    }
}
