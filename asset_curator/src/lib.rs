pub mod asset;
pub mod asset_database;
pub mod asset_processor;
pub mod asset_watcher;
pub mod assets_config;
pub mod curator;
pub mod data_directory;
pub mod dependency_graph;
pub mod directory_watcher;
pub mod document_generator;
pub mod document_type;
pub mod error;
pub mod file_change;
pub mod plugins;
pub mod referenced_files;
pub mod task_pool;

pub use asset_processor::{AssetProcessor, ProcessTaskState};
pub use asset_watcher::{AssetWatcher, FileChangeReceiver};
pub use assets_config::AssetsConfig;
pub use curator::AssetCurator;
pub use document_generator::{AssetDocumentGenerator, DocumentImporter, GeneratorRegistry};
pub use document_type::{AssetDocumentType, DocumentTypeRegistry};
pub use error::{CuratorError, Result};
