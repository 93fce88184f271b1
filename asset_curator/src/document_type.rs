use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use asset_common::AssetGuid;

use crate::{asset::AssetDocument, data_directory::file_type_key};

/// What a transform can report besides failing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransformOutcome {
    Transformed,
    /// The document is out of sync with its source and has to be re-imported by the user.
    NeedsImport,
}

/// Everything a transform may look at.
pub struct TransformContext<'a> {
    pub guid: AssetGuid,
    pub document_path: &'a Path,
    pub document: &'a AssetDocument,
    /// Resolved file dependencies, sorted.
    pub file_dependencies: &'a [PathBuf],
    /// Output files of the assets this one depends on.
    pub asset_outputs: &'a [(AssetGuid, PathBuf)],
    cancel: &'a AtomicBool,
}

impl<'a> TransformContext<'a> {
    pub fn new(
        guid: AssetGuid,
        document_path: &'a Path,
        document: &'a AssetDocument,
        file_dependencies: &'a [PathBuf],
        asset_outputs: &'a [(AssetGuid, PathBuf)],
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            guid,
            document_path,
            document,
            file_dependencies,
            asset_outputs,
            cancel,
        }
    }

    /// Long transforms should poll this and bail out early.
    /// Whatever they return after cancellation is thrown away.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// An asset type the curator can transform. One per document extension.
pub trait AssetDocumentType: Send + Sync {
    fn asset_type(&self) -> &str;

    /// Without the dot.
    fn document_extension(&self) -> &str;

    fn output_extension(&self) -> &str;

    /// Bump to invalidate every output of this type.
    fn type_version(&self) -> u16 {
        1
    }

    fn needs_thumbnail(&self) -> bool {
        false
    }

    /// Writes the payload of the output file. The header is written by the curator.
    /// Does not check if a transform is actually necessary.
    fn transform(
        &self,
        context: &TransformContext<'_>,
        output: &mut dyn Write,
    ) -> anyhow::Result<TransformOutcome>;

    fn create_thumbnail(
        &self,
        _context: &TransformContext<'_>,
        _output: &mut dyn Write,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Registered document types, looked up by asset type or document extension.
#[derive(Default, Clone)]
pub struct DocumentTypeRegistry {
    types: HashMap<String, Arc<dyn AssetDocumentType>>,
    by_extension: HashMap<String, String>,
}

impl DocumentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, document_type: impl AssetDocumentType + 'static) -> Self {
        self.register(Arc::new(document_type));
        self
    }

    pub fn register(&mut self, document_type: Arc<dyn AssetDocumentType>) {
        let extension = document_type.document_extension().to_lowercase();
        let asset_type = document_type.asset_type().to_string();
        if let Some(previous) = self.by_extension.insert(extension.clone(), asset_type.clone()) {
            log::warn!(
                "Document extension '{}' of '{}' was already used by '{}'",
                extension,
                asset_type,
                previous
            );
        }
        self.types.insert(asset_type, document_type);
    }

    pub fn get(&self, asset_type: &str) -> Option<&Arc<dyn AssetDocumentType>> {
        self.types.get(asset_type)
    }

    pub fn for_extension(&self, extension: &str) -> Option<&Arc<dyn AssetDocumentType>> {
        self.by_extension
            .get(&extension.to_lowercase())
            .and_then(|asset_type| self.types.get(asset_type))
    }

    pub fn is_asset_document(&self, path: &Path) -> bool {
        path.extension().is_some()
            && file_type_key(path).is_some_and(|ext| self.by_extension.contains_key(&ext))
    }
}

/// A temporary file that will be deleted when dropped.
/// Outputs are written here first, so that a crash never leaves a half written output
/// with a valid header behind.
pub(crate) struct TempFile {
    path: Option<PathBuf>,
}
impl TempFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }
    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }
    /// Moves the file to its final place.
    pub fn persist(mut self, target: &Path) -> std::io::Result<()> {
        if let Some(path) = self.path.take() {
            if let Err(err) = fs::rename(&path, target) {
                self.path = Some(path);
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if !path.exists() {
                return;
            }
            if let Err(err) = std::fs::remove_file(path) {
                log::warn!("Failed to remove temporary file {:?}: {}", path, err);
            }
        }
    }
}
