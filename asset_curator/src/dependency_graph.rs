use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
};

use asset_common::{AssetFileHeader, AssetGuid, TransformState, TransformStats};

use crate::{
    asset::{AssetDependency, AssetInfo, ProcessPhase},
    document_type::DocumentTypeRegistry,
    file_change::{hash_file, FileTimestamp, HashCombiner},
    referenced_files::{FileState, FileStatus, ReferencedFiles},
};

/// Where transform outputs and thumbnails end up.
#[derive(Clone, Debug)]
pub struct OutputLayout {
    target: PathBuf,
    thumbnails: PathBuf,
}

impl OutputLayout {
    pub fn new(target: PathBuf, thumbnails: PathBuf) -> Self {
        Self { target, thumbnails }
    }

    pub fn output_path(&self, guid: AssetGuid, output_extension: &str) -> PathBuf {
        self.target.join(format!("{}.{}", guid, output_extension))
    }

    pub fn thumbnail_path(&self, guid: AssetGuid) -> PathBuf {
        self.thumbnails.join(format!("{}.thumb", guid))
    }
}

/// All known assets, plus the inverse of their dependency lists.
#[derive(Default)]
pub struct DependencyGraph {
    assets: HashMap<AssetGuid, AssetInfo>,
    path_to_guid: HashMap<PathBuf, AssetGuid>,
    /// Dependency -> assets that name it, as transform dependency or as reference.
    dependents: HashMap<AssetDependency, HashSet<AssetGuid>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn contains(&self, guid: AssetGuid) -> bool {
        self.assets.contains_key(&guid)
    }

    pub fn get(&self, guid: AssetGuid) -> Option<&AssetInfo> {
        self.assets.get(&guid)
    }

    pub fn get_mut(&mut self, guid: AssetGuid) -> Option<&mut AssetInfo> {
        self.assets.get_mut(&guid)
    }

    pub fn guid_for_path(&self, path: &Path) -> Option<AssetGuid> {
        self.path_to_guid.get(path).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetInfo> {
        self.assets.values()
    }

    pub fn guids(&self) -> impl Iterator<Item = AssetGuid> + '_ {
        self.assets.keys().copied()
    }

    /// Replaces an asset with the same GUID. Returns the previous one.
    pub fn insert(&mut self, info: AssetInfo) -> Option<AssetInfo> {
        let previous = self.remove(info.guid);
        for dependency in info.transform_dependencies.iter().chain(&info.references) {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(info.guid);
        }
        self.path_to_guid.insert(info.path.clone(), info.guid);
        self.assets.insert(info.guid, info);
        previous
    }

    pub fn remove(&mut self, guid: AssetGuid) -> Option<AssetInfo> {
        let info = self.assets.remove(&guid)?;
        for dependency in info.transform_dependencies.iter().chain(&info.references) {
            if let Some(dependents) = self.dependents.get_mut(dependency) {
                dependents.remove(&guid);
                if dependents.is_empty() {
                    self.dependents.remove(dependency);
                }
            }
        }
        if self.path_to_guid.get(&info.path) == Some(&guid) {
            self.path_to_guid.remove(&info.path);
        }
        Some(info)
    }

    /// Assets that directly name `dependency`.
    pub fn dependents_of(&self, dependency: &AssetDependency) -> impl Iterator<Item = AssetGuid> + '_ {
        self.dependents
            .get(dependency)
            .into_iter()
            .flat_map(|dependents| dependents.iter().copied())
    }

    /// The given assets, the assets using the changed files, and everything that
    /// transitively depends on or references any of them.
    /// Unknown GUIDs are followed to their dependents but not returned.
    pub fn affected_assets(
        &self,
        assets: impl IntoIterator<Item = AssetGuid>,
        changed_files: &[PathBuf],
    ) -> BTreeSet<AssetGuid> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<AssetGuid> = assets.into_iter().collect();
        for path in changed_files {
            queue.extend(self.dependents_of(&AssetDependency::File(path.clone())));
        }

        let mut affected = BTreeSet::new();
        while let Some(guid) = queue.pop_front() {
            if !visited.insert(guid) {
                continue;
            }
            if self.contains(guid) {
                affected.insert(guid);
            }
            queue.extend(self.dependents_of(&AssetDependency::Asset(guid)));
        }
        affected
    }

    pub fn transform_stats(&self) -> TransformStats {
        self.assets.values().map(|info| info.transform_state).collect()
    }
}

/// Result of evaluating a single asset.
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub state: TransformState,
    pub transform_hash: u64,
    pub thumbnail_hash: u64,
    pub error: Option<String>,
}

impl Evaluation {
    fn failed(state: TransformState, message: impl Into<String>) -> Self {
        Self {
            state,
            transform_hash: 0,
            thumbnail_hash: 0,
            error: Some(message.into()),
        }
    }

    fn with_hash(state: TransformState, transform_hash: u64) -> Self {
        Self {
            state,
            transform_hash,
            thumbnail_hash: 0,
            error: None,
        }
    }
}

/// Computes transform states and hashes for one pass over the graph.
///
/// Asset dependencies are evaluated first, depth first, and every result is
/// memoized. An asset that is met again while it is still on the stack closes a
/// cycle, every asset on the way back then ends up as `CircularDependency`.
pub struct StateEvaluator<'a> {
    graph: &'a DependencyGraph,
    files: &'a mut ReferencedFiles,
    types: &'a DocumentTypeRegistry,
    outputs: &'a OutputLayout,
    memo: HashMap<AssetGuid, Evaluation>,
    in_progress: HashSet<AssetGuid>,
}

impl<'a> StateEvaluator<'a> {
    pub fn new(
        graph: &'a DependencyGraph,
        files: &'a mut ReferencedFiles,
        types: &'a DocumentTypeRegistry,
        outputs: &'a OutputLayout,
    ) -> Self {
        Self {
            graph,
            files,
            types,
            outputs,
            memo: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    pub fn evaluate(&mut self, guid: AssetGuid) -> Evaluation {
        if let Some(evaluation) = self.memo.get(&guid) {
            return evaluation.clone();
        }
        if !self.in_progress.insert(guid) {
            return Evaluation::failed(
                TransformState::CircularDependency,
                format!("asset {} depends on itself", guid),
            );
        }
        let evaluation = self.evaluate_uncached(guid);
        self.in_progress.remove(&guid);
        self.memo.insert(guid, evaluation.clone());
        evaluation
    }

    /// Everything evaluated during this pass, dependencies included.
    pub fn into_results(self) -> HashMap<AssetGuid, Evaluation> {
        self.memo
    }

    fn evaluate_uncached(&mut self, guid: AssetGuid) -> Evaluation {
        let (graph, types) = (self.graph, self.types);
        let Some(info) = graph.get(guid) else {
            return Evaluation::failed(
                TransformState::MissingTransformDependency,
                format!("asset {} does not exist", guid),
            );
        };
        let Some(document_type) = types.get(&info.asset_type) else {
            return Evaluation::failed(
                TransformState::TransformError,
                format!("no document type is registered for '{}'", info.asset_type),
            );
        };
        if let Some(error) = &info.document_error {
            return Evaluation::failed(TransformState::TransformError, error.clone());
        }
        let Some(document_hash) = self.file_hash(&info.path) else {
            return Evaluation::failed(
                TransformState::TransformError,
                format!("asset document {:?} can't be read", info.path),
            );
        };

        let mut hasher = HashCombiner::new();
        hasher
            .add_str(&info.asset_type)
            .add_u64(document_hash)
            .add_u64(document_type.type_version().into());

        let mut circular = false;
        let mut missing = Vec::new();
        let mut failed = Vec::new();
        let mut pending = false;
        for dependency in &info.transform_dependencies {
            match dependency {
                AssetDependency::File(path) => match self.file_hash(path) {
                    Some(hash) => {
                        hasher.add_str(&path.to_string_lossy()).add_u64(hash);
                    }
                    None => missing.push(format!("{:?}", path)),
                },
                AssetDependency::Asset(dependency_guid) => {
                    if !graph.contains(*dependency_guid) {
                        missing.push(dependency_guid.to_string());
                        continue;
                    }
                    let dependency = self.evaluate(*dependency_guid);
                    match dependency.state {
                        TransformState::CircularDependency => circular = true,
                        TransformState::UpToDate => {}
                        state if state.is_error() => failed.push(dependency_guid.to_string()),
                        _ => pending = true,
                    }
                    hasher
                        .add_str(&dependency_guid.to_string())
                        .add_u64(dependency.transform_hash);
                }
            }
        }

        if circular {
            return Evaluation::failed(
                TransformState::CircularDependency,
                "the asset is part of a dependency cycle, or depends on one",
            );
        }
        if !missing.is_empty() {
            return Evaluation::failed(
                TransformState::MissingTransformDependency,
                format!("missing dependencies: {}", missing.join(", ")),
            );
        }
        let transform_hash = hasher.finish();
        if !failed.is_empty() {
            return Evaluation {
                error: Some(format!("dependencies can't be transformed: {}", failed.join(", "))),
                ..Evaluation::with_hash(TransformState::MissingTransformDependency, transform_hash)
            };
        }
        if let Some(failure) = &info.recorded_failure {
            if failure.phase == ProcessPhase::Transform && failure.hash == transform_hash {
                return Evaluation {
                    error: failure.message.clone(),
                    ..Evaluation::with_hash(failure.state, transform_hash)
                };
            }
        }

        let output = self
            .outputs
            .output_path(guid, document_type.output_extension());
        if pending || !header_matches(&output, transform_hash, document_type.type_version()) {
            return Evaluation::with_hash(TransformState::NeedsTransform, transform_hash);
        }
        if !document_type.needs_thumbnail() {
            return Evaluation::with_hash(TransformState::UpToDate, transform_hash);
        }
        self.evaluate_thumbnail(info, transform_hash, document_type.type_version())
    }

    fn evaluate_thumbnail(&mut self, info: &AssetInfo, transform_hash: u64, version: u16) -> Evaluation {
        let graph = self.graph;
        let mut hasher = HashCombiner::new();
        hasher.add_u64(transform_hash);
        let mut missing = Vec::new();
        for reference in &info.references {
            // Referenced assets contribute their document, so that reference cycles stay legal.
            let path = match reference {
                AssetDependency::File(path) => path.as_path(),
                AssetDependency::Asset(guid) => match graph.get(*guid) {
                    Some(referenced) => referenced.path.as_path(),
                    None => {
                        missing.push(guid.to_string());
                        continue;
                    }
                },
            };
            match self.file_hash(path) {
                Some(hash) => {
                    hasher.add_str(&path.to_string_lossy()).add_u64(hash);
                }
                None => missing.push(format!("{:?}", path)),
            }
        }
        if !missing.is_empty() {
            return Evaluation {
                error: Some(format!("missing thumbnail dependencies: {}", missing.join(", "))),
                ..Evaluation::with_hash(TransformState::MissingThumbnailDependency, transform_hash)
            };
        }

        let thumbnail_hash = hasher.finish();
        let evaluation = |state| Evaluation {
            thumbnail_hash,
            ..Evaluation::with_hash(state, transform_hash)
        };
        if let Some(failure) = &info.recorded_failure {
            if failure.phase == ProcessPhase::Thumbnail && failure.hash == thumbnail_hash {
                return Evaluation {
                    error: failure.message.clone(),
                    ..evaluation(failure.state)
                };
            }
        }
        if header_matches(&self.outputs.thumbnail_path(info.guid), thumbnail_hash, version) {
            evaluation(TransformState::UpToDate)
        } else {
            evaluation(TransformState::NeedsThumbnail)
        }
    }

    /// Content hash of a file, computed on first use.
    /// Files outside of the data directories get picked up here as well.
    fn file_hash(&mut self, path: &Path) -> Option<u64> {
        if !self.files.contains(path) {
            let metadata = fs::metadata(path).ok().filter(|m| m.is_file())?;
            self.files.insert(
                path.to_path_buf(),
                FileStatus::new(FileTimestamp::from_metadata(&metadata), 0),
            );
        }
        let status = self.files.get_mut(path)?;
        if status.state != FileState::Valid {
            return None;
        }
        if status.hash == 0 {
            match hash_file(path) {
                Ok(hash) => status.hash = hash,
                Err(err) => {
                    log::warn!("Failed to hash {:?}: {}", path, err);
                    return None;
                }
            }
        }
        Some(status.hash)
    }
}

fn header_matches(path: &Path, hash: u64, version: u16) -> bool {
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    AssetFileHeader::read(&mut file).is_ok_and(|header| header.matches(hash, version))
}
