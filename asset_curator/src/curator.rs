use std::{
    collections::{BTreeSet, HashSet},
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use anyhow::Context;
use asset_common::{AssetFileHeader, AssetGuid, CuratorEvent, TransformState, TransformStats};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{
    asset::{AssetDependency, AssetDocument, AssetInfo, ProcessPhase, RecordedFailure},
    asset_database::{load_asset_database, AssetDatabase, AssetDatabaseMigrated, CachedFileStatus},
    asset_watcher::FileChangeReceiver,
    assets_config::AssetsConfig,
    data_directory::{find_data_directory, iterate_files, normalize_path},
    dependency_graph::{DependencyGraph, Evaluation, OutputLayout, StateEvaluator},
    document_type::{
        AssetDocumentType, DocumentTypeRegistry, TempFile, TransformContext, TransformOutcome,
    },
    error::{CuratorError, Result},
    file_change::FileTimestamp,
    referenced_files::{FileState, FileStatus, ReferencedFiles},
};

#[derive(Default)]
struct CuratorState {
    project_open: bool,
    files: ReferencedFiles,
    graph: DependencyGraph,
    /// Assets a transform or thumbnail job is currently running for.
    in_flight: HashSet<AssetGuid>,
}

/// What a file system pass changed, so that only the affected part of the graph is re-evaluated.
#[derive(Default)]
struct Changes {
    files: Vec<PathBuf>,
    assets: Vec<AssetGuid>,
    added: Vec<AssetGuid>,
    removed: Vec<AssetGuid>,
    everything: bool,
}

/// Everything a job needs, copied out so that it can run without holding the lock.
struct Job {
    guid: AssetGuid,
    phase: ProcessPhase,
    document_type: Arc<dyn AssetDocumentType>,
    document: Arc<AssetDocument>,
    document_path: PathBuf,
    file_dependencies: Vec<PathBuf>,
    asset_outputs: Vec<(AssetGuid, PathBuf)>,
    hash: u64,
    output: PathBuf,
}

/// Keeps track of every asset document and every file it reads, and of how far each
/// asset got on its way to a transformed output.
///
/// The graph and the file list live behind one lock. Transforms run outside of it.
pub struct AssetCurator {
    config: AssetsConfig,
    data_directories: Vec<PathBuf>,
    target: PathBuf,
    types: DocumentTypeRegistry,
    outputs: OutputLayout,
    database: AssetDatabase<AssetDatabaseMigrated>,
    state: Mutex<CuratorState>,
    work_available: Condvar,
    subscribers: Mutex<Vec<UnboundedSender<CuratorEvent>>>,
}

impl AssetCurator {
    pub fn new(config: AssetsConfig, types: DocumentTypeRegistry) -> Result<Self> {
        let database = load_asset_database(&config)?;
        let thumbnails = config.get_thumbnail_dir();
        fs::create_dir_all(&thumbnails).map_err(|e| CuratorError::io(&thumbnails, e))?;
        let target = fs::canonicalize(&config.target).map_err(|e| CuratorError::io(&config.target, e))?;
        let thumbnails = target.join("thumbnails");

        let data_directories = config.resolve_data_directories();
        if data_directories.is_empty() {
            log::warn!("No usable data directories configured");
        }

        Ok(Self {
            outputs: OutputLayout::new(target.clone(), thumbnails),
            config,
            data_directories,
            target,
            types,
            database,
            state: Mutex::new(CuratorState::default()),
            work_available: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AssetsConfig {
        &self.config
    }

    pub fn data_directories(&self) -> &[PathBuf] {
        &self.data_directories
    }

    pub fn document_types(&self) -> &DocumentTypeRegistry {
        &self.types
    }

    pub fn outputs(&self) -> &OutputLayout {
        &self.outputs
    }

    pub fn subscribe(&self) -> UnboundedReceiver<CuratorEvent> {
        let (sender, receiver) = unbounded_channel();
        self.lock_subscribers().push(sender);
        receiver
    }

    /// Loads the file cache and brings everything up to date with the disk.
    pub fn open_project(&self) -> Result<()> {
        let cache = self.database.load_file_cache()?;
        {
            let mut state = self.lock_state();
            *state = CuratorState::default();
            for (path, cached) in cache {
                state.files.insert(
                    path,
                    FileStatus {
                        timestamp: cached.timestamp,
                        hash: cached.hash,
                        state: FileState::Unknown,
                        asset_guid: None,
                    },
                );
            }
            state.project_open = true;
        }
        self.publish([CuratorEvent::ProjectOpened]);
        self.check_file_system();
        Ok(())
    }

    /// Stop the processor first, running jobs would otherwise report into a closed project.
    pub fn close_project(&self) -> Result<()> {
        let saved = self.save_caches();
        {
            let mut state = self.lock_state();
            *state = CuratorState::default();
        }
        self.work_available.notify_all();
        self.publish([CuratorEvent::ProjectClosed]);
        saved
    }

    pub fn is_project_open(&self) -> bool {
        self.lock_state().project_open
    }

    /// Full pass over every data directory. Afterwards every asset has a fresh state.
    pub fn check_file_system(&self) {
        let mut state = self.lock_state();
        if !state.project_open {
            return;
        }
        if state.files.is_empty() {
            log::info!("No file hashes cached, every file gets hashed");
        }
        log::info!("Checking {} data directories", self.data_directories.len());
        for (_, status) in state.files.iter_mut() {
            status.state = FileState::Unknown;
        }

        let mut changes = Changes {
            everything: true,
            ..Default::default()
        };
        for directory in &self.data_directories {
            for found in iterate_files(directory) {
                if self.is_ignored(&found.path) {
                    continue;
                }
                self.update_file(&mut state, &found.path, Some(&found.metadata), &mut changes);
            }
        }

        // Not seen during the walk: gone, or outside of the data directories.
        let unconfirmed: Vec<PathBuf> = state
            .files
            .iter()
            .filter(|(_, status)| status.state == FileState::Unknown)
            .map(|(path, _)| path.clone())
            .collect();
        for path in unconfirmed {
            let metadata = fs::metadata(&path).ok();
            self.update_file(&mut state, &path, metadata.as_ref(), &mut changes);
        }

        self.update_states(&mut state, changes);
        if state.graph.is_empty() {
            log::warn!("No asset documents found in the data directories");
        } else {
            log::info!(
                "{} assets, {} referenced files. {}",
                state.graph.len(),
                state.files.len(),
                state.graph.transform_stats()
            );
        }
    }

    /// Snapshot of how many assets are in which state.
    pub fn get_asset_transform_stats(&self) -> TransformStats {
        self.lock_state().graph.transform_stats()
    }

    pub fn asset_info(&self, guid: AssetGuid) -> Option<AssetInfo> {
        self.lock_state().graph.get(guid).cloned()
    }

    pub fn asset_state(&self, guid: AssetGuid) -> Option<TransformState> {
        self.lock_state().graph.get(guid).map(|info| info.transform_state)
    }

    pub fn find_asset_by_path(&self, path: &Path) -> Option<AssetGuid> {
        self.lock_state().graph.guid_for_path(path)
    }

    pub fn assets(&self) -> Vec<AssetGuid> {
        let state = self.lock_state();
        let mut guids: Vec<_> = state.graph.guids().collect();
        guids.sort();
        guids
    }

    /// An asset the background processor can work on right now: it needs a transform or a
    /// thumbnail, every asset it depends on is up to date and nobody works on it already.
    pub fn next_asset_to_process(&self) -> Option<AssetGuid> {
        let state = self.lock_state();
        let next = state
            .graph
            .iter()
            .filter(|info| info.transform_state.needs_processing())
            .filter(|info| !state.in_flight.contains(&info.guid))
            .find(|info| dependencies_up_to_date(&state.graph, info))
            .map(|info| info.guid);
        next
    }

    /// Blocks until some asset might have become eligible for processing, or the timeout hits.
    pub fn wait_for_work(&self, timeout: Duration) {
        let state = self.lock_state();
        let _ = self
            .work_available
            .wait_timeout(state, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn wake_workers(&self) {
        self.work_available.notify_all();
    }

    /// Runs one transform or thumbnail job for the asset, if it needs one.
    /// Returns the state afterwards. Results of cancelled jobs are thrown away.
    pub fn process_asset(&self, guid: AssetGuid, cancel: &AtomicBool) -> Result<TransformState> {
        let (job, claim) = {
            let mut state = self.lock_state();
            let current = state
                .graph
                .get(guid)
                .ok_or(CuratorError::UnknownAsset(guid))?
                .transform_state;
            if state.in_flight.contains(&guid) {
                return Ok(current);
            }
            let evaluation = self.evaluate(&mut state, guid);
            let Some(info) = state.graph.get(guid) else {
                return Err(CuratorError::UnknownAsset(guid));
            };
            if !evaluation.state.needs_processing() || !dependencies_up_to_date(&state.graph, info) {
                return Ok(evaluation.state);
            }
            let Some(job) = self.prepare_job(&state.graph, info, &evaluation) else {
                return Ok(evaluation.state);
            };
            state.in_flight.insert(guid);
            (job, InFlight::new(self, guid))
        };

        log::debug!("Processing {} ({:?})", job.document_path.display(), job.phase);
        let result = self.run_job(&job, cancel);

        let mut state = self.lock_state();
        claim.release(&mut state);
        if cancel.load(Ordering::Relaxed) {
            log::debug!("Discarding cancelled job for {}", guid);
            return Ok(state
                .graph
                .get(guid)
                .map_or(TransformState::Unknown, |info| info.transform_state));
        }

        let failure = match result {
            Ok(TransformOutcome::Transformed) => None,
            Ok(TransformOutcome::NeedsImport) => Some(RecordedFailure {
                phase: job.phase,
                hash: job.hash,
                state: TransformState::NeedsImport,
                message: Some("the source changed, the asset needs to be imported again".into()),
            }),
            Err(err) => {
                log::error!("Processing {} failed: {:#}", job.document_path.display(), err);
                Some(RecordedFailure {
                    phase: job.phase,
                    hash: job.hash,
                    state: TransformState::TransformError,
                    message: Some(format!("{:#}", err)),
                })
            }
        };
        let Some(info) = state.graph.get_mut(guid) else {
            // Removed while the job was running.
            return Err(CuratorError::UnknownAsset(guid));
        };
        info.recorded_failure = failure;

        self.update_states(
            &mut state,
            Changes {
                assets: vec![guid],
                ..Default::default()
            },
        );
        Ok(state
            .graph
            .get(guid)
            .map_or(TransformState::Unknown, |info| info.transform_state))
    }

    /// Transforms the asset right away, its asset dependencies first.
    pub fn transform_asset(&self, guid: AssetGuid) -> Result<TransformState> {
        let cancel = AtomicBool::new(false);
        self.transform_recursive(guid, &cancel, &mut HashSet::new())
    }

    fn transform_recursive(
        &self,
        guid: AssetGuid,
        cancel: &AtomicBool,
        visited: &mut HashSet<AssetGuid>,
    ) -> Result<TransformState> {
        let dependencies: Vec<AssetGuid> = {
            let state = self.lock_state();
            let info = state.graph.get(guid).ok_or(CuratorError::UnknownAsset(guid))?;
            if !visited.insert(guid) {
                return Ok(info.transform_state);
            }
            info.asset_dependencies()
                .filter(|dependency| state.graph.contains(*dependency))
                .collect()
        };
        for dependency in dependencies {
            self.transform_recursive(dependency, cancel, visited)?;
        }

        // Transform, then thumbnail.
        let mut current = self.process_asset(guid, cancel)?;
        while current.needs_processing() {
            let next = self.process_asset(guid, cancel)?;
            if next == current {
                break;
            }
            current = next;
        }
        Ok(current)
    }

    /// Writes the file hashes, so that unchanged files don't get hashed again after a restart.
    pub fn save_caches(&self) -> Result<()> {
        let state = self.lock_state();
        if !state.project_open {
            return Ok(());
        }
        let entries: Vec<(&Path, CachedFileStatus)> = state
            .files
            .iter()
            .filter(|(_, status)| status.state == FileState::Valid)
            .map(|(path, status)| {
                (
                    path.as_path(),
                    CachedFileStatus {
                        timestamp: status.timestamp,
                        hash: status.hash,
                    },
                )
            })
            .collect();
        log::debug!("Saving {} cached file hashes", entries.len());
        self.database.store_file_cache(entries)
    }

    fn lock_state(&self) -> MutexGuard<'_, CuratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<UnboundedSender<CuratorEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: impl IntoIterator<Item = CuratorEvent>) {
        let mut subscribers = self.lock_subscribers();
        for event in events {
            subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        path.starts_with(&self.target)
    }

    /// Compares one file against what is known about it.
    /// `metadata` is `None` when the file doesn't exist (anymore).
    fn update_file(
        &self,
        state: &mut CuratorState,
        path: &Path,
        metadata: Option<&fs::Metadata>,
        changes: &mut Changes,
    ) {
        let Some(metadata) = metadata.filter(|m| m.is_file()) else {
            if let Some(status) = state.files.remove(path) {
                log::debug!("File removed: {:?}", path);
                changes.files.push(path.to_path_buf());
                if let Some(guid) = status.asset_guid {
                    if state.graph.remove(guid).is_some() {
                        changes.removed.push(guid);
                    }
                }
            }
            return;
        };

        let timestamp = FileTimestamp::from_metadata(metadata);
        let modified = match state.files.get_mut(path) {
            Some(status) if status.timestamp == timestamp => {
                status.state = FileState::Valid;
                false
            }
            Some(status) => {
                status.timestamp = timestamp;
                status.hash = 0;
                status.state = FileState::Valid;
                true
            }
            None => {
                state
                    .files
                    .insert(path.to_path_buf(), FileStatus::new(timestamp, 0));
                true
            }
        };
        if modified {
            changes.files.push(path.to_path_buf());
        }

        if !self.types.is_asset_document(path) {
            return;
        }
        let loaded = state
            .graph
            .guid_for_path(path)
            .is_some_and(|guid| state.graph.get(guid).is_some_and(|info| info.document_error.is_none()));
        if modified || !loaded {
            self.load_document(state, path, changes);
        }
    }

    fn load_document(&self, state: &mut CuratorState, path: &Path, changes: &mut Changes) {
        let previous_guid = state.graph.guid_for_path(path);
        let document = match AssetDocument::read(path) {
            Ok(document) => document,
            Err(err) => {
                log::warn!("Failed to read asset document {:?}: {}", path, err);
                if let Some(info) = previous_guid.and_then(|guid| state.graph.get_mut(guid)) {
                    info.document_error = Some(format!("{:#}", anyhow::Error::from(err)));
                    changes.assets.push(info.guid);
                }
                return;
            }
        };

        let guid = document.guid();
        if let Some(existing) = state.graph.get(guid) {
            if existing.path != path {
                log::error!(
                    "Asset document {:?} has the same GUID {} as {:?}, ignoring it",
                    path,
                    guid,
                    existing.path
                );
                return;
            }
        }
        if let Some(old_guid) = previous_guid.filter(|old| *old != guid) {
            state.graph.remove(old_guid);
            changes.removed.push(old_guid);
        }

        let data_directory = find_data_directory(path, &self.data_directories)
            .or_else(|| path.parent())
            .unwrap_or(Path::new(""));
        let mut info = AssetInfo::new(path.to_path_buf(), document, data_directory);
        match state.graph.get(guid) {
            Some(previous) => {
                info.transform_state = previous.transform_state;
                info.recorded_failure = previous.recorded_failure.clone();
            }
            None => changes.added.push(guid),
        }
        state.graph.insert(info);
        if let Some(status) = state.files.get_mut(path) {
            status.asset_guid = Some(guid);
        }
        changes.assets.push(guid);
    }

    fn evaluate(&self, state: &mut CuratorState, guid: AssetGuid) -> Evaluation {
        let CuratorState { files, graph, .. } = state;
        let mut evaluator = StateEvaluator::new(graph, files, &self.types, &self.outputs);
        let evaluation = evaluator.evaluate(guid);
        let results = evaluator.into_results();
        let events = apply_evaluations(graph, results);
        self.publish(events);
        evaluation
    }

    /// Re-evaluates everything the changes could have touched and sends out the events.
    fn update_states(&self, state: &mut CuratorState, changes: Changes) {
        let CuratorState { files, graph, .. } = state;
        let affected: BTreeSet<AssetGuid> = if changes.everything {
            graph.guids().collect()
        } else {
            graph.affected_assets(
                changes.assets.iter().chain(&changes.removed).copied(),
                &changes.files,
            )
        };

        let mut events: Vec<CuratorEvent> = changes
            .removed
            .iter()
            .filter(|guid| !graph.contains(**guid))
            .map(|guid| CuratorEvent::AssetRemoved(*guid))
            .collect();
        events.extend(changes.added.iter().map(|guid| CuratorEvent::AssetAdded(*guid)));

        if !affected.is_empty() {
            let mut evaluator = StateEvaluator::new(graph, files, &self.types, &self.outputs);
            for guid in &affected {
                evaluator.evaluate(*guid);
            }
            let results = evaluator.into_results();
            events.extend(apply_evaluations(graph, results));
        }

        if events.iter().any(|event| {
            matches!(event, CuratorEvent::AssetUpdated { state, .. } if state.needs_processing())
        }) {
            self.work_available.notify_all();
        }
        self.publish(events);
    }

    fn prepare_job(
        &self,
        graph: &DependencyGraph,
        info: &AssetInfo,
        evaluation: &Evaluation,
    ) -> Option<Job> {
        let document_type = self.types.get(&info.asset_type)?.clone();
        let (phase, hash, output) = if evaluation.state == TransformState::NeedsTransform {
            (
                ProcessPhase::Transform,
                evaluation.transform_hash,
                self.outputs
                    .output_path(info.guid, document_type.output_extension()),
            )
        } else {
            (
                ProcessPhase::Thumbnail,
                evaluation.thumbnail_hash,
                self.outputs.thumbnail_path(info.guid),
            )
        };
        let file_dependencies = info
            .transform_dependencies
            .iter()
            .filter_map(|dependency| match dependency {
                AssetDependency::File(path) => Some(path.clone()),
                AssetDependency::Asset(_) => None,
            })
            .collect();
        let asset_outputs = info
            .asset_dependencies()
            .filter_map(|dependency| {
                let dependency_info = graph.get(dependency)?;
                let dependency_type = self.types.get(&dependency_info.asset_type)?;
                Some((
                    dependency,
                    self.outputs
                        .output_path(dependency, dependency_type.output_extension()),
                ))
            })
            .collect();
        Some(Job {
            guid: info.guid,
            phase,
            document_type,
            document: info.document.clone(),
            document_path: info.path.clone(),
            file_dependencies,
            asset_outputs,
            hash,
            output,
        })
    }

    /// Writes header and payload to a temporary file next to the output, and moves it
    /// into place once the plugin succeeded.
    fn run_job(&self, job: &Job, cancel: &AtomicBool) -> anyhow::Result<TransformOutcome> {
        let temp_path = job.output.with_extension("tmp");
        let temp = TempFile::new(temp_path);
        let file = fs::File::create(temp.path())
            .with_context(|| format!("failed to create {:?}", temp.path()))?;
        let mut writer = BufWriter::new(file);
        AssetFileHeader::new(job.hash, job.document_type.type_version()).write(&mut writer)?;

        let context = TransformContext::new(
            job.guid,
            &job.document_path,
            &job.document,
            &job.file_dependencies,
            &job.asset_outputs,
            cancel,
        );
        let outcome = match job.phase {
            ProcessPhase::Transform => job.document_type.transform(&context, &mut writer)?,
            ProcessPhase::Thumbnail => {
                job.document_type.create_thumbnail(&context, &mut writer)?;
                TransformOutcome::Transformed
            }
        };
        if outcome != TransformOutcome::Transformed || context.is_cancelled() {
            return Ok(outcome);
        }

        writer.flush()?;
        drop(writer);
        temp.persist(&job.output)
            .with_context(|| format!("failed to write {:?}", job.output))?;
        Ok(outcome)
    }
}

impl FileChangeReceiver for AssetCurator {
    fn is_file_known(&self, path: &Path) -> bool {
        self.lock_state().files.contains(path)
    }

    fn notify_of_file_change(&self, path: &Path) {
        self.handle_single_file(path);
    }

    /// Idempotent: a second call without a change on disk changes nothing.
    fn handle_single_file(&self, path: &Path) {
        let path = &normalize_path(path);
        if self.is_ignored(path) {
            return;
        }
        let mut state = self.lock_state();
        if !state.project_open {
            return;
        }
        let metadata = fs::metadata(path).ok();
        let mut changes = Changes::default();
        self.update_file(&mut state, path, metadata.as_ref(), &mut changes);
        self.update_states(&mut state, changes);
    }

    fn known_files_in_folder(&self, folder: &Path) -> BTreeSet<PathBuf> {
        self.lock_state().files.files_in_folder(folder)
    }

    fn iterate_data_directory(&self, folder: &Path, known_files: &mut BTreeSet<PathBuf>) {
        let found = iterate_files(folder);
        let mut state = self.lock_state();
        if !state.project_open {
            return;
        }
        let mut changes = Changes::default();
        for file in found {
            known_files.remove(&file.path);
            if self.is_ignored(&file.path) {
                continue;
            }
            self.update_file(&mut state, &file.path, Some(&file.metadata), &mut changes);
        }
        self.update_states(&mut state, changes);
    }
}

fn dependencies_up_to_date(graph: &DependencyGraph, info: &AssetInfo) -> bool {
    info.asset_dependencies().all(|dependency| {
        graph
            .get(dependency)
            .is_some_and(|dependency| dependency.transform_state == TransformState::UpToDate)
    })
}

/// Stores the results in the graph. Returns an event for every state that changed.
fn apply_evaluations(
    graph: &mut DependencyGraph,
    results: impl IntoIterator<Item = (AssetGuid, Evaluation)>,
) -> Vec<CuratorEvent> {
    let mut events = Vec::new();
    for (guid, evaluation) in results {
        let Some(info) = graph.get_mut(guid) else {
            continue;
        };
        let failure_still_applies = info.recorded_failure.as_ref().is_some_and(|failure| match failure.phase {
            ProcessPhase::Transform => failure.hash == evaluation.transform_hash,
            ProcessPhase::Thumbnail => failure.hash == evaluation.thumbnail_hash,
        });
        if !failure_still_applies {
            info.recorded_failure = None;
        }

        info.transform_hash = evaluation.transform_hash;
        info.thumbnail_hash = evaluation.thumbnail_hash;
        info.last_error = evaluation.error;
        if info.transform_state != evaluation.state {
            log::debug!(
                "{} {:?}: {} -> {}",
                guid,
                info.path,
                info.transform_state,
                evaluation.state
            );
            info.transform_state = evaluation.state;
            events.push(CuratorEvent::AssetUpdated {
                guid,
                state: evaluation.state,
            });
        }
    }
    events
}

/// Marks an asset as being worked on until released, or until the job unwinds.
struct InFlight<'a> {
    curator: &'a AssetCurator,
    guid: AssetGuid,
    released: bool,
}

impl<'a> InFlight<'a> {
    fn new(curator: &'a AssetCurator, guid: AssetGuid) -> Self {
        Self {
            curator,
            guid,
            released: false,
        }
    }

    fn release(mut self, state: &mut CuratorState) {
        state.in_flight.remove(&self.guid);
        self.released = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.curator.lock_state().in_flight.remove(&self.guid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Concat;

    impl AssetDocumentType for Concat {
        fn asset_type(&self) -> &str {
            "Copy"
        }
        fn document_extension(&self) -> &str {
            "copy_asset"
        }
        fn output_extension(&self) -> &str {
            "bin"
        }
        fn transform(
            &self,
            context: &TransformContext<'_>,
            output: &mut dyn Write,
        ) -> anyhow::Result<TransformOutcome> {
            for path in context.file_dependencies {
                output.write_all(&fs::read(path)?)?;
            }
            if context.document.properties["fail"].as_bool() == Some(true) {
                anyhow::bail!("asked to fail");
            }
            Ok(TransformOutcome::Transformed)
        }
    }

    fn project() -> (tempfile::TempDir, AssetCurator) {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let config = AssetsConfig {
            data_directories: vec![data.to_string_lossy().into_owned()],
            target: dir.path().join("target"),
            ..Default::default()
        };
        let curator = AssetCurator::new(config, DocumentTypeRegistry::new().with_type(Concat)).unwrap();
        curator.open_project().unwrap();
        (dir, curator)
    }

    fn data_dir(curator: &AssetCurator) -> PathBuf {
        curator.data_directories()[0].clone()
    }

    fn write_asset(curator: &AssetCurator, name: &str, dependencies: &[String]) -> AssetGuid {
        let mut document = AssetDocument::new("Copy");
        document.transform_dependencies = dependencies.to_vec();
        let path = data_dir(curator).join(name);
        document.write(&path).unwrap();
        curator.handle_single_file(&path);
        document.guid()
    }

    #[test]
    fn handling_a_file_twice_changes_nothing() {
        let (_dir, curator) = project();
        fs::write(data_dir(&curator).join("a.txt"), "a").unwrap();
        let guid = write_asset(&curator, "a.copy_asset", &["a.txt".into()]);
        let mut events = curator.subscribe();

        let path = data_dir(&curator).join("a.copy_asset");
        let before = curator.asset_info(guid).unwrap();
        curator.handle_single_file(&path);
        let after = curator.asset_info(guid).unwrap();
        assert_eq!(before.transform_state, after.transform_state);
        assert_eq!(before.transform_hash, after.transform_hash);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn transform_writes_output_with_header() {
        let (_dir, curator) = project();
        fs::write(data_dir(&curator).join("a.txt"), "payload").unwrap();
        let guid = write_asset(&curator, "a.copy_asset", &["a.txt".into()]);
        assert_eq!(curator.asset_state(guid), Some(TransformState::NeedsTransform));
        assert_eq!(curator.next_asset_to_process(), Some(guid));

        assert_eq!(curator.transform_asset(guid).unwrap(), TransformState::UpToDate);
        let output = fs::read(curator.outputs().output_path(guid, "bin")).unwrap();
        let header = AssetFileHeader::read(&mut output.as_slice()).unwrap();
        assert!(header.matches(curator.asset_info(guid).unwrap().transform_hash, 1));
        assert!(output.ends_with(b"payload"));
        assert_eq!(curator.next_asset_to_process(), None);
    }

    #[test]
    fn dependencies_are_transformed_first() {
        let (_dir, curator) = project();
        let base = write_asset(&curator, "base.copy_asset", &[]);
        let user = write_asset(&curator, "user.copy_asset", &[base.to_string()]);
        assert_eq!(curator.next_asset_to_process(), Some(base));

        assert_eq!(curator.transform_asset(user).unwrap(), TransformState::UpToDate);
        assert_eq!(curator.asset_state(base), Some(TransformState::UpToDate));
    }

    #[test]
    fn failed_transform_is_not_retried() {
        let (_dir, curator) = project();
        let mut document = AssetDocument::new("Copy");
        document.properties = serde_json::json!({ "fail": true });
        let path = data_dir(&curator).join("broken.copy_asset");
        document.write(&path).unwrap();
        curator.handle_single_file(&path);
        let guid = document.guid();

        assert_eq!(curator.transform_asset(guid).unwrap(), TransformState::TransformError);
        let info = curator.asset_info(guid).unwrap();
        assert!(info.last_error.unwrap().contains("asked to fail"));
        assert!(!curator.outputs().output_path(guid, "bin").exists());
        assert_eq!(curator.next_asset_to_process(), None);

        curator.check_file_system();
        assert_eq!(curator.asset_state(guid), Some(TransformState::TransformError));
    }

    #[test]
    fn cancelled_jobs_leave_no_output() {
        let (_dir, curator) = project();
        let guid = write_asset(&curator, "a.copy_asset", &[]);
        let cancel = AtomicBool::new(true);
        assert_eq!(
            curator.process_asset(guid, &cancel).unwrap(),
            TransformState::NeedsTransform
        );
        assert!(!curator.outputs().output_path(guid, "bin").exists());
    }

    #[test]
    fn deleting_a_document_removes_the_asset() {
        let (_dir, curator) = project();
        let guid = write_asset(&curator, "a.copy_asset", &[]);
        let user = write_asset(&curator, "user.copy_asset", &[guid.to_string()]);
        let mut events = curator.subscribe();

        let path = data_dir(&curator).join("a.copy_asset");
        fs::remove_file(&path).unwrap();
        curator.handle_single_file(&path);

        assert!(curator.asset_info(guid).is_none());
        assert!(!curator.is_file_known(&path));
        assert_eq!(
            curator.asset_state(user),
            Some(TransformState::MissingTransformDependency)
        );
        assert_eq!(events.try_recv().unwrap(), CuratorEvent::AssetRemoved(guid));
        assert_eq!(
            events.try_recv().unwrap(),
            CuratorEvent::AssetUpdated {
                guid: user,
                state: TransformState::MissingTransformDependency
            }
        );
    }

    #[test]
    fn unreadable_document_is_a_transform_error() {
        let (_dir, curator) = project();
        let guid = write_asset(&curator, "a.copy_asset", &[]);
        let path = data_dir(&curator).join("a.copy_asset");
        fs::write(&path, "{ broken").unwrap();
        // Some file systems only have second resolution.
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(10))
            .unwrap();
        curator.handle_single_file(&path);
        assert_eq!(curator.asset_state(guid), Some(TransformState::TransformError));
    }

    #[test]
    fn dependency_spelled_with_dots_follows_the_file() {
        let (_dir, curator) = project();
        let source = data_dir(&curator).join("rock.txt");
        fs::create_dir_all(data_dir(&curator).join("sub")).unwrap();
        fs::write(&source, "old").unwrap();
        let guid = write_asset(&curator, "rock.copy_asset", &["sub/../rock.txt".into()]);
        assert_eq!(curator.transform_asset(guid).unwrap(), TransformState::UpToDate);
        assert_eq!(curator.lock_state().files.len(), 2);

        fs::write(&source, "newer").unwrap();
        let file = fs::File::options().write(true).open(&source).unwrap();
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(10))
            .unwrap();
        curator.notify_of_file_change(&source);
        assert_eq!(curator.asset_state(guid), Some(TransformState::NeedsTransform));

        assert_eq!(curator.transform_asset(guid).unwrap(), TransformState::UpToDate);
        let output = fs::read(curator.outputs().output_path(guid, "bin")).unwrap();
        assert!(output.ends_with(b"newer"));
    }

    #[test]
    fn file_hashes_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("a.txt"), "a").unwrap();
        let config = AssetsConfig {
            data_directories: vec![data.to_string_lossy().into_owned()],
            target: dir.path().join("target"),
            ..Default::default()
        };
        let path = fs::canonicalize(data.join("a.txt")).unwrap();
        let mut document = AssetDocument::new("Copy");
        document.transform_dependencies.push("a.txt".into());
        document.write(&data.join("a.copy_asset")).unwrap();

        let hash = {
            let curator = AssetCurator::new(config.clone(), DocumentTypeRegistry::new().with_type(Concat)).unwrap();
            curator.open_project().unwrap();
            let hash = curator.lock_state().files.get(&path).unwrap().hash;
            curator.close_project().unwrap();
            hash
        };
        assert_ne!(hash, 0);

        let curator = AssetCurator::new(config, DocumentTypeRegistry::new().with_type(Concat)).unwrap();
        let cache = curator.database.load_file_cache().unwrap();
        assert_eq!(cache.get(&path).map(|status| status.hash), Some(hash));
    }
}
