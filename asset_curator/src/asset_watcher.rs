use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crate::{
    assets_config::AssetsConfig,
    directory_watcher::{
        DirectoryWatcher, NotifyDirectoryWatcher, WatchFlags, WatcherAction, WatcherObjectType,
    },
    task_pool::{TaskGroup, TaskPool},
};

/// What the watcher needs from whoever keeps track of the files.
pub trait FileChangeReceiver: Send + Sync {
    fn is_file_known(&self, path: &Path) -> bool;

    /// A single file changed, appeared or vanished.
    fn notify_of_file_change(&self, path: &Path);

    /// Re-evaluates one file against the disk.
    fn handle_single_file(&self, path: &Path);

    /// Snapshot of the known files below `folder`.
    fn known_files_in_folder(&self, folder: &Path) -> BTreeSet<PathBuf>;

    /// Walks `folder` on disk, handles every file found and removes it from `known_files`.
    fn iterate_data_directory(&self, folder: &Path, known_files: &mut BTreeSet<PathBuf>);
}

/// A change that waits a few ticks before it is acted upon.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingUpdate {
    pub path: PathBuf,
    pub frames_remaining: u32,
}

#[derive(Default)]
struct PendingUpdates {
    files: Vec<PendingUpdate>,
    directories: Vec<PendingUpdate>,
}

struct WatcherShared {
    receiver: Arc<dyn FileChangeReceiver>,
    frame_delay: u32,
    watchers: Mutex<Vec<Box<dyn DirectoryWatcher>>>,
    pending: Mutex<PendingUpdates>,
    shutting_down: AtomicBool,
}

/// Turns bursts of raw file system events into a calm stream of "look at this path again".
///
/// Editors tend to write a file several times per save, and renames of folders arrive as a
/// pile of unrelated looking events. Every change therefore waits `frame_delay` ticks, and
/// a change to the same path restarts the wait.
pub struct AssetWatcher {
    shared: Arc<WatcherShared>,
    pool: TaskPool,
    watch_task: TaskGroup,
    update_tasks: TaskGroup,
    is_shut_down: bool,
}

impl AssetWatcher {
    /// Watches every data directory of the config. Directories that can't be watched are
    /// logged and skipped, changes in there go unnoticed until the next full check.
    pub fn from_config(
        receiver: Arc<dyn FileChangeReceiver>,
        config: &AssetsConfig,
        pool: TaskPool,
    ) -> Self {
        Self::new(
            receiver,
            &config.resolve_data_directories(),
            config.frame_delay,
            pool,
        )
    }

    pub fn new(
        receiver: Arc<dyn FileChangeReceiver>,
        data_directories: &[PathBuf],
        frame_delay: u32,
        pool: TaskPool,
    ) -> Self {
        let mut watchers: Vec<Box<dyn DirectoryWatcher>> = Vec::new();
        for directory in data_directories {
            match NotifyDirectoryWatcher::open(directory, WatchFlags::all()) {
                Ok(watcher) => {
                    log::info!("Watching data directory {:?}", directory);
                    watchers.push(Box::new(watcher));
                }
                Err(err) => log::error!("Failed to watch data directory {:?}: {}", directory, err),
            }
        }
        Self::with_watchers(receiver, watchers, frame_delay, pool)
    }

    pub fn with_watchers(
        receiver: Arc<dyn FileChangeReceiver>,
        watchers: Vec<Box<dyn DirectoryWatcher>>,
        frame_delay: u32,
        pool: TaskPool,
    ) -> Self {
        Self {
            shared: Arc::new(WatcherShared {
                receiver,
                frame_delay,
                watchers: Mutex::new(watchers),
                pending: Mutex::new(PendingUpdates::default()),
                shutting_down: AtomicBool::new(false),
            }),
            pool,
            watch_task: TaskGroup::new(),
            update_tasks: TaskGroup::new(),
            is_shut_down: false,
        }
    }

    /// Call once per frame. Never blocks, it only starts tasks and counts down.
    pub fn main_thread_tick(&self) {
        let shutting_down = self.shared.shutting_down.load(Ordering::Acquire);

        if !shutting_down && self.watch_task.is_finished() {
            let shared = self.shared.clone();
            self.pool
                .spawn(&self.watch_task, move || shared.poll_watchers());
        }

        let (files_due, directories_due) = {
            let mut pending = self.shared.lock_pending();
            let files_due = count_down(&mut pending.files);
            let directories_due = count_down(&mut pending.directories);
            (files_due, directories_due)
        };

        if shutting_down {
            return;
        }
        if !files_due.is_empty() {
            let receiver = self.shared.receiver.clone();
            self.pool.spawn(&self.update_tasks, move || {
                for file in files_due {
                    receiver.notify_of_file_change(&file);
                }
            });
        }
        for directory in directories_due {
            let receiver = self.shared.receiver.clone();
            self.pool.spawn(&self.update_tasks, move || {
                rescan_directory(receiver.as_ref(), &directory)
            });
        }
    }

    /// Classifies one raw event. Usually called from the polling task.
    pub fn handle_watcher_change(
        &self,
        path: &Path,
        action: WatcherAction,
        object_type: WatcherObjectType,
    ) {
        self.shared.handle_watcher_change(path, action, object_type);
    }

    pub fn pending_file_updates(&self) -> Vec<PendingUpdate> {
        self.shared.lock_pending().files.clone()
    }

    pub fn pending_directory_updates(&self) -> Vec<PendingUpdate> {
        self.shared.lock_pending().directories.clone()
    }

    /// Nothing queued and no background work in flight.
    pub fn is_idle(&self) -> bool {
        let pending = self.shared.lock_pending();
        pending.files.is_empty()
            && pending.directories.is_empty()
            && self.watch_task.is_finished()
            && self.update_tasks.is_finished()
    }

    /// Blocks until all background work of the watcher is done.
    /// Pending updates that haven't fired yet are dropped.
    pub fn shutdown(&mut self) {
        if self.is_shut_down {
            return;
        }
        self.shared.shutting_down.store(true, Ordering::Release);

        self.watch_task.wait();
        self.shared
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        self.update_tasks.wait();
        debug_assert!(
            self.update_tasks.is_finished(),
            "all file and directory updates should have drained by shutdown"
        );
        self.is_shut_down = true;
    }
}

impl Drop for AssetWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WatcherShared {
    fn lock_pending(&self) -> MutexGuard<'_, PendingUpdates> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_watchers(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for watcher in watchers.iter_mut() {
            watcher.enumerate_changes(&mut |path, action, object_type| {
                self.handle_watcher_change(path, action, object_type)
            });
        }
    }

    fn handle_watcher_change(
        &self,
        path: &Path,
        action: WatcherAction,
        object_type: WatcherObjectType,
    ) {
        match action {
            WatcherAction::None => {}
            WatcherAction::Added => match fs::metadata(path) {
                Ok(metadata) if metadata.is_dir() => self.queue_directory_update(path),
                Ok(_) => self.queue_file_update(path),
                Err(err) => log::debug!("Dropping add event for {:?}: {}", path, err),
            },
            WatcherAction::Removed => {
                // The event doesn't reliably say whether a file or a folder went away.
                if self.receiver.is_file_known(path) {
                    self.queue_file_update(path);
                } else {
                    self.queue_directory_update(path);
                }
            }
            WatcherAction::Modified => match object_type {
                // Folder modifications carry no information we could use.
                WatcherObjectType::Directory => {}
                WatcherObjectType::File | WatcherObjectType::Unknown => {
                    self.queue_file_update(path)
                }
            },
            // The matching new name event does the work.
            WatcherAction::RenamedOldName => {}
            WatcherAction::RenamedNewName => {
                // A rename may have moved a whole subtree, rescan the surroundings.
                if let Some(parent) = path.parent() {
                    self.queue_directory_update(parent);
                }
            }
        }
    }

    fn queue_file_update(&self, path: &Path) {
        let mut pending = self.lock_pending();
        match pending.files.iter_mut().find(|u| u.path == path) {
            Some(update) => update.frames_remaining = self.frame_delay,
            None => pending.files.push(PendingUpdate {
                path: path.to_path_buf(),
                frames_remaining: self.frame_delay,
            }),
        }
    }

    fn queue_directory_update(&self, path: &Path) {
        let mut pending = self.lock_pending();
        if let Some(covering) = pending
            .directories
            .iter_mut()
            .find(|u| path.starts_with(&u.path))
        {
            covering.frames_remaining = self.frame_delay;
            return;
        }
        // The new update covers these.
        pending.directories.retain(|u| !u.path.starts_with(path));
        pending.directories.push(PendingUpdate {
            path: path.to_path_buf(),
            frames_remaining: self.frame_delay,
        });
    }
}

/// Removes the updates whose delay ran out and returns their paths.
fn count_down(updates: &mut Vec<PendingUpdate>) -> Vec<PathBuf> {
    let mut due = Vec::new();
    updates.retain_mut(|update| {
        update.frames_remaining = update.frames_remaining.saturating_sub(1);
        if update.frames_remaining == 0 {
            due.push(update.path.clone());
            false
        } else {
            true
        }
    });
    due
}

/// Reconciles the known files of one folder with the disk.
/// Doesn't try to interpret the events that led here, it just diffs.
fn rescan_directory(receiver: &dyn FileChangeReceiver, folder: &Path) {
    log::debug!("Rescanning {:?}", folder);
    let mut known_files = receiver.known_files_in_folder(folder);
    receiver.iterate_data_directory(folder, &mut known_files);
    for removed in known_files {
        receiver.handle_single_file(&removed);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use super::*;

    const DELAY: u32 = 3;

    /// Records what the watcher asks for, and pretends the disk contains `on_disk`.
    #[derive(Default)]
    struct RecordingReceiver {
        known: Mutex<BTreeSet<PathBuf>>,
        on_disk: Mutex<HashSet<PathBuf>>,
        notified: Mutex<Vec<PathBuf>>,
        handled: Mutex<Vec<PathBuf>>,
        /// Holds notifications back while set, for at most two seconds.
        slow: AtomicBool,
    }

    impl RecordingReceiver {
        fn notified(&self) -> Vec<PathBuf> {
            self.notified.lock().unwrap().clone()
        }
        fn handled(&self) -> Vec<PathBuf> {
            self.handled.lock().unwrap().clone()
        }
    }

    impl FileChangeReceiver for RecordingReceiver {
        fn is_file_known(&self, path: &Path) -> bool {
            self.known.lock().unwrap().contains(path)
        }
        fn notify_of_file_change(&self, path: &Path) {
            let started = std::time::Instant::now();
            while self.slow.load(Ordering::Acquire) && started.elapsed() < Duration::from_secs(2) {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.notified.lock().unwrap().push(path.to_path_buf());
        }
        fn handle_single_file(&self, path: &Path) {
            self.handled.lock().unwrap().push(path.to_path_buf());
            let exists = self.on_disk.lock().unwrap().contains(path);
            let mut known = self.known.lock().unwrap();
            if exists {
                known.insert(path.to_path_buf());
            } else {
                known.remove(path);
            }
        }
        fn known_files_in_folder(&self, folder: &Path) -> BTreeSet<PathBuf> {
            self.known
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.starts_with(folder))
                .cloned()
                .collect()
        }
        fn iterate_data_directory(&self, folder: &Path, known_files: &mut BTreeSet<PathBuf>) {
            let found: Vec<PathBuf> = self
                .on_disk
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.starts_with(folder))
                .cloned()
                .collect();
            for path in found {
                self.handle_single_file(&path);
                known_files.remove(&path);
            }
        }
    }

    /// Hands out a scripted list of events on the first poll.
    struct ScriptedWatcher {
        directory: PathBuf,
        events: Arc<Mutex<Vec<(PathBuf, WatcherAction, WatcherObjectType)>>>,
    }

    impl DirectoryWatcher for ScriptedWatcher {
        fn directory(&self) -> &Path {
            &self.directory
        }
        fn enumerate_changes(
            &mut self,
            callback: &mut dyn FnMut(&Path, WatcherAction, WatcherObjectType),
        ) {
            for (path, action, object_type) in self.events.lock().unwrap().drain(..) {
                callback(&path, action, object_type);
            }
        }
    }

    fn watcher(
        runtime: &tokio::runtime::Runtime,
        receiver: Arc<RecordingReceiver>,
    ) -> AssetWatcher {
        AssetWatcher::with_watchers(
            receiver,
            Vec::new(),
            DELAY,
            TaskPool::new(runtime.handle().clone()),
        )
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition never became true");
    }

    #[test]
    fn repeated_modifications_collapse_into_one_notification() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        let watcher = watcher(&runtime, receiver.clone());
        let path = PathBuf::from("/proj/textures/a.png");

        watcher.handle_watcher_change(&path, WatcherAction::Modified, WatcherObjectType::File);
        watcher.main_thread_tick();
        watcher.main_thread_tick();
        for _ in 0..5 {
            watcher.handle_watcher_change(&path, WatcherAction::Modified, WatcherObjectType::File);
        }
        assert_eq!(
            watcher.pending_file_updates(),
            vec![PendingUpdate {
                path: path.clone(),
                frames_remaining: DELAY
            }]
        );

        for _ in 0..DELAY - 1 {
            watcher.main_thread_tick();
        }
        assert!(receiver.notified().is_empty());
        watcher.main_thread_tick();
        wait_until(|| watcher.update_tasks.is_finished());
        assert_eq!(receiver.notified(), vec![path]);
        watcher.main_thread_tick();
        wait_until(|| watcher.update_tasks.is_finished());
        assert_eq!(receiver.notified().len(), 1);
        assert!(watcher.pending_file_updates().is_empty());
    }

    #[test]
    fn tick_leaves_file_notifications_to_the_pool() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        receiver.slow.store(true, Ordering::Release);
        let mut watcher = AssetWatcher::with_watchers(
            receiver.clone(),
            Vec::new(),
            1,
            TaskPool::new(runtime.handle().clone()),
        );
        let path = PathBuf::from("/proj/big.bin");
        watcher.handle_watcher_change(&path, WatcherAction::Modified, WatcherObjectType::File);

        watcher.main_thread_tick();
        assert!(watcher.pending_file_updates().is_empty());
        assert!(receiver.notified().is_empty());
        assert!(!watcher.is_idle());

        receiver.slow.store(false, Ordering::Release);
        wait_until(|| receiver.notified() == vec![path.clone()]);
        watcher.shutdown();
        assert!(watcher.is_idle());
    }

    #[test]
    fn nested_directory_updates_merge_into_the_ancestor() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        let watcher = watcher(&runtime, receiver);

        // Unknown paths that were removed are treated as folders.
        watcher.handle_watcher_change(
            Path::new("/a/b"),
            WatcherAction::Removed,
            WatcherObjectType::Unknown,
        );
        watcher.main_thread_tick();
        assert_eq!(watcher.pending_directory_updates()[0].frames_remaining, DELAY - 1);

        watcher.handle_watcher_change(
            Path::new("/a/b/c"),
            WatcherAction::Removed,
            WatcherObjectType::Unknown,
        );
        assert_eq!(
            watcher.pending_directory_updates(),
            vec![PendingUpdate {
                path: PathBuf::from("/a/b"),
                frames_remaining: DELAY
            }]
        );

        // An ancestor swallows pending descendants.
        watcher.handle_watcher_change(
            Path::new("/a"),
            WatcherAction::Removed,
            WatcherObjectType::Unknown,
        );
        let pending = watcher.pending_directory_updates();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].path, PathBuf::from("/a"));

        // Siblings with a common string prefix are separate folders.
        watcher.handle_watcher_change(
            Path::new("/ab"),
            WatcherAction::Removed,
            WatcherObjectType::Unknown,
        );
        assert_eq!(watcher.pending_directory_updates().len(), 2);
    }

    #[test]
    fn removal_of_a_known_file_is_a_file_update() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        let known = PathBuf::from("/proj/a.png");
        receiver.known.lock().unwrap().insert(known.clone());
        let watcher = watcher(&runtime, receiver);

        watcher.handle_watcher_change(&known, WatcherAction::Removed, WatcherObjectType::Unknown);
        assert_eq!(watcher.pending_file_updates().len(), 1);
        assert!(watcher.pending_directory_updates().is_empty());
    }

    #[test]
    fn directory_modifications_and_old_names_are_ignored() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        let watcher = watcher(&runtime, receiver);

        watcher.handle_watcher_change(
            Path::new("/proj/textures"),
            WatcherAction::Modified,
            WatcherObjectType::Directory,
        );
        watcher.handle_watcher_change(
            Path::new("/proj/textures/a.png"),
            WatcherAction::RenamedOldName,
            WatcherObjectType::Unknown,
        );
        assert!(watcher.pending_file_updates().is_empty());
        assert!(watcher.pending_directory_updates().is_empty());
    }

    #[test]
    fn added_paths_are_classified_by_stat() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.png");
        let folder = dir.path().join("sub");
        fs::write(&file, "png").unwrap();
        fs::create_dir(&folder).unwrap();

        let receiver = Arc::new(RecordingReceiver::default());
        let watcher = watcher(&runtime, receiver);
        watcher.handle_watcher_change(&file, WatcherAction::Added, WatcherObjectType::Unknown);
        watcher.handle_watcher_change(&folder, WatcherAction::Added, WatcherObjectType::Unknown);
        // Gone before we got to look at it.
        watcher.handle_watcher_change(
            &dir.path().join("vanished.png"),
            WatcherAction::Added,
            WatcherObjectType::File,
        );

        assert_eq!(watcher.pending_file_updates().len(), 1);
        assert_eq!(watcher.pending_file_updates()[0].path, file);
        assert_eq!(watcher.pending_directory_updates().len(), 1);
        assert_eq!(watcher.pending_directory_updates()[0].path, folder);
    }

    #[test]
    fn rename_rescans_the_parent_folder() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        let old = PathBuf::from("/proj/textures/a.png");
        let new = PathBuf::from("/proj/textures/b.png");
        receiver.known.lock().unwrap().insert(old.clone());
        receiver.on_disk.lock().unwrap().insert(new.clone());

        let events = Arc::new(Mutex::new(vec![
            (old.clone(), WatcherAction::RenamedOldName, WatcherObjectType::Unknown),
            (new.clone(), WatcherAction::RenamedNewName, WatcherObjectType::File),
        ]));
        let mut watcher = AssetWatcher::with_watchers(
            receiver.clone(),
            vec![Box::new(ScriptedWatcher {
                directory: PathBuf::from("/proj"),
                events: events.clone(),
            })],
            DELAY,
            TaskPool::new(runtime.handle().clone()),
        );

        watcher.main_thread_tick();
        wait_until(|| events.lock().unwrap().is_empty() && watcher.watch_task.is_finished());
        assert_eq!(
            watcher.pending_directory_updates(),
            vec![PendingUpdate {
                path: PathBuf::from("/proj/textures"),
                frames_remaining: DELAY
            }]
        );

        for _ in 0..DELAY {
            watcher.main_thread_tick();
        }
        wait_until(|| watcher.update_tasks.is_finished());
        watcher.shutdown();

        let handled = receiver.handled();
        assert!(handled.contains(&new));
        assert!(handled.contains(&old));
        let known = receiver.known.lock().unwrap().clone();
        assert_eq!(known, BTreeSet::from([new]));
    }

    #[test]
    fn shutdown_stops_spawning_rescans() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        receiver
            .known
            .lock()
            .unwrap()
            .insert(PathBuf::from("/proj/a/x.png"));
        let mut watcher = watcher(&runtime, receiver.clone());

        watcher.handle_watcher_change(
            Path::new("/proj/a"),
            WatcherAction::Removed,
            WatcherObjectType::Directory,
        );
        watcher.shutdown();
        for _ in 0..DELAY {
            watcher.main_thread_tick();
        }
        assert!(receiver.handled().is_empty());
        assert!(watcher.update_tasks.is_finished());
    }
}
