use std::{
    path::{Path, PathBuf},
    sync::mpsc::{channel, Receiver, TryRecvError},
    time::Duration,
};

use notify_debouncer_full::{
    new_debouncer,
    notify::{
        event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
        EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    },
    DebounceEventResult, Debouncer, FileIdMap,
};

use crate::error::{CuratorError, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatcherAction {
    None,
    Added,
    Removed,
    Modified,
    RenamedOldName,
    RenamedNewName,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatcherObjectType {
    File,
    Directory,
    /// The platform didn't say, and the path is gone.
    Unknown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WatchFlags {
    pub creates: bool,
    pub deletes: bool,
    pub writes: bool,
    pub renames: bool,
    pub subdirectories: bool,
}

impl WatchFlags {
    pub const fn all() -> Self {
        Self {
            creates: true,
            deletes: true,
            writes: true,
            renames: true,
            subdirectories: true,
        }
    }

    fn allows(&self, action: WatcherAction) -> bool {
        match action {
            WatcherAction::None => false,
            WatcherAction::Added => self.creates,
            WatcherAction::Removed => self.deletes,
            WatcherAction::Modified => self.writes,
            WatcherAction::RenamedOldName | WatcherAction::RenamedNewName => self.renames,
        }
    }
}

/// Source of raw file system events for one directory.
///
/// Events may arrive coalesced or not, in bursts, and for paths that are already gone again.
pub trait DirectoryWatcher: Send {
    fn directory(&self) -> &Path;

    /// Reports every event that arrived since the last call. Never blocks.
    fn enumerate_changes(
        &mut self,
        callback: &mut dyn FnMut(&Path, WatcherAction, WatcherObjectType),
    );
}

/// [`DirectoryWatcher`] on top of the OS notification API.
pub struct NotifyDirectoryWatcher {
    directory: PathBuf,
    flags: WatchFlags,
    // Dropping the debouncer stops watching.
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
    receiver: Receiver<DebounceEventResult>,
}

const NOTIFY_DEBOUNCE: Duration = Duration::from_millis(50);

impl NotifyDirectoryWatcher {
    pub fn open(directory: &Path, flags: WatchFlags) -> Result<Self> {
        let watch_error = |source| CuratorError::Watch {
            path: directory.to_path_buf(),
            source,
        };
        let (sender, receiver) = channel();
        let mut debouncer = new_debouncer(NOTIFY_DEBOUNCE, None, sender).map_err(watch_error)?;
        let mode = if flags.subdirectories {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        debouncer
            .watcher()
            .watch(directory, mode)
            .map_err(watch_error)?;
        debouncer.cache().add_root(directory, mode);

        Ok(Self {
            directory: directory.to_path_buf(),
            flags,
            _debouncer: debouncer,
            receiver,
        })
    }
}

impl DirectoryWatcher for NotifyDirectoryWatcher {
    fn directory(&self) -> &Path {
        &self.directory
    }

    fn enumerate_changes(
        &mut self,
        callback: &mut dyn FnMut(&Path, WatcherAction, WatcherObjectType),
    ) {
        loop {
            let events = match self.receiver.try_recv() {
                Ok(Ok(events)) => events,
                Ok(Err(errors)) => {
                    for error in errors {
                        log::warn!("Watching {:?} failed: {}", self.directory, error);
                    }
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            for event in events {
                for (path, action, object_type) in classify_event(&event.kind, &event.paths) {
                    if self.flags.allows(action) {
                        callback(&path, action, object_type);
                    }
                }
            }
        }
    }
}

fn object_type_of(path: &Path) -> WatcherObjectType {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => WatcherObjectType::Directory,
        Ok(_) => WatcherObjectType::File,
        Err(_) => WatcherObjectType::Unknown,
    }
}

/// Maps one notify event to the actions the asset watcher understands.
fn classify_event(
    kind: &EventKind,
    paths: &[PathBuf],
) -> Vec<(PathBuf, WatcherAction, WatcherObjectType)> {
    let Some(first) = paths.first() else {
        return Vec::new();
    };
    let single = |action, object_type| vec![(first.clone(), action, object_type)];

    match kind {
        EventKind::Create(CreateKind::Folder) => {
            single(WatcherAction::Added, WatcherObjectType::Directory)
        }
        EventKind::Create(CreateKind::File) => single(WatcherAction::Added, WatcherObjectType::File),
        EventKind::Create(_) => single(WatcherAction::Added, object_type_of(first)),
        EventKind::Remove(RemoveKind::Folder) => {
            single(WatcherAction::Removed, WatcherObjectType::Directory)
        }
        EventKind::Remove(RemoveKind::File) => {
            single(WatcherAction::Removed, WatcherObjectType::File)
        }
        EventKind::Remove(_) => single(WatcherAction::Removed, WatcherObjectType::Unknown),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            single(WatcherAction::RenamedOldName, WatcherObjectType::Unknown)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            single(WatcherAction::RenamedNewName, object_type_of(first))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut actions = vec![(
                first.clone(),
                WatcherAction::RenamedOldName,
                WatcherObjectType::Unknown,
            )];
            if let Some(to) = paths.get(1) {
                actions.push((to.clone(), WatcherAction::RenamedNewName, object_type_of(to)));
            }
            actions
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Only one side of the rename, and the platform doesn't tell which.
            if first.exists() {
                single(WatcherAction::RenamedNewName, object_type_of(first))
            } else {
                single(WatcherAction::RenamedOldName, WatcherObjectType::Unknown)
            }
        }
        EventKind::Modify(_) => single(WatcherAction::Modified, object_type_of(first)),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}
