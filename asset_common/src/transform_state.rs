use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// How up to date an asset is with respect to its inputs and outputs.
/// Every known asset is in exactly one of these states.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, Hash, PartialEq)]
pub enum TransformState {
    /// Not evaluated yet.
    Unknown,
    /// The transform refused to run until the document is re-imported from its source.
    NeedsImport,
    NeedsTransform,
    /// Output is current, only the thumbnail is stale.
    NeedsThumbnail,
    UpToDate,
    MissingTransformDependency,
    MissingThumbnailDependency,
    CircularDependency,
    TransformError,
}

impl TransformState {
    pub const COUNT: usize = 9;

    pub const ALL: [TransformState; Self::COUNT] = [
        TransformState::Unknown,
        TransformState::NeedsImport,
        TransformState::NeedsTransform,
        TransformState::NeedsThumbnail,
        TransformState::UpToDate,
        TransformState::MissingTransformDependency,
        TransformState::MissingThumbnailDependency,
        TransformState::CircularDependency,
        TransformState::TransformError,
    ];

    pub const fn index(self) -> usize {
        match self {
            TransformState::Unknown => 0,
            TransformState::NeedsImport => 1,
            TransformState::NeedsTransform => 2,
            TransformState::NeedsThumbnail => 3,
            TransformState::UpToDate => 4,
            TransformState::MissingTransformDependency => 5,
            TransformState::MissingThumbnailDependency => 6,
            TransformState::CircularDependency => 7,
            TransformState::TransformError => 8,
        }
    }

    /// States that stay put until a file or the user changes something.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            TransformState::NeedsImport
                | TransformState::MissingTransformDependency
                | TransformState::MissingThumbnailDependency
                | TransformState::CircularDependency
                | TransformState::TransformError
        )
    }

    /// States the background processor can make progress on.
    pub fn needs_processing(self) -> bool {
        matches!(
            self,
            TransformState::NeedsTransform | TransformState::NeedsThumbnail
        )
    }
}

impl Display for TransformState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransformState::Unknown => "Unknown",
            TransformState::NeedsImport => "Needs Import",
            TransformState::NeedsTransform => "Needs Transform",
            TransformState::NeedsThumbnail => "Needs Thumbnail",
            TransformState::UpToDate => "Up To Date",
            TransformState::MissingTransformDependency => "Missing Transform Dependency",
            TransformState::MissingThumbnailDependency => "Missing Thumbnail Dependency",
            TransformState::CircularDependency => "Circular Dependency",
            TransformState::TransformError => "Transform Error",
        };
        f.write_str(name)
    }
}

/// Number of assets per [`TransformState`], as shown by progress widgets.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TransformStats {
    counts: [usize; TransformState::COUNT],
}

impl TransformStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, state: TransformState) {
        self.counts[state.index()] += 1;
    }

    pub fn get(&self, state: TransformState) -> usize {
        self.counts[state.index()]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Assets that still have pending work or are stuck.
    pub fn remaining(&self) -> usize {
        self.total() - self.get(TransformState::UpToDate)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TransformState, usize)> + '_ {
        TransformState::ALL
            .iter()
            .map(move |state| (*state, self.get(*state)))
    }
}

impl FromIterator<TransformState> for TransformStats {
    fn from_iter<I: IntoIterator<Item = TransformState>>(iter: I) -> Self {
        let mut stats = TransformStats::new();
        for state in iter {
            stats.add(state);
        }
        stats
    }
}

impl Display for TransformStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (state, count) in self.iter().filter(|(_, count)| *count > 0) {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}: {}", state, count)?;
        }
        if first {
            f.write_str("no assets")?;
        }
        Ok(())
    }
}
