use serde::{Deserialize, Serialize};

use crate::{AssetGuid, TransformState};

/// Notifications the curator publishes to status bars, asset browsers and the like.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum CuratorEvent {
    ProjectOpened,
    ProjectClosed,
    AssetAdded(AssetGuid),
    /// Only sent when the state actually changed.
    AssetUpdated {
        guid: AssetGuid,
        state: TransformState,
    },
    AssetRemoved(AssetGuid),
}
