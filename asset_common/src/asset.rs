use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};
use uuid::Uuid;

/// Stable identity of an asset document.
/// Survives renames and moves, since it is stored inside the document itself.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd)]
#[serde(transparent)]
pub struct AssetGuid(Uuid);

impl AssetGuid {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Dependency strings are either paths or GUIDs, this tells them apart.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let value = value
            .strip_prefix('{')
            .and_then(|v| v.strip_suffix('}'))
            .unwrap_or(value);
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Display for AssetGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for AssetGuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_braced_and_plain() {
        let guid = AssetGuid::new_random();
        assert_eq!(AssetGuid::parse(&guid.to_string()), Some(guid));
        assert_eq!(AssetGuid::parse(&format!("{{{}}}", guid)), Some(guid));
        assert_eq!(AssetGuid::parse("textures/rock.png"), None);
    }
}
