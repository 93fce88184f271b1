use std::{fs, io, path::Path, time::SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// The default Hash implementation still works, since we still uphold [the important property](https://doc.rust-lang.org/std/hash/trait.Hash.html#hash-and-eq).
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Hash)]
pub enum FileTimestamp {
    /// Remember that filesystem timestamps are not reliable.
    /// For example, if you copy a file, the timestamp will be the same.
    /// So it's possible for a user to copy an old file around, and then
    /// the curator is going to see a timestamp that's clearly in the past.
    ///
    /// So we shouldn't ever check for an ordering, instead we check for equality!
    Timestamp(SystemTime),

    /// Always un-equal to any other timestamp.
    Unknown,
}

impl FileTimestamp {
    pub fn new(timestamp: SystemTime) -> Self {
        Self::Timestamp(timestamp)
    }

    pub fn unknown() -> Self {
        Self::Unknown
    }

    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        metadata
            .modified()
            .map(Self::new)
            .unwrap_or_else(|_| Self::unknown())
    }
}

impl PartialEq for FileTimestamp {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Timestamp(l0), Self::Timestamp(r0)) => l0 == r0,
            (Self::Unknown, _) => false,
            (_, Self::Unknown) => false,
        }
    }
}

impl Eq for FileTimestamp {}

/// Stable 64 bit content hash. Persisted in the file cache and in output headers,
/// so it must not change between runs or compiler versions.
pub fn hash_file(path: &Path) -> io::Result<u64> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(finish_hash(hasher))
}

/// Combines hashes in the order they are fed in.
#[derive(Clone, Default)]
pub struct HashCombiner {
    hasher: Sha256,
}

impl HashCombiner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn add_str(&mut self, value: &str) -> &mut Self {
        self.add_u64(value.len() as u64);
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn finish(self) -> u64 {
        finish_hash(self.hasher)
    }
}

fn finish_hash(hasher: Sha256) -> u64 {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    // Zero is reserved for "no hash".
    u64::from_le_bytes(bytes).max(1)
}
