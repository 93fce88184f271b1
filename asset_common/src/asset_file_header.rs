use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAGIC: [u8; 4] = *b"ASTH";

/// Prefix of every transformed output and thumbnail file.
/// Resource loaders and the curator compare `asset_hash` against the hash of the
/// inputs to decide whether the file is still current.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssetFileHeader {
    magic: [u8; 4],
    pub asset_hash: u64,
    pub version: u16,
}

#[derive(Debug, Error)]
pub enum AssetFileHeaderError {
    #[error("failed to read or write asset file header")]
    Codec(#[from] bincode::Error),
    #[error("not an asset file")]
    BadMagic,
}

impl AssetFileHeader {
    pub fn new(asset_hash: u64, version: u16) -> Self {
        Self {
            magic: MAGIC,
            asset_hash,
            version,
        }
    }

    pub fn write(&self, writer: &mut impl Write) -> Result<(), AssetFileHeaderError> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn read(reader: &mut impl Read) -> Result<Self, AssetFileHeaderError> {
        let header: AssetFileHeader = bincode::deserialize_from(reader)?;
        if header.magic != MAGIC {
            return Err(AssetFileHeaderError::BadMagic);
        }
        Ok(header)
    }

    /// Hash and version equality. A header from a different type version never matches.
    pub fn matches(&self, asset_hash: u64, version: u16) -> bool {
        self.asset_hash == asset_hash && self.version == version
    }
}
