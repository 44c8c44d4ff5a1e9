//! The GSFA manifest file: a small header carrying the writer's metadata
//! and an informational tuple sequence.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use compactindex::MetadataBlock;

use crate::error::{GsfaError, Result};

pub const MAGIC: [u8; 8] = *b"gsfamnfs";
pub const VERSION: u64 = 3;

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub metadata: MetadataBlock,
    /// Informational `(u64, u64)` tuples; out of scope for core
    /// correctness .
    pub tuples: Vec<(u64, u64)>,
}

impl Manifest {
    pub fn new(metadata: MetadataBlock) -> Self {
        Self {
            metadata,
            tuples: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.metadata.encode());
        for &(a, b) in &self.tuples {
            out.extend_from_slice(&a.to_le_bytes());
            out.extend_from_slice(&b.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 || bytes[0..8] != MAGIC {
            return Err(GsfaError::InvalidMagic);
        }
        let version = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        if version != VERSION {
            return Err(GsfaError::UnsupportedVersion { expected: VERSION, got: version });
        }
        let (metadata, consumed) = MetadataBlock::decode(&bytes[16..])
            .map_err(|e| GsfaError::MalformedHeader(e.to_string()))?;
        let rest = &bytes[16 + consumed..];
        if rest.len() % 16 != 0 {
            return Err(GsfaError::MalformedHeader("trailing manifest tuple bytes".into()));
        }
        let mut tuples = Vec::with_capacity(rest.len() / 16);
        for chunk in rest.chunks_exact(16) {
            let a = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let b = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
            tuples.push((a, b));
        }
        Ok(Self { metadata, tuples })
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        file.write_all(&self.encode())?;
        file.flush()?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Self::decode(&bytes)
    }
}
