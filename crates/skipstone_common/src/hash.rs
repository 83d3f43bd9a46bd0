//! Content digests for configuration fingerprints and state-file naming.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use xxhash_rust::xxh3::Xxh3;

/// A 128-bit content digest computed using XXH3.
///
/// Two byte streams with the same `Digest` are assumed to be identical. The
/// engine uses digests to summarize builder configurations and to derive
/// collision-free state-file names from output directories and builder ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest([u8; 16]);

impl Digest {
    /// Computes a digest of a byte slice in one shot.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(data);
        Self(hash.to_le_bytes())
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the digest as an owned byte vector, the form the engine
    /// persists as a configuration fingerprint.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// A streaming digest accumulator with chainable update methods.
///
/// Drivers fold whatever parameters influence their output into a digester
/// and commit the result as the build's configuration fingerprint:
///
/// ```
/// use skipstone_common::Digester;
///
/// let digest = Digester::new()
///     .string("target=es2017")
///     .bytes(&[1, 0, 3])
///     .finish();
/// assert_eq!(digest, Digester::new().string("target=es2017").bytes(&[1, 0, 3]).finish());
/// ```
#[derive(Default)]
pub struct Digester {
    inner: Xxh3,
}

impl Digester {
    /// Creates an empty digester.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds raw bytes into the digest.
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.inner.update(data);
        self
    }

    /// Folds a string into the digest, length-prefixed so that adjacent
    /// strings cannot alias each other.
    pub fn string(mut self, value: &str) -> Self {
        self.inner.update(&(value.len() as u64).to_le_bytes());
        self.inner.update(value.as_bytes());
        self
    }

    /// Folds a path into the digest by its textual form.
    pub fn path(self, value: &Path) -> Self {
        self.string(&value.to_string_lossy())
    }

    /// Folds the content of a file into the digest.
    pub fn file(mut self, path: &Path) -> io::Result<Self> {
        let content = std::fs::read(path)?;
        self.inner.update(&content);
        Ok(self)
    }

    /// Finalizes the accumulated state into a digest.
    pub fn finish(self) -> Digest {
        Digest(self.inner.digest128().to_le_bytes())
    }
}
