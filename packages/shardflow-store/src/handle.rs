//! Opaque, content-addressed artifact handles

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Opaque handle to an immutable artifact.
///
/// Identity is the SHA-256 digest of the artifact's bytes, so writing the
/// same content twice yields the same handle. The size is carried along for
/// cheap accounting without touching the object on disk.
///
/// # Examples
///
/// ```rust
/// use shardflow_store::ArtifactHandle;
///
/// let handle: ArtifactHandle = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855/0"
///     .parse()
///     .unwrap();
/// assert_eq!(handle.size(), 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
    hash: String,
    size: u64,
}

impl ArtifactHandle {
    pub(crate) fn new(hash: String, size: u64) -> Self {
        Self { hash, size }
    }

    /// Hex-encoded SHA-256 digest of the artifact content
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Artifact size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}/{}", self.hash, self.size)
    }
}

impl FromStr for ArtifactHandle {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("sha256:")
            .ok_or_else(|| StoreError::corrupt(format!("Malformed handle: {}", s)))?;

        let (hash, size) = rest
            .split_once('/')
            .ok_or_else(|| StoreError::corrupt(format!("Malformed handle: {}", s)))?;

        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StoreError::corrupt(format!("Malformed handle digest: {}", s)));
        }

        let size = size
            .parse::<u64>()
            .map_err(|_| StoreError::corrupt(format!("Malformed handle size: {}", s)))?;

        Ok(Self {
            hash: hash.to_ascii_lowercase(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_handle_display_roundtrip() {
        let handle = ArtifactHandle::new(EMPTY_SHA256.to_string(), 0);
        let s = handle.to_string();
        let parsed: ArtifactHandle = s.parse().unwrap();
        assert_eq!(parsed, handle);
    }

    #[test]
    fn test_handle_rejects_missing_prefix() {
        let result = format!("{}/0", EMPTY_SHA256).parse::<ArtifactHandle>();
        assert!(result.is_err());
    }

    #[test]
    fn test_handle_rejects_short_digest() {
        let result = "sha256:abc123/10".parse::<ArtifactHandle>();
        assert!(result.is_err());
    }

    #[test]
    fn test_handle_rejects_bad_size() {
        let result = format!("sha256:{}/ten", EMPTY_SHA256).parse::<ArtifactHandle>();
        assert!(result.is_err());
    }

    #[test]
    fn test_handle_serde_roundtrip() {
        let handle = ArtifactHandle::new(EMPTY_SHA256.to_string(), 42);
        let json = serde_json::to_string(&handle).unwrap();
        let back: ArtifactHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
    }
}
