//! Content addressing - SHA-256 digests for compiled manifests
//!
//! The digest of the flattened manifest stream is the identity of a build:
//! identical inputs always yield the identical revision string.

use sha2::{Digest, Sha256};

pub const DIGEST_ALGORITHM: &str = "sha256";

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Digest of a manifest stream with its algorithm prefix, e.g. `sha256:ab12...`.
pub fn manifest_digest(data: &[u8]) -> String {
    format!("{DIGEST_ALGORITHM}:{}", sha256_hex(data))
}

/// Revision of a build: `version@digest`.
pub fn revision(version: &str, digest: &str) -> String {
    format!("{version}@{digest}")
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            manifest_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_deterministic() {
        let data = b"apiVersion: v1\nkind: Namespace\n";
        assert_eq!(sha256_hex(data), sha256_hex(data));
        assert_ne!(sha256_hex(data), sha256_hex(b"apiVersion: v1\n"));
    }

    #[test]
    fn test_revision_format() {
        let digest = manifest_digest(b"x");
        let rev = revision("v2.7.0", &digest);
        assert!(rev.starts_with("v2.7.0@sha256:"));
        assert_eq!(rev.len(), "v2.7.0@sha256:".len() + 64);
    }
}
