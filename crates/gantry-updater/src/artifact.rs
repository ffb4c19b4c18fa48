//! Artifact verification.
//!
//! A downloaded package must pass these checks before anything touches the
//! install directory:
//!
//! 1. The file exists and is not empty.
//! 2. It starts with the ZIP local-file-header magic `50 4B 03 04`, which
//!    rejects truncated files and HTML error pages served in place of the
//!    package.
//! 3. When the manifest names a SHA-256 digest, the file's digest matches it
//!    (constant-time comparison).
//!
//! Only [`ArtifactVerifier::verify`] can produce a [`VerifiedArtifact`], and
//! the install strategies only accept that type.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::error::UpdateError;

/// ZIP local file header signature.
pub const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

/// Reason an artifact was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    /// Missing or zero-byte file
    #[error("artifact is missing or empty")]
    Empty,
    /// Leading bytes are not the archive signature
    #[error("artifact does not start with the ZIP signature")]
    BadSignature,
    /// Digest differs from the manifest
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

/// Proof that a file passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedArtifact {
    path: PathBuf,
    size: u64,
}

impl VerifiedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Result of verifying one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Valid(VerifiedArtifact),
    Invalid(VerificationFailure),
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Convert into a `Result`, turning a rejection into an error.
    pub fn into_result(self) -> Result<VerifiedArtifact, UpdateError> {
        match self {
            Self::Valid(artifact) => Ok(artifact),
            Self::Invalid(failure) => Err(UpdateError::Verification(failure)),
        }
    }
}

/// Verifies downloaded artifacts for structural integrity and, optionally,
/// their digest.
#[derive(Debug, Clone, Default)]
pub struct ArtifactVerifier {
    expected_sha256: Option<[u8; 32]>,
}

impl ArtifactVerifier {
    /// Create a verifier performing only the structural checks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Additionally require the artifact's SHA-256 to equal `digest`.
    pub fn with_expected_hash(digest: [u8; 32]) -> Self {
        Self {
            expected_sha256: Some(digest),
        }
    }

    /// Verify the artifact at `path`.
    ///
    /// Read errors (including a missing file) count as [`VerificationFailure::Empty`].
    pub async fn verify(&self, path: &Path) -> VerificationResult {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            Ok(_) | Err(_) => {
                tracing::error!(path = %path.display(), "Artifact is missing or empty");
                return VerificationResult::Invalid(VerificationFailure::Empty);
            }
        };

        let mut header = [0u8; 4];
        let header_ok = match read_prefix(path, &mut header).await {
            Ok(n) => n == header.len() && header == ZIP_MAGIC,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to read artifact header");
                return VerificationResult::Invalid(VerificationFailure::Empty);
            }
        };
        if !header_ok {
            tracing::error!(
                path = %path.display(),
                header = %hex::encode(header),
                "Artifact signature mismatch"
            );
            return VerificationResult::Invalid(VerificationFailure::BadSignature);
        }

        if let Some(expected) = &self.expected_sha256 {
            let actual = match compute_hash(path).await {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to hash artifact");
                    return VerificationResult::Invalid(VerificationFailure::Empty);
                }
            };
            if actual.ct_eq(expected).unwrap_u8() != 1 {
                tracing::error!(
                    expected = %hex::encode(expected),
                    actual = %hex::encode(actual),
                    path = %path.display(),
                    "Artifact hash mismatch"
                );
                return VerificationResult::Invalid(VerificationFailure::HashMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
            tracing::debug!(hash = %hex::encode(actual), "Artifact hash verified");
        }

        tracing::info!(path = %path.display(), size, "Artifact verification complete");
        VerificationResult::Valid(VerifiedArtifact {
            path: path.to_path_buf(),
            size,
        })
    }
}

/// Read up to `buf.len()` bytes from the start of the file.
async fn read_prefix(path: &Path, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Compute the SHA-256 hash of a file.
pub async fn compute_hash(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().into())
}
