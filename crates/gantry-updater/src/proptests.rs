//! Property-based tests for gantry-updater.
//!
//! # Properties Tested
//!
//! - Artifact structural check: only files led by the ZIP signature pass
//! - Artifact digest check: the correct digest passes, any other fails
//! - Version decision: exact policy is plain string inequality
//! - Version decision: semver policy only accepts strictly newer versions

#![cfg(test)]

use proptest::prelude::*;
use semver::Version;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::artifact::{ArtifactVerifier, VerificationFailure, VerificationResult, ZIP_MAGIC};
use crate::config::VersionPolicy;
use crate::manifest::{decide, UpdateDecision, VersionManifest};

// =============================================================================
// Generators
// =============================================================================

/// Random artifact content (1 byte to 4KB).
fn arb_content() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..4096)
}

/// Random non-empty content that does not start with the ZIP signature.
fn arb_non_zip_content() -> impl Strategy<Value = Vec<u8>> {
    arb_content().prop_filter("must not carry the ZIP signature", |bytes| {
        !bytes.starts_with(&ZIP_MAGIC)
    })
}

fn arb_version() -> impl Strategy<Value = Version> {
    (0u64..50, 0u64..50, 0u64..50).prop_map(|(major, minor, patch)| Version::new(major, minor, patch))
}

fn arb_version_string() -> impl Strategy<Value = String> {
    "[0-9a-z.\\-]{1,12}"
}

// =============================================================================
// Helpers
// =============================================================================

fn verify_bytes(content: &[u8], verifier: ArtifactVerifier) -> VerificationResult {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("update.zip");
    std::fs::write(&path, content).unwrap();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(verifier.verify(&path))
}

fn manifest(version: String) -> VersionManifest {
    VersionManifest {
        version,
        download_url: "https://example.com/update.zip".to_string(),
        sha256: None,
    }
}

// =============================================================================
// Artifact verification
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any file that does not begin with `50 4B 03 04` is rejected as a bad
    /// signature, whatever else it contains.
    #[test]
    fn prop_non_zip_rejected(content in arb_non_zip_content()) {
        let result = verify_bytes(&content, ArtifactVerifier::new());
        prop_assert_eq!(result, VerificationResult::Invalid(VerificationFailure::BadSignature));
    }

    /// Any file led by the signature passes the structural check.
    #[test]
    fn prop_zip_prefix_accepted(tail in prop::collection::vec(any::<u8>(), 0..4096)) {
        let mut content = ZIP_MAGIC.to_vec();
        content.extend_from_slice(&tail);
        let result = verify_bytes(&content, ArtifactVerifier::new());
        prop_assert!(result.is_valid());
    }

    /// The artifact's own digest is accepted.
    #[test]
    fn prop_correct_hash_accepted(tail in arb_content()) {
        let mut content = ZIP_MAGIC.to_vec();
        content.extend_from_slice(&tail);
        let digest: [u8; 32] = Sha256::digest(&content).into();

        let result = verify_bytes(&content, ArtifactVerifier::with_expected_hash(digest));
        prop_assert!(result.is_valid());
    }

    /// Any other digest is rejected.
    #[test]
    fn prop_incorrect_hash_rejected(
        tail in arb_content(),
        wrong in prop::array::uniform32(any::<u8>()),
    ) {
        let mut content = ZIP_MAGIC.to_vec();
        content.extend_from_slice(&tail);
        let digest: [u8; 32] = Sha256::digest(&content).into();
        prop_assume!(wrong != digest);

        let result = verify_bytes(&content, ArtifactVerifier::with_expected_hash(wrong));
        let is_mismatch = matches!(
            result,
            VerificationResult::Invalid(VerificationFailure::HashMismatch { .. })
        );
        prop_assert!(is_mismatch);
    }
}

// =============================================================================
// Version decision
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Exact policy: equal strings are up to date, anything else is an update.
    #[test]
    fn prop_exact_policy_is_inequality(
        latest in arb_version_string(),
        current in arb_version_string(),
    ) {
        let decision = decide(manifest(latest.clone()), &current, VersionPolicy::Exact).unwrap();
        if latest == current {
            prop_assert_eq!(decision, UpdateDecision::UpToDate);
        } else {
            prop_assert!(matches!(decision, UpdateDecision::UpdateAvailable(_)));
        }
    }

    /// Semver policy: only a strictly greater version is an update.
    #[test]
    fn prop_semver_policy_is_ordering(latest in arb_version(), current in arb_version()) {
        let decision = decide(
            manifest(latest.to_string()),
            &current.to_string(),
            VersionPolicy::Semver,
        ).unwrap();
        if latest > current {
            prop_assert!(matches!(decision, UpdateDecision::UpdateAvailable(_)));
        } else {
            prop_assert_eq!(decision, UpdateDecision::UpToDate);
        }
    }
}
