//! Version manifest parsing and the update decision.
//!
//! The manifest is a small JSON document naming the latest version and
//! where its package lives. Two shapes are accepted:
//!
//! ```json
//! { "version": "1.4.0", "downloadUrl": "https://example.com/app-1.4.0.zip" }
//! { "version": "1.4.0", "files": [{ "url": "https://example.com/app-1.4.0.zip" }] }
//! ```
//!
//! An optional `sha256` (hex) enables digest verification of the artifact.

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::VersionPolicy;
use crate::download::Downloader;
use crate::error::UpdateError;

/// Remote metadata describing the latest available version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionManifest {
    /// Version string of the latest release
    pub version: String,
    /// Absolute URL of the update package
    pub download_url: String,
    /// Expected SHA-256 of the package, hex encoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    version: Option<String>,
    download_url: Option<String>,
    #[serde(default)]
    files: Vec<RawFile>,
    sha256: Option<String>,
}

#[derive(Deserialize)]
struct RawFile {
    url: Option<String>,
    sha256: Option<String>,
}

impl VersionManifest {
    /// Parse a manifest body.
    ///
    /// Surrounding whitespace is ignored. A missing or empty `version`, or a
    /// missing download location, is a [`UpdateError::ManifestParse`].
    pub fn parse(body: &[u8]) -> Result<Self, UpdateError> {
        let text = std::str::from_utf8(body)
            .map_err(|e| UpdateError::ManifestParse(format!("body is not UTF-8: {}", e)))?;
        let raw: RawManifest = serde_json::from_str(text.trim())
            .map_err(|e| UpdateError::ManifestParse(e.to_string()))?;

        let version = raw
            .version
            .filter(|v| !v.is_empty())
            .ok_or_else(|| UpdateError::ManifestParse("missing `version`".to_string()))?;

        let first_file = raw.files.into_iter().next();
        let (download_url, file_sha) = match (raw.download_url, first_file) {
            (Some(url), _) => (url, None),
            (None, Some(RawFile { url: Some(url), sha256 })) => (url, sha256),
            _ => {
                return Err(UpdateError::ManifestParse(
                    "missing `downloadUrl` (or `files[0].url`)".to_string(),
                ))
            }
        };
        if download_url.trim().is_empty() {
            return Err(UpdateError::ManifestParse("empty download URL".to_string()));
        }

        let sha256 = raw.sha256.or(file_sha);
        if let Some(digest) = &sha256 {
            let valid = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(UpdateError::ManifestParse(format!(
                    "`sha256` must be 64 hex characters, got {:?}",
                    digest
                )));
            }
        }

        Ok(Self {
            version,
            download_url,
            sha256,
        })
    }

    /// Expected artifact digest as raw bytes, if the manifest carries one.
    pub fn sha256_bytes(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(self.sha256.as_ref()?).ok()?;
        bytes.try_into().ok()
    }
}

/// Outcome of comparing a manifest with the running application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    UpToDate,
    UpdateAvailable(VersionManifest),
}

/// Decide whether `manifest` is an update for `current_version`.
pub fn decide(
    manifest: VersionManifest,
    current_version: &str,
    policy: VersionPolicy,
) -> Result<UpdateDecision, UpdateError> {
    let is_update = match policy {
        VersionPolicy::Exact => manifest.version != current_version,
        VersionPolicy::Semver => {
            let latest = Version::parse(manifest.version.trim_start_matches('v'))?;
            let current = Version::parse(current_version.trim_start_matches('v'))?;
            latest > current
        }
    };

    if is_update {
        Ok(UpdateDecision::UpdateAvailable(manifest))
    } else {
        Ok(UpdateDecision::UpToDate)
    }
}

/// Fetches the manifest and decides whether an update applies.
pub struct VersionChecker {
    manifest_url: String,
    current_version: String,
    policy: VersionPolicy,
}

impl VersionChecker {
    pub fn new(manifest_url: String, current_version: String, policy: VersionPolicy) -> Self {
        Self {
            manifest_url,
            current_version,
            policy,
        }
    }

    pub fn manifest_url(&self) -> &str {
        &self.manifest_url
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Fetch the manifest and compare it with the running version.
    ///
    /// Follows at most one redirect hop. Non-2xx statuses fail before the
    /// body is read.
    pub async fn check(&self, downloader: &Downloader) -> Result<UpdateDecision, UpdateError> {
        debug!("Fetching manifest from: {}", self.manifest_url);
        let body = downloader.fetch(&self.manifest_url).await?;
        let manifest = VersionManifest::parse(&body).map_err(|e| {
            debug!("Raw manifest body: {}", String::from_utf8_lossy(&body));
            e
        })?;

        let decision = decide(manifest, &self.current_version, self.policy)?;
        match &decision {
            UpdateDecision::UpToDate => info!(
                "No update available (current: {})",
                self.current_version
            ),
            UpdateDecision::UpdateAvailable(m) => info!(
                "Update available: {} -> {}",
                self.current_version, m.version
            ),
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(version: &str) -> VersionManifest {
        VersionManifest {
            version: version.to_string(),
            download_url: "https://example.com/update.zip".to_string(),
            sha256: None,
        }
    }

    #[test]
    fn test_parse_download_url_shape() {
        let body = b"  {\"version\": \"1.2.0\", \"downloadUrl\": \"https://example.com/a.zip\"}\n";
        let m = VersionManifest::parse(body).unwrap();
        assert_eq!(m.version, "1.2.0");
        assert_eq!(m.download_url, "https://example.com/a.zip");
        assert!(m.sha256.is_none());
    }

    #[test]
    fn test_parse_files_shape() {
        let body = br#"{"version": "2.0.0", "files": [{"url": "https://example.com/b.zip"}, {"url": "https://example.com/c.zip"}]}"#;
        let m = VersionManifest::parse(body).unwrap();
        assert_eq!(m.download_url, "https://example.com/b.zip");
    }

    #[test]
    fn test_parse_rejects_missing_keys() {
        assert!(matches!(
            VersionManifest::parse(br#"{"downloadUrl": "https://example.com/a.zip"}"#),
            Err(UpdateError::ManifestParse(_))
        ));
        assert!(matches!(
            VersionManifest::parse(br#"{"version": "1.0.0"}"#),
            Err(UpdateError::ManifestParse(_))
        ));
        assert!(matches!(
            VersionManifest::parse(br#"{"version": "", "downloadUrl": "x"}"#),
            Err(UpdateError::ManifestParse(_))
        ));
        assert!(matches!(
            VersionManifest::parse(b"<html>quota exceeded</html>"),
            Err(UpdateError::ManifestParse(_))
        ));
        assert!(matches!(
            VersionManifest::parse(br#"{"version": 3, "downloadUrl": "x"}"#),
            Err(UpdateError::ManifestParse(_))
        ));
    }

    #[test]
    fn test_parse_sha256() {
        let digest = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let body = format!(
            r#"{{"version": "1.0.1", "downloadUrl": "https://example.com/a.zip", "sha256": "{}"}}"#,
            digest
        );
        let m = VersionManifest::parse(body.as_bytes()).unwrap();
        assert_eq!(m.sha256.as_deref(), Some(digest));
        assert_eq!(m.sha256_bytes().unwrap()[0], 0xe3);

        let bad = br#"{"version": "1.0.1", "downloadUrl": "x", "sha256": "abc"}"#;
        assert!(VersionManifest::parse(bad).is_err());
    }

    #[test]
    fn test_exact_policy() {
        assert_eq!(
            decide(manifest("1.0.0"), "1.0.0", VersionPolicy::Exact).unwrap(),
            UpdateDecision::UpToDate
        );
        // Exact inequality: an older server version still counts as an update.
        assert!(matches!(
            decide(manifest("0.9.0"), "1.0.0", VersionPolicy::Exact).unwrap(),
            UpdateDecision::UpdateAvailable(_)
        ));
    }

    #[test]
    fn test_exact_policy_compares_version_verbatim() {
        let body = br#"{"version": " 1.0.0", "downloadUrl": "https://example.com/a.zip"}"#;
        let m = VersionManifest::parse(body).unwrap();
        assert_eq!(m.version, " 1.0.0");
        assert!(matches!(
            decide(m, "1.0.0", VersionPolicy::Exact).unwrap(),
            UpdateDecision::UpdateAvailable(_)
        ));
    }

    #[test]
    fn test_semver_policy() {
        assert_eq!(
            decide(manifest("0.9.0"), "1.0.0", VersionPolicy::Semver).unwrap(),
            UpdateDecision::UpToDate
        );
        assert!(matches!(
            decide(manifest("v1.10.0"), "1.9.0", VersionPolicy::Semver).unwrap(),
            UpdateDecision::UpdateAvailable(_)
        ));
        assert!(matches!(
            decide(manifest("latest"), "1.0.0", VersionPolicy::Semver),
            Err(UpdateError::ManifestParse(_))
        ));
    }
}
