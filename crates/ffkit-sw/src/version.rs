//! Deployed version and the cache bucket it owns.

use serde::{Deserialize, Serialize};

/// The version this agent was built for.
///
/// Serializes as `{ "version": ..., "isCritical": ... }`, the reply shape of
/// `GET_VERSION`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Version string, e.g. `2.1.0`.
    pub version: String,
    /// Pages must force a reload when this version activates.
    pub is_critical: bool,
}

impl VersionInfo {
    /// Create version info.
    pub fn new(version: impl Into<String>, is_critical: bool) -> Self {
        Self {
            version: version.into(),
            is_critical,
        }
    }

    /// Version injected at build time.
    ///
    /// Reads `FFKIT_APP_VERSION` and `FFKIT_CRITICAL_UPDATE` from the build
    /// environment, falling back to the crate version and `false`.
    pub fn from_build() -> Self {
        let version = option_env!("FFKIT_APP_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
        let is_critical = option_env!("FFKIT_CRITICAL_UPDATE")
            .map(parse_flag)
            .unwrap_or(false);
        Self::new(version, is_critical)
    }

    /// Name of the bucket this version reads and writes.
    pub fn cache_name(&self, app_name: &str) -> String {
        format!("{}v{}", cache_prefix(app_name), self.version)
    }
}

/// Prefix shared by every bucket of `app_name`, across versions.
pub fn cache_prefix(app_name: &str) -> String {
    format!("{}-", app_name)
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
