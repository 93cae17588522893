//! Schema of `nioh3modmanifest.json`, the optional multi-feature descriptor
//! mod authors place at the root of an archive.
//!
//! ```text
//! my_mod.zip
//! ├── nioh3modmanifest.json
//! ├── common/           <- common_files_dir, always installed
//! ├── armor_style/      <- feature directory, one sub-directory per choice
//! │   ├── Light/
//! │   └── Heavy/
//! └── skin/             <- optional feature
//!     ├── Normal/
//!     └── Wet/
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub const MANIFEST_FILENAME: &str = "nioh3modmanifest.json";

/// Highest `(major, minor)` manifest version this build understands.
pub const SUPPORTED_MANIFEST_VERSION: (u32, u32) = (1, 1);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Json(String),

    #[error("invalid mod_manager_version {0:?}, expected 'major.minor' (e.g. '1.0')")]
    BadVersion(String),

    #[error("mod_manager_version {found:?} requires a newer mod manager (supported up to {supported}.x)")]
    TooNew { found: String, supported: u32 },

    #[error("duplicate feature {field}: {value:?}")]
    DuplicateFeature { field: &'static str, value: String },

    #[error("feature {0:?} has an empty directory")]
    EmptyDirectory(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFeature {
    pub name: String,
    pub directory: String,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModManifest {
    pub mod_manager_version: String,
    #[serde(default)]
    pub mod_name: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub common_files_dir: Option<String>,
    #[serde(default)]
    pub features: Vec<ManifestFeature>,
}

impl ModManifest {
    /// Parse and validate raw manifest bytes.
    ///
    /// Directory fields are normalised to forward slashes without leading or
    /// trailing separators. A UTF-8 BOM is tolerated.
    pub fn parse(data: &[u8]) -> Result<Self, ManifestError> {
        let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
        let mut manifest: ModManifest =
            serde_json::from_slice(data).map_err(|e| ManifestError::Json(e.to_string()))?;

        manifest.check_version()?;

        manifest.common_files_dir = manifest
            .common_files_dir
            .take()
            .map(|dir| normalize_dir(&dir))
            .filter(|dir| !dir.is_empty());

        for feature in &mut manifest.features {
            feature.directory = normalize_dir(&feature.directory);
            if feature.directory.is_empty() {
                return Err(ManifestError::EmptyDirectory(feature.name.clone()));
            }
        }

        let mut names = HashSet::new();
        let mut dirs = HashSet::new();
        for feature in &manifest.features {
            if !names.insert(feature.name.as_str()) {
                return Err(ManifestError::DuplicateFeature {
                    field: "name",
                    value: feature.name.clone(),
                });
            }
            if !dirs.insert(feature.directory.as_str()) {
                return Err(ManifestError::DuplicateFeature {
                    field: "directory",
                    value: feature.directory.clone(),
                });
            }
        }

        Ok(manifest)
    }

    fn check_version(&self) -> Result<(), ManifestError> {
        let bad = || ManifestError::BadVersion(self.mod_manager_version.clone());
        let (major, minor) = self
            .mod_manager_version
            .trim()
            .split_once('.')
            .ok_or_else(bad)?;
        let major: u32 = major.parse().map_err(|_| bad())?;
        let minor: u32 = minor.parse().map_err(|_| bad())?;

        let (cur_major, cur_minor) = SUPPORTED_MANIFEST_VERSION;
        if major > cur_major {
            return Err(ManifestError::TooNew {
                found: self.mod_manager_version.clone(),
                supported: cur_major,
            });
        }
        if major == cur_major && minor > cur_minor {
            tracing::warn!(
                "Manifest version {} is newer than this build supports ({}.{}), some fields may be ignored",
                self.mod_manager_version,
                cur_major,
                cur_minor
            );
        }
        Ok(())
    }
}

fn normalize_dir(dir: &str) -> String {
    dir.replace('\\', "/").trim_matches('/').to_string()
}
