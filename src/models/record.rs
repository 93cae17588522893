use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::archive::Backend;

/// Schema version written to the authoritative state file.
pub const STATE_SCHEMA_VERSION: u32 = 2;

/// Prefix of Yumia payload paths inside `installed_files`.
pub const PACKAGE_PREFIX: &str = "package/";

/// The user's choice inside an archive, stored so that the same option set
/// can be reproduced later (migration, backfill, reinstall).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    /// A single radio option of a legacy Yumia or single-option loose archive.
    Variant { name: String },
    /// Checkbox components of a direct loose archive (common files implied).
    Components { names: Vec<String> },
    /// Manifest feature name → chosen sub-directory, `None` for a skipped optional feature.
    Features { choices: IndexMap<String, Option<String>> },
}

impl Selection {
    pub fn variant(name: impl Into<String>) -> Self {
        Selection::Variant { name: name.into() }
    }
}

/// One persisted install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledMod {
    pub mod_id: String,
    pub backend: Backend,
    pub source_archive_path: Utf8PathBuf,
    pub selected_options: Selection,
    /// Human-readable option summary, also the legacy manifest's `option_name`.
    pub option_summary: String,
    /// Game-root-relative paths actually written (`package/…` or `mods/<dir>/…`).
    pub installed_files: Vec<String>,
    /// Manager-owned folder (`mods/<dir>`) for loose installs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loose_mod_dir: Option<String>,
    /// SHA-256 of each written file, keyed like `installed_files`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_digests: BTreeMap<String, String>,
    pub installed_at: DateTime<Utc>,
}

impl InstalledMod {
    pub fn archive_filename(&self) -> &str {
        self.source_archive_path
            .file_name()
            .unwrap_or(self.mod_id.as_str())
    }

    /// `installed_files` in the legacy manifest's format (package-relative).
    pub fn legacy_files(&self) -> Vec<String> {
        self.installed_files
            .iter()
            .map(|path| strip_package_prefix(path).to_string())
            .collect()
    }
}

pub fn strip_package_prefix(path: &str) -> &str {
    path.strip_prefix(PACKAGE_PREFIX).unwrap_or(path)
}

/// Authoritative store: every install, both backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageState {
    pub version: u32,
    #[serde(default)]
    pub records: IndexMap<String, InstalledMod>,
}

impl Default for PackageState {
    fn default() -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            records: IndexMap::new(),
        }
    }
}

impl PackageState {
    pub fn get(&self, mod_id: &str) -> Option<&InstalledMod> {
        self.records.get(mod_id)
    }

    pub fn contains(&self, mod_id: &str) -> bool {
        self.records.contains_key(mod_id)
    }

    pub fn by_backend(&self, backend: Backend) -> impl Iterator<Item = &InstalledMod> {
        self.records.values().filter(move |rec| rec.backend == backend)
    }

    pub fn has_backend(&self, backend: Backend) -> bool {
        self.by_backend(backend).next().is_some()
    }

    pub fn insert(&mut self, record: InstalledMod) {
        self.records.insert(record.mod_id.clone(), record);
    }

    pub fn remove(&mut self, mod_id: &str) -> Option<InstalledMod> {
        self.records.shift_remove(mod_id)
    }
}

/// Reduced Yumia-only record kept in the downloads folder for older builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub archive_filename: String,
    pub option_name: String,
    #[serde(default)]
    pub installed_files: Vec<String>,
}

/// The legacy file is a bare `mod_id → record` object.
pub type LegacyState = IndexMap<String, LegacyRecord>;

/// Project the Yumia subset of `state` into the legacy format.
pub fn legacy_projection(state: &PackageState) -> LegacyState {
    state
        .by_backend(Backend::Yumia)
        .map(|rec| {
            (
                rec.mod_id.clone(),
                LegacyRecord {
                    archive_filename: rec.archive_filename().to_string(),
                    option_name: rec.option_summary.clone(),
                    installed_files: rec.legacy_files(),
                },
            )
        })
        .collect()
}
