//! Persistence of install records.
//!
//! Two files describe the same logical store:
//!
//! - `<package_dir>/.nioh3_modmanager_state.json`: authoritative, both backends
//! - `<downloads>/.nioh3_modmanager_manifest.json`: legacy, Yumia records only
//!
//! The legacy file is only ever written by [`StateStore::save`] through a
//! single projection, and only read to backfill a missing authoritative file.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use crate::models::{
    ArchiveLayout, Backend, InstalledMod, LegacyState, PACKAGE_PREFIX, PackageState,
    STATE_SCHEMA_VERSION, Selection, legacy_projection,
};

use super::classifier::is_sidecar;
use super::convert::sha256_hex;
use super::selection;

pub const STATE_FILENAME: &str = ".nioh3_modmanager_state.json";
pub const LEGACY_FILENAME: &str = ".nioh3_modmanager_manifest.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} has unsupported state version {found:?} (expected {STATE_SCHEMA_VERSION})")]
    UnsupportedVersion { path: Utf8PathBuf, found: Option<u64> },
}

#[derive(Deserialize)]
struct VersionProbe {
    version: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: Utf8PathBuf,
    legacy_path: Utf8PathBuf,
}

impl StateStore {
    pub fn new(package_dir: &Utf8Path, mods_dir: &Utf8Path) -> Self {
        Self {
            state_path: package_dir.join(STATE_FILENAME),
            legacy_path: mods_dir.join(LEGACY_FILENAME),
        }
    }

    pub fn state_path(&self) -> &Utf8Path {
        &self.state_path
    }

    pub fn legacy_path(&self) -> &Utf8Path {
        &self.legacy_path
    }

    /// Load the authoritative file, `None` when it does not exist yet.
    pub fn load(&self) -> Result<Option<PackageState>, StoreError> {
        let data = match fs::read(&self.state_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.state_path.clone(),
                    source,
                });
            }
        };

        let parse_err = |source| StoreError::Parse {
            path: self.state_path.clone(),
            source,
        };
        let probe: VersionProbe = serde_json::from_slice(&data).map_err(parse_err)?;
        if probe.version != Some(u64::from(STATE_SCHEMA_VERSION)) {
            return Err(StoreError::UnsupportedVersion {
                path: self.state_path.clone(),
                found: probe.version,
            });
        }

        let state: PackageState = serde_json::from_slice(&data).map_err(parse_err)?;
        tracing::info!("Loaded install state: {} mod(s) recorded", state.records.len());
        Ok(Some(state))
    }

    /// Load the legacy file. Unreadable content is logged and treated as empty.
    pub fn load_legacy(&self) -> LegacyState {
        let data = match fs::read(&self.legacy_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return LegacyState::new(),
            Err(e) => {
                tracing::warn!("Could not read legacy manifest {}: {}", self.legacy_path, e);
                return LegacyState::new();
            }
        };
        match serde_json::from_slice(&data) {
            Ok(legacy) => legacy,
            Err(e) => {
                tracing::warn!("Could not parse legacy manifest {}: {}", self.legacy_path, e);
                LegacyState::new()
            }
        }
    }

    /// Write the authoritative file, then bring the legacy file in line.
    pub fn save(&self, state: &PackageState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Parse {
            path: self.state_path.clone(),
            source,
        })?;
        write_atomic(&self.state_path, &json)?;
        self.sync_legacy(state)
    }

    /// The only place the legacy file is written.
    fn sync_legacy(&self, state: &PackageState) -> Result<(), StoreError> {
        let legacy = legacy_projection(state);
        if legacy.is_empty() {
            return match fs::remove_file(&self.legacy_path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(StoreError::Io {
                    path: self.legacy_path.clone(),
                    source: e,
                }),
                _ => Ok(()),
            };
        }
        let json = serde_json::to_vec_pretty(&legacy).map_err(|source| StoreError::Parse {
            path: self.legacy_path.clone(),
            source,
        })?;
        write_atomic(&self.legacy_path, &json)
    }
}

fn write_atomic(path: &Utf8Path, data: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_owned(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

/// Where a legacy record's archive lives and what it contains.
pub struct BackfillSource {
    pub archive_path: Utf8PathBuf,
    pub layout: Option<ArchiveLayout>,
}

/// Build an authoritative state from the legacy file.
///
/// `lookup` resolves an archive file name to its location and layout, so
/// manifest installs get their feature selections back.
pub fn backfill(
    legacy: &LegacyState,
    mods_dir: &Utf8Path,
    game_root: &Utf8Path,
    mut lookup: impl FnMut(&str) -> Option<BackfillSource>,
) -> PackageState {
    let mut state = PackageState::default();
    for (mod_id, rec) in legacy {
        let source = lookup(&rec.archive_filename);
        let archive_path = source
            .as_ref()
            .map(|s| s.archive_path.clone())
            .unwrap_or_else(|| mods_dir.join(&rec.archive_filename));
        let selected_options = source
            .as_ref()
            .and_then(|s| s.layout.as_ref())
            .and_then(|layout| {
                selection::reconstruct(layout, &rec.option_name, &rec.installed_files)
            })
            .unwrap_or_else(|| Selection::variant(rec.option_name.clone()));

        let installed_files: Vec<String> = rec
            .installed_files
            .iter()
            .map(|path| {
                if path.starts_with(PACKAGE_PREFIX) {
                    path.clone()
                } else {
                    format!("{PACKAGE_PREFIX}{path}")
                }
            })
            .collect();

        state.insert(InstalledMod {
            mod_id: mod_id.clone(),
            backend: Backend::Yumia,
            source_archive_path: archive_path,
            selected_options,
            option_summary: rec.option_name.clone(),
            file_digests: digests_on_disk(game_root, &installed_files),
            installed_files,
            loose_mod_dir: None,
            installed_at: Utc::now(),
        });
    }
    tracing::info!("Backfilled install state from legacy manifest: {} mod(s)", state.records.len());
    state
}

/// SHA-256 of every listed file that currently exists.
pub fn digests_on_disk(game_root: &Utf8Path, files: &[String]) -> BTreeMap<String, String> {
    files
        .iter()
        .filter_map(|rel| {
            let data = fs::read(game_root.join(rel)).ok()?;
            Some((rel.clone(), sha256_hex(&data)))
        })
        .collect()
}

/// Records whose tracked files are missing from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// mod_id -> missing game-root-relative paths
    pub broken: BTreeMap<String, Vec<String>>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.broken.is_empty()
    }
}

pub fn verify(state: &PackageState, game_root: &Utf8Path) -> DriftReport {
    let mut report = DriftReport::default();
    for rec in state.records.values() {
        let missing: Vec<String> = rec
            .installed_files
            .iter()
            .filter(|rel| !game_root.join(rel.as_str()).is_file())
            .cloned()
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                "Mod {} ({}): {} tracked file(s) missing",
                rec.mod_id,
                rec.option_summary,
                missing.len()
            );
            report.broken.insert(rec.mod_id.clone(), missing);
        }
    }
    report
}

/// Tracked `.yumiamod.json` files of a record.
pub fn tracked_sidecars(rec: &InstalledMod) -> impl Iterator<Item = &str> {
    rec.installed_files
        .iter()
        .map(String::as_str)
        .filter(|path| is_sidecar(path))
}

/// Current records plus the store, with saves serialised against readers.
pub struct SharedState {
    store: StateStore,
    current: RwLock<PackageState>,
}

impl SharedState {
    pub fn new(store: StateStore, state: PackageState) -> Self {
        Self {
            store,
            current: RwLock::new(state),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn snapshot(&self) -> PackageState {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&PackageState) -> R) -> R {
        f(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Persist `next` and make it current. Readers wait for the write to land.
    pub fn commit(&self, next: PackageState) -> Result<(), StoreError> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        self.store.save(&next)?;
        *guard = next;
        Ok(())
    }

    /// Replace the in-memory view without saving (after a fresh load).
    pub fn replace(&self, next: PackageState) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LegacyRecord;
    use tempfile::TempDir;

    fn dirs() -> (TempDir, Utf8PathBuf, Utf8PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        let package = root.join("game/package");
        let downloads = root.join("downloads");
        fs::create_dir_all(&package).unwrap();
        fs::create_dir_all(&downloads).unwrap();
        (temp, package, downloads)
    }

    fn yumia_record(id: &str) -> InstalledMod {
        InstalledMod {
            mod_id: id.to_string(),
            backend: Backend::Yumia,
            source_archive_path: Utf8PathBuf::from(format!("/downloads/{id}")),
            selected_options: Selection::variant("(default)"),
            option_summary: "(default)".to_string(),
            installed_files: vec!["package/0xAA.fdata".to_string()],
            loose_mod_dir: None,
            file_digests: BTreeMap::new(),
            installed_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_state_is_none() {
        let (_temp, package, downloads) = dirs();
        let store = StateStore::new(&package, &downloads);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let (_temp, package, downloads) = dirs();
        let store = StateStore::new(&package, &downloads);
        fs::write(store.state_path(), br#"{"version": 3, "records": {}}"#).unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedVersion { found: Some(3), .. }));
    }

    #[test]
    fn test_legacy_removed_when_no_yumia_records() {
        let (_temp, package, downloads) = dirs();
        let store = StateStore::new(&package, &downloads);

        let mut state = PackageState::default();
        state.insert(yumia_record("a.zip"));
        store.save(&state).unwrap();
        assert!(store.legacy_path().exists());

        state.remove("a.zip");
        store.save(&state).unwrap();
        assert!(!store.legacy_path().exists());
    }

    #[test]
    fn test_backfill_prefixes_package_paths() {
        let (_temp, package, downloads) = dirs();
        let mut legacy = LegacyState::new();
        legacy.insert(
            "a.zip".to_string(),
            LegacyRecord {
                archive_filename: "a.zip".to_string(),
                option_name: "Red".to_string(),
                installed_files: vec!["0xAA.fdata".to_string()],
            },
        );

        let state = backfill(&legacy, &downloads, package.parent().unwrap(), |_| None);
        let rec = state.get("a.zip").unwrap();
        assert_eq!(rec.installed_files, vec!["package/0xAA.fdata"]);
        assert_eq!(rec.selected_options, Selection::variant("Red"));
        assert_eq!(rec.source_archive_path, downloads.join("a.zip"));
    }

    #[test]
    fn test_verify_reports_missing_files() {
        let (_temp, package, _downloads) = dirs();
        let game_root = package.parent().unwrap().to_owned();
        let mut state = PackageState::default();
        state.insert(yumia_record("a.zip"));

        let report = verify(&state, &game_root);
        assert_eq!(report.broken["a.zip"], vec!["package/0xAA.fdata"]);

        fs::write(package.join("0xAA.fdata"), b"x").unwrap();
        assert!(verify(&state, &game_root).is_clean());
    }
}
