//! Collision checks between a planned install and what is already tracked or on disk.
//!
//! A Yumia path tracked by another record always conflicts. An untracked file
//! already on disk conflicts only when its bytes differ. Two sidecars that
//! replace the same asset `name_hash` conflict too.
//! Loose payloads compare final file names only, case-insensitively, since
//! LooseFileLoader resolves assets by name regardless of folder.

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;

use crate::models::{Backend, InstalledMod, PackageState};

use super::classifier::entry_file_name;
use super::convert::sha256_hex;
use super::environment::LOOSE_MODS_DIR;
use super::fdata::YumiaSidecar;
use super::store::tracked_sidecars;

/// One Yumia file about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YumiaCandidate {
    /// Game-root-relative, `package/...`.
    pub path: String,
    pub digest: String,
    /// Asset hashes replaced by this file when it is a sidecar.
    pub name_hashes: BTreeSet<u64>,
}

/// The planned outputs of one install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSet {
    Yumia(Vec<YumiaCandidate>),
    Loose {
        /// `mods/<dir>`
        mod_dir: String,
        filenames: Vec<String>,
    },
}

pub struct ConflictDetector {
    game_root: Utf8PathBuf,
}

impl ConflictDetector {
    pub fn new(game_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            game_root: game_root.into(),
        }
    }

    /// Conflicting candidate paths, sorted. `excluding` names a record whose
    /// files are ignored (a reinstall or the mod being migrated).
    pub fn detect(
        &self,
        candidates: &CandidateSet,
        installs: &PackageState,
        excluding: Option<&str>,
    ) -> BTreeSet<String> {
        let conflicts = match candidates {
            CandidateSet::Yumia(files) => self.detect_yumia(files, installs, excluding),
            CandidateSet::Loose { mod_dir, filenames } => {
                self.detect_loose(mod_dir, filenames, installs, excluding)
            }
        };
        if !conflicts.is_empty() {
            tracing::info!("Conflict check found {} conflicting path(s)", conflicts.len());
        }
        conflicts
    }

    fn others<'a>(
        installs: &'a PackageState,
        backend: Backend,
        excluding: Option<&'a str>,
    ) -> impl Iterator<Item = &'a InstalledMod> {
        installs
            .by_backend(backend)
            .filter(move |rec| Some(rec.mod_id.as_str()) != excluding)
    }

    fn disk_digest(&self, rel: &str) -> Option<String> {
        fs::read(self.game_root.join(rel)).ok().map(|data| sha256_hex(&data))
    }

    fn installed_name_hashes(&self, rec: &InstalledMod) -> BTreeSet<u64> {
        let mut hashes = BTreeSet::new();
        for rel in tracked_sidecars(rec) {
            let path = self.game_root.join(rel);
            let Ok(data) = fs::read(&path) else {
                continue;
            };
            match YumiaSidecar::parse(&data) {
                Ok(sidecar) => hashes.extend(sidecar.name_hashes().iter().copied()),
                Err(e) => tracing::warn!("Could not read {} for conflict check: {}", path, e),
            }
        }
        hashes
    }

    pub fn detect_yumia(
        &self,
        candidates: &[YumiaCandidate],
        installs: &PackageState,
        excluding: Option<&str>,
    ) -> BTreeSet<String> {
        let mut conflicts = BTreeSet::new();
        let tracked: HashSet<String> = installs
            .records
            .values()
            .flat_map(|rec| rec.installed_files.iter().map(|f| f.to_lowercase()))
            .collect();

        for rec in Self::others(installs, Backend::Yumia, excluding) {
            let owned: HashSet<String> = rec
                .installed_files
                .iter()
                .map(|f| f.to_lowercase())
                .collect();
            for candidate in candidates {
                // Identical bytes still conflict: a path has one owning record.
                if owned.contains(&candidate.path.to_lowercase()) {
                    tracing::debug!("{} is already owned by {}", candidate.path, rec.mod_id);
                    conflicts.insert(candidate.path.clone());
                }
            }

            let incoming: Vec<&YumiaCandidate> = candidates
                .iter()
                .filter(|c| !c.name_hashes.is_empty())
                .collect();
            if !incoming.is_empty() {
                let installed = self.installed_name_hashes(rec);
                for candidate in incoming {
                    if !candidate.name_hashes.is_disjoint(&installed) {
                        tracing::debug!("{} replaces assets already replaced by {}", candidate.path, rec.mod_id);
                        conflicts.insert(candidate.path.clone());
                    }
                }
            }
        }

        for candidate in candidates {
            if tracked.contains(&candidate.path.to_lowercase()) {
                continue;
            }
            if let Some(digest) = self.disk_digest(&candidate.path) {
                if digest != candidate.digest {
                    tracing::debug!("{} exists on disk untracked", candidate.path);
                    conflicts.insert(candidate.path.clone());
                }
            }
        }

        conflicts
    }

    /// Files directly inside `mods/` or one folder below it, game-root-relative.
    fn loose_disk_files(&self) -> Vec<String> {
        let loose_root = self.game_root.join(LOOSE_MODS_DIR);
        let mut files = Vec::new();
        let Ok(top) = fs::read_dir(&loose_root) else {
            return files;
        };
        for entry in top.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_file() {
                files.push(format!("{LOOSE_MODS_DIR}/{name}"));
            } else if file_type.is_dir() {
                files.extend(
                    list_files(&loose_root.join(&name))
                        .into_iter()
                        .map(|file| format!("{LOOSE_MODS_DIR}/{name}/{file}")),
                );
            }
        }
        files
    }

    pub fn detect_loose(
        &self,
        mod_dir: &str,
        filenames: &[String],
        installs: &PackageState,
        excluding: Option<&str>,
    ) -> BTreeSet<String> {
        let mut conflicts = BTreeSet::new();
        let planned: BTreeMap<String, String> = filenames
            .iter()
            .map(|name| (name.to_lowercase(), format!("{mod_dir}/{name}")))
            .collect();
        let target_lower = mod_dir.to_lowercase();

        let tracked: HashSet<String> = installs
            .by_backend(Backend::Loose)
            .flat_map(|rec| rec.installed_files.iter().map(|f| f.to_lowercase()))
            .collect();

        for rec in Self::others(installs, Backend::Loose, excluding) {
            if rec
                .loose_mod_dir
                .as_deref()
                .is_some_and(|dir| dir.to_lowercase() == target_lower)
            {
                tracing::debug!("{} is already owned by {}", mod_dir, rec.mod_id);
                conflicts.insert(format!("{mod_dir}/"));
            }
            for rel in &rec.installed_files {
                if let Some(candidate) = planned.get(&entry_file_name(rel).to_lowercase()) {
                    tracing::debug!("{} collides with {} from {}", candidate, rel, rec.mod_id);
                    conflicts.insert(candidate.clone());
                }
            }
        }

        for rel in self.loose_disk_files() {
            if tracked.contains(&rel.to_lowercase()) {
                continue;
            }
            if let Some(candidate) = planned.get(&entry_file_name(&rel).to_lowercase()) {
                tracing::debug!("{} collides with untracked {}", candidate, rel);
                conflicts.insert(candidate.clone());
            }
        }

        let target = self.game_root.join(mod_dir);
        let untracked_in_target = list_files(&target)
            .into_iter()
            .any(|file| !tracked.contains(&format!("{mod_dir}/{file}").to_lowercase()));
        if untracked_in_target {
            tracing::debug!("{} already contains untracked files", mod_dir);
            conflicts.insert(format!("{mod_dir}/"));
        }

        conflicts
    }
}

/// Every file below `dir`, relative to it with `/` separators.
fn list_files(dir: &Utf8Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![(dir.to_owned(), String::new())];
    while let Some((current, prefix)) = stack.pop() {
        let Ok(read_dir) = fs::read_dir(&current) else {
            continue;
        };
        for entry in read_dir.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let rel = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match entry.file_type() {
                Ok(t) if t.is_dir() => stack.push((current.join(&name), rel)),
                Ok(t) if t.is_file() => out.push(rel),
                _ => {}
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Selection;
    use chrono::Utc;
    use tempfile::TempDir;

    fn loose_record(id: &str, dir: &str, files: &[&str]) -> InstalledMod {
        InstalledMod {
            mod_id: id.to_string(),
            backend: Backend::Loose,
            source_archive_path: Utf8PathBuf::from(id),
            selected_options: Selection::variant("(default)"),
            option_summary: "(default)".to_string(),
            installed_files: files.iter().map(|f| format!("{dir}/{f}")).collect(),
            loose_mod_dir: Some(dir.to_string()),
            file_digests: BTreeMap::new(),
            installed_at: Utc::now(),
        }
    }

    fn yumia_record(id: &str, files: &[&str], content: &[u8]) -> InstalledMod {
        InstalledMod {
            backend: Backend::Yumia,
            installed_files: files.iter().map(|f| f.to_string()).collect(),
            loose_mod_dir: None,
            file_digests: files
                .iter()
                .map(|f| (f.to_string(), sha256_hex(content)))
                .collect(),
            ..loose_record(id, "", &[])
        }
    }

    fn game_root(temp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_loose_name_collision_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let detector = ConflictDetector::new(game_root(&temp));
        let mut state = PackageState::default();
        state.insert(loose_record("a.zip", "mods/A", &["0x0000ABCD.g1t"]));

        let conflicts = detector.detect_loose(
            "mods/B",
            &["0x0000abcd.G1T".to_string(), "0x00000001.g1t".to_string()],
            &state,
            None,
        );
        assert_eq!(conflicts.into_iter().collect::<Vec<_>>(), vec!["mods/B/0x0000abcd.G1T"]);
    }

    #[test]
    fn test_excluded_record_is_ignored() {
        let temp = TempDir::new().unwrap();
        let detector = ConflictDetector::new(game_root(&temp));
        let mut state = PackageState::default();
        state.insert(loose_record("a.zip", "mods/A", &["0x0000ABCD.g1t"]));

        let conflicts =
            detector.detect_loose("mods/A", &["0x0000ABCD.g1t".to_string()], &state, Some("a.zip"));
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_untracked_disk_file_conflicts() {
        let temp = TempDir::new().unwrap();
        let root = game_root(&temp);
        fs::create_dir_all(root.join("mods/Manual")).unwrap();
        fs::write(root.join("mods/Manual/0x0000ABCD.g1t"), b"x").unwrap();

        let detector = ConflictDetector::new(root);
        let conflicts = detector.detect(
            &CandidateSet::Loose {
                mod_dir: "mods/New".to_string(),
                filenames: vec!["0x0000ABCD.g1t".to_string()],
            },
            &PackageState::default(),
            None,
        );
        assert!(conflicts.contains("mods/New/0x0000ABCD.g1t"));
    }

    #[test]
    fn test_identical_yumia_content_is_not_a_conflict() {
        let temp = TempDir::new().unwrap();
        let root = game_root(&temp);
        fs::create_dir_all(root.join("package")).unwrap();
        fs::write(root.join("package/0xAA.fdata"), b"same").unwrap();

        let candidate = YumiaCandidate {
            path: "package/0xAA.fdata".to_string(),
            digest: sha256_hex(b"same"),
            name_hashes: BTreeSet::new(),
        };
        let detector = ConflictDetector::new(root);
        assert!(detector
            .detect_yumia(&[candidate.clone()], &PackageState::default(), None)
            .is_empty());

        let changed = YumiaCandidate {
            digest: sha256_hex(b"different"),
            ..candidate
        };
        assert_eq!(
            detector.detect_yumia(&[changed], &PackageState::default(), None).len(),
            1
        );
    }

    #[test]
    fn test_yumia_path_owned_by_another_mod_conflicts_even_when_identical() {
        let temp = TempDir::new().unwrap();
        let root = game_root(&temp);
        fs::create_dir_all(root.join("package")).unwrap();
        fs::write(root.join("package/shared.fdata"), b"same").unwrap();

        let mut state = PackageState::default();
        state.insert(yumia_record("a.zip", &["package/shared.fdata"], b"same"));
        let candidate = YumiaCandidate {
            path: "package/Shared.fdata".to_string(),
            digest: sha256_hex(b"same"),
            name_hashes: BTreeSet::new(),
        };

        let detector = ConflictDetector::new(root);
        assert_eq!(
            detector
                .detect_yumia(std::slice::from_ref(&candidate), &state, None)
                .into_iter()
                .collect::<Vec<_>>(),
            vec!["package/Shared.fdata"]
        );
        // Reinstalling the owner itself is fine.
        assert!(detector.detect_yumia(&[candidate], &state, Some("a.zip")).is_empty());
    }
}
