//! Filesystem probe for backend prerequisites.
//!
//! Expected game layout:
//!
//! ```text
//! <game_root>/
//! ├── DINPUT8.dll                  <- DLL loader
//! ├── plugins/LooseFileLoader.dll
//! ├── plugins/LooseFileLoader.ini
//! ├── mods/<mod dir>/<loose files> <- loose installs
//! └── package/                     <- package_dir
//!     ├── root.rdb, root.rdx
//!     ├── root.rdb.original, root.rdx.original  <- created by the patcher
//!     └── yumia_mod_insert_into_rdb.exe
//! ```
//!
//! File names are matched case-insensitively so installs copied from
//! Windows onto case-sensitive filesystems still probe correctly.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

use crate::models::EnvironmentStatus;

pub const YUMIA_EXE_NAME: &str = "yumia_mod_insert_into_rdb.exe";
pub const DLL_LOADER_NAME: &str = "DINPUT8.dll";
pub const PLUGINS_DIR: &str = "plugins";
pub const LOOSE_PLUGIN_DLL: &str = "LooseFileLoader.dll";
pub const LOOSE_PLUGIN_INI: &str = "LooseFileLoader.ini";
pub const LOOSE_MODS_DIR: &str = "mods";
pub const CORE_RDB_FILES: [&str; 2] = ["root.rdb", "root.rdx"];

/// Backup created by the patcher for a core RDB file.
pub fn backup_name(core: &str) -> String {
    format!("{core}.original")
}

/// The game root is the parent of `package/`.
pub fn game_root_for(package_dir: &Utf8Path) -> Utf8PathBuf {
    package_dir
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(package_dir)
        .to_owned()
}

/// All paths the manager works with, derived from the two configured folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerPaths {
    /// Downloads folder holding archives and the legacy manifest.
    pub mods_dir: Utf8PathBuf,
    pub package_dir: Utf8PathBuf,
    pub game_root: Utf8PathBuf,
}

impl ManagerPaths {
    pub fn new(mods_dir: impl Into<Utf8PathBuf>, package_dir: impl Into<Utf8PathBuf>) -> Self {
        let package_dir = package_dir.into();
        Self {
            mods_dir: mods_dir.into(),
            game_root: game_root_for(&package_dir),
            package_dir,
        }
    }

    /// `<game_root>/mods`, where LooseFileLoader reads from.
    pub fn loose_root(&self) -> Utf8PathBuf {
        self.game_root.join(LOOSE_MODS_DIR)
    }

    pub fn yumia_executable(&self) -> Utf8PathBuf {
        self.package_dir.join(YUMIA_EXE_NAME)
    }

    pub fn core_rdb_paths(&self) -> Vec<Utf8PathBuf> {
        CORE_RDB_FILES
            .iter()
            .map(|name| self.package_dir.join(name))
            .collect()
    }

    /// `(core, backup)` pairs.
    pub fn rdb_backup_pairs(&self) -> Vec<(Utf8PathBuf, Utf8PathBuf)> {
        CORE_RDB_FILES
            .iter()
            .map(|name| (self.package_dir.join(name), self.package_dir.join(backup_name(name))))
            .collect()
    }

    /// First missing `.original` backup, if any.
    pub fn missing_backup(&self) -> Option<Utf8PathBuf> {
        self.rdb_backup_pairs()
            .into_iter()
            .map(|(_, backup)| backup)
            .find(|backup| !backup.is_file())
    }

    /// Absolute path of a game-root-relative record path.
    pub fn resolve(&self, rel: &str) -> Utf8PathBuf {
        self.game_root.join(rel)
    }
}

/// Whether `dir` holds a file called `name`, ignoring case.
pub fn file_exists_ci(dir: &Utf8Path, name: &str) -> bool {
    if dir.join(name).is_file() {
        return true;
    }
    let Ok(read_dir) = fs::read_dir(dir) else {
        return false;
    };
    read_dir.flatten().any(|entry| {
        entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            && entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
    })
}

/// Check every backend prerequisite for the given `package/` directory.
pub fn probe(package_dir: &Utf8Path) -> EnvironmentStatus {
    let game_root = game_root_for(package_dir);
    let plugins = game_root.join(PLUGINS_DIR);

    let status = EnvironmentStatus {
        package_dir_exists: package_dir.is_dir(),
        game_root_exists: game_root.is_dir(),
        yumia_executable_present: file_exists_ci(package_dir, YUMIA_EXE_NAME),
        dll_loader_present: file_exists_ci(&game_root, DLL_LOADER_NAME),
        loose_plugin_dll_present: file_exists_ci(&plugins, LOOSE_PLUGIN_DLL),
        loose_plugin_ini_present: file_exists_ci(&plugins, LOOSE_PLUGIN_INI),
        rdb_backups_present: CORE_RDB_FILES
            .iter()
            .all(|core| package_dir.join(backup_name(core)).is_file()),
        game_root,
        package_dir: package_dir.to_owned(),
    };

    tracing::debug!(
        "Environment probe: yumia_exe={}, loose_ready={}, backups={}",
        status.yumia_executable_present,
        status.loose_ready(),
        status.rdb_backups_present
    );
    status
}
