use camino::Utf8PathBuf;

use super::archive::Backend;

/// Snapshot of which backend prerequisites exist on disk.
///
/// Derived on every probe and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentStatus {
    pub game_root: Utf8PathBuf,
    pub package_dir: Utf8PathBuf,
    pub package_dir_exists: bool,
    pub game_root_exists: bool,
    pub yumia_executable_present: bool,
    pub dll_loader_present: bool,
    pub loose_plugin_dll_present: bool,
    pub loose_plugin_ini_present: bool,
    /// Both `root.rdb.original` and `root.rdx.original` exist.
    pub rdb_backups_present: bool,
}

impl EnvironmentStatus {
    /// Loader DLL, plugin DLL and plugin config are all in place.
    pub fn loose_ready(&self) -> bool {
        self.dll_loader_present && self.loose_plugin_dll_present && self.loose_plugin_ini_present
    }

    /// Human-readable names of the missing LooseFileLoader pieces.
    pub fn missing_loose_prerequisites(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.dll_loader_present {
            missing.push("DLL loader (DINPUT8.dll)");
        }
        if !self.loose_plugin_dll_present {
            missing.push("LooseFileLoader.dll");
        }
        if !self.loose_plugin_ini_present {
            missing.push("LooseFileLoader.ini");
        }
        missing
    }
}

/// Query result combining the probe with the recorded installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentReport {
    pub status: EnvironmentStatus,
    pub mods_dir_exists: bool,
    /// Backend of the current installs; Yumia wins when both are present.
    pub active_backend: Option<Backend>,
    pub has_active_yumia_mods: bool,
    pub has_active_loose_mods: bool,
    pub can_install: bool,
    pub can_migrate: bool,
}
