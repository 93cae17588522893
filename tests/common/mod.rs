//! Shared fixtures: a throwaway game folder, a downloads folder and archive builders.
#![allow(dead_code)]

use camino::Utf8PathBuf;
use nioh3_modmanager::ModManager;
use nioh3_modmanager::services::environment::{
    DLL_LOADER_NAME, LOOSE_PLUGIN_DLL, LOOSE_PLUGIN_INI, PLUGINS_DIR, YUMIA_EXE_NAME,
};
use nioh3_modmanager::services::fdata::testing;
use nioh3_modmanager::services::{ManagerPaths, Patcher, SimulatedPatcher};
use std::fs::{self, File};
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

/// `.g1t` type id; unpacked entries are named `0x<name_hash>.g1t`.
pub const G1T_TKID: u32 = 0xAFBEC60C;

pub const ORIGINAL_RDB: &[u8] = b"vanilla rdb";
pub const ORIGINAL_RDX: &[u8] = b"vanilla rdx";

pub struct GameFixture {
    _temp: TempDir,
    pub root: Utf8PathBuf,
    pub paths: ManagerPaths,
}

impl GameFixture {
    /// `<tmp>/downloads` and `<tmp>/Nioh3/package` with vanilla core RDB files.
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        let paths = ManagerPaths::new(root.join("downloads"), root.join("Nioh3/package"));
        fs::create_dir_all(&paths.mods_dir).unwrap();
        fs::create_dir_all(&paths.package_dir).unwrap();
        fs::write(paths.package_dir.join("root.rdb"), ORIGINAL_RDB).unwrap();
        fs::write(paths.package_dir.join("root.rdx"), ORIGINAL_RDX).unwrap();
        Self {
            _temp: temp,
            root,
            paths,
        }
    }

    pub fn with_yumia(self) -> Self {
        fs::write(self.paths.package_dir.join(YUMIA_EXE_NAME), b"MZ").unwrap();
        self
    }

    pub fn with_loose_loader(self) -> Self {
        let plugins = self.paths.game_root.join(PLUGINS_DIR);
        fs::create_dir_all(&plugins).unwrap();
        fs::write(self.paths.game_root.join(DLL_LOADER_NAME), b"MZ").unwrap();
        fs::write(plugins.join(LOOSE_PLUGIN_DLL), b"MZ").unwrap();
        fs::write(plugins.join(LOOSE_PLUGIN_INI), b"[LooseFileLoader]\n").unwrap();
        self
    }

    /// Write a zip into the downloads folder.
    pub fn zip(&self, name: &str, entries: &[(&str, Vec<u8>)]) -> Utf8PathBuf {
        let path = self.paths.mods_dir.join(name);
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        for (entry, data) in entries {
            writer.start_file(*entry, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    pub fn manager(&self) -> ModManager {
        self.manager_with(Arc::new(SimulatedPatcher))
    }

    pub fn manager_with(&self, patcher: Arc<dyn Patcher>) -> ModManager {
        let manager = ModManager::new(self.paths.clone(), patcher);
        manager.load_state().unwrap();
        manager
    }

    pub fn game_file(&self, rel: &str) -> Utf8PathBuf {
        self.paths.game_root.join(rel)
    }

    pub fn read_core(&self) -> (Vec<u8>, Vec<u8>) {
        (
            fs::read(self.paths.package_dir.join("root.rdb")).unwrap(),
            fs::read(self.paths.package_dir.join("root.rdx")).unwrap(),
        )
    }
}

/// A `.fdata` container with one stored `.g1t` entry.
pub fn fdata(name_hash: u32, payload: &[u8]) -> Vec<u8> {
    testing::container(&[testing::stored_entry(name_hash, G1T_TKID, payload)])
}

/// A `.yumiamod.json` declaring the replaced asset hashes.
pub fn sidecar(name_hashes: &[u32]) -> Vec<u8> {
    let files: Vec<String> = name_hashes
        .iter()
        .map(|hash| format!(r#"{{"name_hash": {hash}, "tkid_hash": {G1T_TKID}}}"#))
        .collect();
    format!(r#"{{"files": [{}]}}"#, files.join(", ")).into_bytes()
}

/// Loose file name an unpacked `.g1t` entry gets.
pub fn loose_name(name_hash: u32) -> String {
    format!("0x{name_hash:08X}.g1t")
}

/// A legacy Yumia archive with a root `package/` folder.
pub fn legacy_entries(stem: &str, name_hash: u32, payload: &[u8]) -> Vec<(String, Vec<u8>)> {
    vec![
        (format!("package/{stem}.fdata"), fdata(name_hash, payload)),
        (format!("package/{stem}.yumiamod.json"), sidecar(&[name_hash])),
    ]
}

/// Borrow an owned entry list in the shape [`GameFixture::zip`] takes.
pub fn as_entries(owned: &[(String, Vec<u8>)]) -> Vec<(&str, Vec<u8>)> {
    owned
        .iter()
        .map(|(name, data)| (name.as_str(), data.clone()))
        .collect()
}
