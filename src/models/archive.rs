use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use super::manifest::ModManifest;

/// Label used for the single option of archives that offer no real choice.
pub const DEFAULT_OPTION_LABEL: &str = "(default)";

/// Which install mechanism a payload (or a whole install) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// `.fdata` + `.yumiamod.json` pairs patched into `root.rdb` by the yumia executable.
    Yumia,
    /// Hashed asset files read by LooseFileLoader from `<game_root>/mods/`.
    Loose,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Yumia => "yumia",
            Backend::Loose => "loose",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(archive entry, install-relative destination)` pair.
///
/// For Yumia payloads `install_path` is relative to the game's `package/`
/// directory and may keep sub-directories. For loose payloads it is the
/// flattened file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryPair {
    pub archive_path: String,
    pub install_path: String,
}

impl EntryPair {
    pub fn new(archive_path: impl Into<String>, install_path: impl Into<String>) -> Self {
        Self {
            archive_path: archive_path.into(),
            install_path: install_path.into(),
        }
    }
}

/// One installable unit discovered inside an archive.
///
/// Produced by the classifier, consumed by the install engine, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOption {
    pub label: String,
    pub kind: Backend,
    pub files: Vec<EntryPair>,
    /// Set when the option is one choice of a manifest feature.
    pub feature_name: Option<String>,
    /// True when the owning manifest feature may be skipped entirely.
    pub optional: bool,
}

impl ArchiveOption {
    pub fn archive_paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|pair| pair.archive_path.as_str())
    }
}

/// The mutually-exclusive choices of a single manifest feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureGroup {
    pub name: String,
    pub directory: String,
    pub optional: bool,
    pub choices: Vec<ArchiveOption>,
}

impl FeatureGroup {
    pub fn choice(&self, label: &str) -> Option<&ArchiveOption> {
        self.choices.iter().find(|choice| choice.label == label)
    }

    pub fn choice_labels(&self) -> Vec<&str> {
        self.choices.iter().map(|choice| choice.label.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLayout {
    pub manifest: ModManifest,
    /// Files of `common_files_dir`, always installed.
    pub common: Option<ArchiveOption>,
    pub features: Vec<FeatureGroup>,
}

impl ManifestLayout {
    pub fn feature(&self, name: &str) -> Option<&FeatureGroup> {
        self.features.iter().find(|feature| feature.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectLooseLayout {
    /// Root-level loose files, always installed.
    pub common: Vec<EntryPair>,
    pub components: Vec<ArchiveOption>,
    /// Components are checkboxes rather than a single default option.
    pub multi_select: bool,
}

/// Result of classifying an archive's entry listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveLayout {
    Manifest(ManifestLayout),
    /// Radio-style options, one per `package/` directory (or the archive root).
    LegacyYumia(Vec<ArchiveOption>),
    DirectLoose(DirectLooseLayout),
}

impl ArchiveLayout {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ArchiveLayout::Manifest(_) => "manifest",
            ArchiveLayout::LegacyYumia(_) => "legacy_yumia",
            ArchiveLayout::DirectLoose(_) => "direct_loose",
        }
    }

    /// Flattened, ordered view of every option the archive offers.
    pub fn options(&self) -> Vec<&ArchiveOption> {
        match self {
            ArchiveLayout::Manifest(layout) => layout
                .common
                .iter()
                .chain(layout.features.iter().flat_map(|f| f.choices.iter()))
                .collect(),
            ArchiveLayout::LegacyYumia(options) => options.iter().collect(),
            ArchiveLayout::DirectLoose(layout) => layout.components.iter().collect(),
        }
    }

    pub fn manifest(&self) -> Option<&ModManifest> {
        match self {
            ArchiveLayout::Manifest(layout) => Some(&layout.manifest),
            _ => None,
        }
    }
}

/// An archive found in the downloads folder together with its classification.
#[derive(Debug, Clone)]
pub struct ScannedArchive {
    pub path: Utf8PathBuf,
    /// The archive file name, which doubles as the mod id.
    pub file_name: String,
    /// Manifest `mod_name` when present, otherwise the file stem.
    pub display_name: String,
    pub entries: Vec<String>,
    pub layout: Result<ArchiveLayout, crate::services::ClassifyError>,
}

impl ScannedArchive {
    pub fn is_supported(&self) -> bool {
        self.layout.is_ok()
    }
}
