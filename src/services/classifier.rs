//! Archive layout detection.
//!
//! Detection order, first match wins:
//!
//! 1. `nioh3modmanifest.json` at the archive root
//! 2. one or more `package/` directories (legacy Yumia)
//! 3. `.fdata` / `.yumiamod.json` files at the archive root (legacy Yumia)
//! 4. hashed loose asset files (direct loose)
//!
//! Anything else is unsupported. A present but broken manifest never falls
//! through to the later rules.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use thiserror::Error;

use crate::models::{
    ArchiveLayout, ArchiveOption, Backend, DEFAULT_OPTION_LABEL, DirectLooseLayout, EntryPair,
    FeatureGroup, MANIFEST_FILENAME, ManifestError, ManifestLayout, ModManifest,
};

/// `0x1A2B3C4D.g1t`, `1A2B3C4D.kidsobjdb`, ...
static LOOSE_ASSET_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:0x)?[0-9A-Fa-f]{8}\.[^.]+$").expect("loose asset regex is valid")
});

const FDATA_EXT: &str = ".fdata";
const SIDECAR_EXT: &str = ".yumiamod.json";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("unsupported archive: no package/ folder, yumia payload, hashed loose files or manifest found")]
    NoRecognizedLayout,

    #[error("unsupported archive: {MANIFEST_FILENAME} could not be read")]
    ManifestUnreadable,

    #[error("unsupported archive: invalid {MANIFEST_FILENAME}: {0}")]
    InvalidManifest(#[from] ManifestError),
}

/// Last path segment of an archive entry.
pub fn entry_file_name(entry: &str) -> &str {
    entry.rsplit('/').next().unwrap_or(entry)
}

/// Normalise an archive entry name to forward slashes without a leading `./` or `/`.
pub fn normalize_entry(entry: &str) -> String {
    let entry = entry.replace('\\', "/");
    let entry = entry.strip_prefix("./").unwrap_or(&entry);
    entry.trim_start_matches('/').to_string()
}

pub fn is_fdata(entry: &str) -> bool {
    entry.to_ascii_lowercase().ends_with(FDATA_EXT)
}

pub fn is_sidecar(entry: &str) -> bool {
    entry.to_ascii_lowercase().ends_with(SIDECAR_EXT)
}

/// `.fdata` or `.yumiamod.json`.
pub fn is_yumia_payload(entry: &str) -> bool {
    is_fdata(entry) || is_sidecar(entry)
}

/// A hashed asset LooseFileLoader can read directly.
pub fn is_loose_payload(entry: &str) -> bool {
    let name = entry_file_name(entry);
    !is_fdata(name) && LOOSE_ASSET_NAME.is_match(name)
}

pub fn is_payload(entry: &str) -> bool {
    is_yumia_payload(entry) || is_loose_payload(entry)
}

/// Whether `entries` carries a root-level manifest.
pub fn has_root_manifest(entries: &[String]) -> bool {
    entries
        .iter()
        .any(|e| e.eq_ignore_ascii_case(MANIFEST_FILENAME))
}

/// The entry name of the root manifest, with the archive's own casing.
pub fn root_manifest_entry(entries: &[String]) -> Option<&str> {
    entries
        .iter()
        .find(|e| e.eq_ignore_ascii_case(MANIFEST_FILENAME))
        .map(String::as_str)
}

/// Classify an archive from its entry listing.
///
/// `manifest` holds the bytes of the root manifest when the caller could read
/// it. Entries ending in `/` are treated as directories and ignored.
pub fn classify(
    entries: &[String],
    manifest: Option<&[u8]>,
) -> Result<ArchiveLayout, ClassifyError> {
    let files: Vec<&str> = entries
        .iter()
        .map(String::as_str)
        .filter(|e| !e.is_empty() && !e.ends_with('/'))
        .collect();

    if has_root_manifest(entries) {
        let data = manifest.ok_or(ClassifyError::ManifestUnreadable)?;
        let manifest = ModManifest::parse(data)?;
        return Ok(ArchiveLayout::Manifest(manifest_layout(manifest, &files)));
    }

    let package_options = package_dir_options(&files);
    if !package_options.is_empty() {
        tracing::debug!("Classified as legacy Yumia with {} package option(s)", package_options.len());
        return Ok(ArchiveLayout::LegacyYumia(package_options));
    }

    let root_pairs: Vec<EntryPair> = files
        .iter()
        .filter(|e| !e.contains('/') && is_yumia_payload(e))
        .map(|e| EntryPair::new(*e, *e))
        .collect();
    if !root_pairs.is_empty() {
        return Ok(ArchiveLayout::LegacyYumia(vec![ArchiveOption {
            label: DEFAULT_OPTION_LABEL.to_string(),
            kind: Backend::Yumia,
            files: root_pairs,
            feature_name: None,
            optional: false,
        }]));
    }

    if let Some(layout) = direct_loose_layout(&files) {
        return Ok(ArchiveLayout::DirectLoose(layout));
    }

    Err(ClassifyError::NoRecognizedLayout)
}

/// Case-insensitive ordering with a byte-order tie break, so the result never
/// depends on listing order.
fn label_order(a: &str, b: &str) -> std::cmp::Ordering {
    a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b))
}

fn install_pair(entry: &str, rel: &str) -> EntryPair {
    if is_loose_payload(rel) {
        EntryPair::new(entry, entry_file_name(rel))
    } else {
        EntryPair::new(entry, rel)
    }
}

/// Backend of an option: Yumia as soon as any Yumia payload is present.
fn option_kind(files: &[EntryPair]) -> Backend {
    if files.iter().any(|f| is_yumia_payload(&f.archive_path)) {
        Backend::Yumia
    } else {
        Backend::Loose
    }
}

fn files_under<'a>(files: &[&'a str], dir: &str) -> Vec<(&'a str, &'a str)> {
    let prefix = format!("{dir}/");
    files
        .iter()
        .filter_map(|e| {
            let rel = e.strip_prefix(prefix.as_str())?;
            (!rel.is_empty()).then_some((*e, rel))
        })
        .collect()
}

fn manifest_layout(manifest: ModManifest, files: &[&str]) -> ManifestLayout {
    let common = manifest.common_files_dir.as_deref().and_then(|dir| {
        let pairs: Vec<EntryPair> = files_under(files, dir)
            .into_iter()
            .filter(|(_, rel)| is_payload(rel))
            .map(|(entry, rel)| install_pair(entry, rel))
            .collect();
        (!pairs.is_empty()).then(|| ArchiveOption {
            label: dir.to_string(),
            kind: option_kind(&pairs),
            files: pairs,
            feature_name: None,
            optional: false,
        })
    });

    let features = manifest
        .features
        .iter()
        .map(|feature| {
            let under = files_under(files, &feature.directory);
            let mut labels: Vec<&str> = under
                .iter()
                .filter_map(|(_, rel)| rel.split_once('/').map(|(head, _)| head))
                .filter(|head| !head.is_empty())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            labels.sort_by(|a, b| label_order(a, b));

            let choices = labels
                .into_iter()
                .map(|label| {
                    let choice_dir = format!("{}/{}", feature.directory, label);
                    let pairs: Vec<EntryPair> = files_under(files, &choice_dir)
                        .into_iter()
                        .filter(|(_, rel)| is_payload(rel))
                        .map(|(entry, rel)| install_pair(entry, rel))
                        .collect();
                    ArchiveOption {
                        label: label.to_string(),
                        kind: option_kind(&pairs),
                        files: pairs,
                        feature_name: Some(feature.name.clone()),
                        optional: feature.optional,
                    }
                })
                .collect();

            FeatureGroup {
                name: feature.name.clone(),
                directory: feature.directory.clone(),
                optional: feature.optional,
                choices,
            }
        })
        .collect();

    ManifestLayout {
        manifest,
        common,
        features,
    }
}

/// One option per distinct `.../package/` prefix.
fn package_dir_options(files: &[&str]) -> Vec<ArchiveOption> {
    // prefix -> label
    let mut prefixes: BTreeMap<String, String> = BTreeMap::new();
    for entry in files {
        let parts: Vec<&str> = entry.split('/').collect();
        let Some(idx) = parts[..parts.len().saturating_sub(1)]
            .iter()
            .position(|part| part.eq_ignore_ascii_case("package"))
        else {
            continue;
        };
        let prefix = format!("{}/", parts[..=idx].join("/"));
        let label = if idx == 0 {
            DEFAULT_OPTION_LABEL.to_string()
        } else {
            parts[idx - 1].to_string()
        };
        prefixes.entry(prefix).or_insert(label);
    }

    let mut options: Vec<ArchiveOption> = prefixes
        .into_iter()
        .map(|(prefix, label)| {
            let pairs: Vec<EntryPair> = files
                .iter()
                .filter_map(|e| {
                    let rel = e.strip_prefix(prefix.as_str())?;
                    (!rel.is_empty()).then(|| EntryPair::new(*e, rel))
                })
                .collect();
            ArchiveOption {
                label,
                kind: Backend::Yumia,
                files: pairs,
                feature_name: None,
                optional: false,
            }
        })
        .collect();
    options.sort_by(|a, b| label_order(&a.label, &b.label));
    options
}

fn direct_loose_layout(files: &[&str]) -> Option<DirectLooseLayout> {
    let mut common = Vec::new();
    let mut groups: BTreeMap<&str, Vec<EntryPair>> = BTreeMap::new();

    for entry in files.iter().filter(|e| is_loose_payload(e)) {
        let pair = EntryPair::new(*entry, entry_file_name(entry));
        match entry.split_once('/') {
            None => common.push(pair),
            Some((group, _)) => groups.entry(group).or_default().push(pair),
        }
    }

    if common.is_empty() && groups.is_empty() {
        return None;
    }

    let default_option = |files: Vec<EntryPair>| ArchiveOption {
        label: DEFAULT_OPTION_LABEL.to_string(),
        kind: Backend::Loose,
        files,
        feature_name: None,
        optional: false,
    };

    if groups.len() <= 1 {
        // A single wrapping folder (or none) is not a real choice.
        let mut seen = BTreeSet::new();
        let files: Vec<EntryPair> = common
            .iter()
            .cloned()
            .chain(groups.into_values().flatten())
            .filter(|pair| seen.insert(pair.archive_path.clone()))
            .collect();
        return Some(DirectLooseLayout {
            common,
            components: vec![default_option(files)],
            multi_select: false,
        });
    }

    let mut components: Vec<ArchiveOption> = groups
        .into_iter()
        .map(|(label, files)| ArchiveOption {
            label: label.to_string(),
            kind: Backend::Loose,
            files,
            feature_name: None,
            optional: true,
        })
        .collect();
    components.sort_by(|a, b| label_order(&a.label, &b.label));

    Some(DirectLooseLayout {
        common,
        components,
        multi_select: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_loose_payload_pattern() {
        assert!(is_loose_payload("0x1A2B3C4D.g1t"));
        assert!(is_loose_payload("Red/1a2b3c4d.kidsobjdb"));
        assert!(!is_loose_payload("0x1A2B3C4D.fdata"));
        assert!(!is_loose_payload("readme.txt"));
        assert!(!is_loose_payload("0x1A2B3C.g1t"));
        assert!(!is_loose_payload("0x1A2B3C4D.g1t.bak"));
    }

    #[test]
    fn test_nested_package_label_is_parent() {
        let entries = names(&[
            "Mod/Red/package/a.fdata",
            "Mod/Red/package/a.yumiamod.json",
            "Mod/Blue/package/a.fdata",
        ]);
        let ArchiveLayout::LegacyYumia(options) = classify(&entries, None).unwrap() else {
            panic!("expected legacy yumia");
        };
        let labels: Vec<_> = options.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, vec!["Blue", "Red"]);
        assert_eq!(options[1].files[1].install_path, "a.yumiamod.json");
    }

    #[test]
    fn test_file_named_package_is_not_a_dir() {
        let entries = names(&["package"]);
        assert_eq!(
            classify(&entries, None).unwrap_err(),
            ClassifyError::NoRecognizedLayout
        );
    }

    #[test]
    fn test_broken_manifest_does_not_fall_through() {
        let entries = names(&[MANIFEST_FILENAME, "package/a.fdata"]);
        let err = classify(&entries, Some(b"{not json")).unwrap_err();
        assert!(matches!(err, ClassifyError::InvalidManifest(ManifestError::Json(_))));
    }

    #[test]
    fn test_single_wrapper_dedupes_common() {
        let entries = names(&["0x00000001.g1t", "Wrap/0x00000002.g1t"]);
        let ArchiveLayout::DirectLoose(layout) = classify(&entries, None).unwrap() else {
            panic!("expected direct loose");
        };
        assert!(!layout.multi_select);
        assert_eq!(layout.components.len(), 1);
        assert_eq!(layout.components[0].files.len(), 2);
        assert_eq!(layout.common.len(), 1);
    }
}
