//! Conversion of selected archive entries into LooseFileLoader files.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::models::EntryPair;

use super::archive::{ArchiveError, ArchiveSource};
use super::classifier::{entry_file_name, is_fdata, is_loose_payload, is_sidecar};
use super::fdata::{self, FdataError, YumiaSidecar};

const FALLBACK_MOD_DIR: &str = "ConvertedMod";

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("{entry}: {source}")]
    Fdata {
        entry: String,
        #[source]
        source: FdataError,
    },

    #[error("loose filename collision: {filename} from {second} duplicates {first}")]
    Collision {
        filename: String,
        first: String,
        second: String,
    },

    #[error("no installable loose payloads in the selection")]
    NoPayloads,
}

/// One file destined for `<game_root>/mods/<dir>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LooseFile {
    pub filename: String,
    /// Archive entry the file came from.
    pub source: String,
    pub data: Vec<u8>,
}

/// Folder name for a mod under `mods/`, safe on Windows.
pub fn sanitize_mod_dir_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect();
    let cleaned = replaced.trim().trim_end_matches('.');
    if cleaned.is_empty() {
        FALLBACK_MOD_DIR.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Expand the selected entries into flat loose files.
///
/// `.fdata` containers are unpacked (named through their sibling
/// `.yumiamod.json` when it is part of the selection), hashed loose assets
/// pass through, everything else is ignored. Two outputs with the same
/// case-insensitive name collapse when their bytes match and are a
/// [`ConvertError::Collision`] otherwise.
pub fn convert_to_loose(
    archive: &mut dyn ArchiveSource,
    entries: &[EntryPair],
) -> Result<Vec<LooseFile>, ConvertError> {
    let selected: HashSet<&str> = entries.iter().map(|e| e.archive_path.as_str()).collect();
    let mut files: Vec<LooseFile> = Vec::new();
    // lowercase filename -> index into files
    let mut seen: HashMap<String, usize> = HashMap::new();

    let mut push = |file: LooseFile, files: &mut Vec<LooseFile>| -> Result<(), ConvertError> {
        let key = file.filename.to_lowercase();
        if let Some(&idx) = seen.get(&key) {
            let existing = &files[idx];
            if existing.data == file.data {
                tracing::debug!(
                    "Skipping identical duplicate {} from {}",
                    file.filename,
                    file.source
                );
                return Ok(());
            }
            return Err(ConvertError::Collision {
                filename: file.filename,
                first: existing.source.clone(),
                second: file.source,
            });
        }
        seen.insert(key, files.len());
        files.push(file);
        Ok(())
    };

    for pair in entries {
        let entry = pair.archive_path.as_str();
        if is_sidecar(entry) {
            continue;
        }

        if is_fdata(entry) {
            let data = archive.read_entry(entry)?;
            let sidecar_entry = format!("{}.yumiamod.json", &entry[..entry.len() - ".fdata".len()]);
            let sidecar = if selected.contains(sidecar_entry.as_str()) {
                let raw = archive.read_entry(&sidecar_entry)?;
                YumiaSidecar::parse(&raw).map_err(|source| ConvertError::Fdata {
                    entry: sidecar_entry.clone(),
                    source,
                })?
            } else {
                YumiaSidecar::default()
            };

            let fdata_err = |source| ConvertError::Fdata {
                entry: entry.to_string(),
                source,
            };
            for item in fdata::scan_entries(&data).map_err(fdata_err)? {
                let payload = fdata::read_entry(&data, item.offset).map_err(fdata_err)?;
                let filename = sidecar
                    .filename_for(&item)
                    .map(str::to_string)
                    .unwrap_or_else(|| item.default_filename());
                push(
                    LooseFile {
                        filename,
                        source: entry.to_string(),
                        data: payload,
                    },
                    &mut files,
                )?;
            }
            continue;
        }

        if is_loose_payload(entry) {
            let data = archive.read_entry(entry)?;
            push(
                LooseFile {
                    filename: entry_file_name(entry).to_string(),
                    source: entry.to_string(),
                    data,
                },
                &mut files,
            )?;
        }
    }

    if files.is_empty() {
        return Err(ConvertError::NoPayloads);
    }
    tracing::debug!("Converted {} entries into {} loose files", entries.len(), files.len());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_mod_dir_name() {
        assert_eq!(sanitize_mod_dir_name("Cool: Mod?"), "Cool_ Mod_");
        assert_eq!(sanitize_mod_dir_name("  trailing... "), "trailing");
        assert_eq!(sanitize_mod_dir_name("..."), FALLBACK_MOD_DIR);
        assert_eq!(sanitize_mod_dir_name("a/b\\c"), "a_b_c");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
