//! Read-only access to mod archives.
//!
//! `.zip` goes through the `zip` crate and `.7z` through `sevenz-rust`.
//! `.rar` has no maintained pure-Rust reader, so it shells out to a `7z`
//! binary on `PATH`.

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::process::Command;
use thiserror::Error;

use super::classifier::normalize_entry;

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["zip", "7z", "rar"];

const SEVEN_ZIP_BIN: &str = "7z";

/// Upper bound on buffer pre-allocation from a size the archive declares.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(Utf8PathBuf),

    #[error("failed to open {path}: {source}")]
    Open {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read zip {path}: {source}")]
    Zip {
        path: Utf8PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("failed to read 7z {path}: {reason}")]
    SevenZip { path: Utf8PathBuf, reason: String },

    #[error("7-Zip ({SEVEN_ZIP_BIN}) is needed to read {path}: {reason}")]
    External { path: Utf8PathBuf, reason: String },

    #[error("{entry} not found in {path}")]
    MissingEntry { path: Utf8PathBuf, entry: String },
}

/// An opened archive.
///
/// Entry names are normalised to forward slashes; directories end with `/`.
pub trait ArchiveSource: Send {
    fn path(&self) -> &Utf8Path;

    fn list_entries(&mut self) -> Result<Vec<String>, ArchiveError>;

    fn read_entry(&mut self, entry: &str) -> Result<Vec<u8>, ArchiveError>;
}

/// Whether the file extension is one the manager can open.
pub fn is_supported_archive(path: &Utf8Path) -> bool {
    path.extension()
        .map(|ext| SUPPORTED_EXTENSIONS.iter().any(|s| ext.eq_ignore_ascii_case(s)))
        .unwrap_or(false)
}

/// Open an archive by its extension.
pub fn open_archive(path: &Utf8Path) -> Result<Box<dyn ArchiveSource>, ArchiveError> {
    let ext = path.extension().map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("zip") => Ok(Box::new(ZipSource::open(path)?)),
        Some("7z") => Ok(Box::new(SevenZipSource {
            path: path.to_owned(),
        })),
        Some("rar") => Ok(Box::new(ExternalSource {
            path: path.to_owned(),
        })),
        _ => Err(ArchiveError::UnsupportedFormat(path.to_owned())),
    }
}

/// List an archive and read its root manifest in one go.
pub fn list_with_manifest(
    archive: &mut dyn ArchiveSource,
) -> Result<(Vec<String>, Option<Vec<u8>>), ArchiveError> {
    let entries = archive.list_entries()?;
    let manifest = match super::classifier::root_manifest_entry(&entries) {
        Some(name) => {
            let name = name.to_string();
            Some(archive.read_entry(&name)?)
        }
        None => None,
    };
    Ok((entries, manifest))
}

struct ZipSource {
    path: Utf8PathBuf,
    archive: zip::ZipArchive<BufReader<File>>,
    /// normalised name -> index
    index: HashMap<String, usize>,
    names: Vec<String>,
}

impl ZipSource {
    fn open(path: &Utf8Path) -> Result<Self, ArchiveError> {
        let file = File::open(path).map_err(|source| ArchiveError::Open {
            path: path.to_owned(),
            source,
        })?;
        let zip_err = |source| ArchiveError::Zip {
            path: path.to_owned(),
            source,
        };
        let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(zip_err)?;

        let mut names = Vec::with_capacity(archive.len());
        let mut index = HashMap::with_capacity(archive.len());
        for i in 0..archive.len() {
            let name = normalize_entry(archive.by_index_raw(i).map_err(zip_err)?.name());
            index.insert(name.clone(), i);
            names.push(name);
        }

        Ok(Self {
            path: path.to_owned(),
            archive,
            index,
            names,
        })
    }
}

impl ArchiveSource for ZipSource {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn list_entries(&mut self) -> Result<Vec<String>, ArchiveError> {
        Ok(self.names.clone())
    }

    fn read_entry(&mut self, entry: &str) -> Result<Vec<u8>, ArchiveError> {
        let idx = *self
            .index
            .get(entry)
            .ok_or_else(|| ArchiveError::MissingEntry {
                path: self.path.clone(),
                entry: entry.to_string(),
            })?;
        let mut file = self
            .archive
            .by_index(idx)
            .map_err(|source| ArchiveError::Zip {
                path: self.path.clone(),
                source,
            })?;
        let mut buf = Vec::with_capacity(file.size().min(MAX_PREALLOC) as usize);
        file.read_to_end(&mut buf)
            .map_err(|source| ArchiveError::Open {
                path: self.path.clone(),
                source,
            })?;
        Ok(buf)
    }
}

/// Re-opened per call; solid 7z blocks are decoded sequentially anyway.
struct SevenZipSource {
    path: Utf8PathBuf,
}

impl SevenZipSource {
    fn reader(&self) -> Result<sevenz_rust::SevenZReader<File>, ArchiveError> {
        sevenz_rust::SevenZReader::open(self.path.as_std_path(), sevenz_rust::Password::empty())
            .map_err(|e| ArchiveError::SevenZip {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }
}

impl ArchiveSource for SevenZipSource {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn list_entries(&mut self) -> Result<Vec<String>, ArchiveError> {
        let reader = self.reader()?;
        Ok(reader
            .archive()
            .files
            .iter()
            .map(|entry| {
                let name = normalize_entry(entry.name());
                if entry.is_directory() && !name.ends_with('/') {
                    format!("{name}/")
                } else {
                    name
                }
            })
            .collect())
    }

    fn read_entry(&mut self, entry: &str) -> Result<Vec<u8>, ArchiveError> {
        let mut reader = self.reader()?;
        let mut found: Option<Vec<u8>> = None;
        let mut read_error: Option<std::io::Error> = None;

        reader
            .for_each_entries(|item, data| {
                if normalize_entry(item.name()) != entry {
                    return Ok(true);
                }
                let mut buf = Vec::new();
                match data.read_to_end(&mut buf) {
                    Ok(_) => found = Some(buf),
                    Err(e) => read_error = Some(e),
                }
                Ok(false)
            })
            .map_err(|e| ArchiveError::SevenZip {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if let Some(source) = read_error {
            return Err(ArchiveError::Open {
                path: self.path.clone(),
                source,
            });
        }
        found.ok_or_else(|| ArchiveError::MissingEntry {
            path: self.path.clone(),
            entry: entry.to_string(),
        })
    }
}

/// Formats read through the `7z` command line tool.
struct ExternalSource {
    path: Utf8PathBuf,
}

impl ExternalSource {
    fn run(&self, args: &[&str]) -> Result<Vec<u8>, ArchiveError> {
        let output = Command::new(SEVEN_ZIP_BIN)
            .args(args)
            .arg(self.path.as_str())
            .output()
            .map_err(|e| ArchiveError::External {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ArchiveError::External {
                path: self.path.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl ArchiveSource for ExternalSource {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn list_entries(&mut self) -> Result<Vec<String>, ArchiveError> {
        let stdout = self.run(&["l", "-slt"])?;
        Ok(parse_slt_listing(&String::from_utf8_lossy(&stdout)))
    }

    fn read_entry(&mut self, entry: &str) -> Result<Vec<u8>, ArchiveError> {
        // The listing was normalised to '/', 7z matches either separator.
        let output = Command::new(SEVEN_ZIP_BIN)
            .args(["x", "-so", "-y"])
            .arg(self.path.as_str())
            .arg(entry)
            .output()
            .map_err(|e| ArchiveError::External {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() || output.stdout.is_empty() && !output.stderr.is_empty() {
            return Err(ArchiveError::MissingEntry {
                path: self.path.clone(),
                entry: entry.to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Parse `7z l -slt` technical listing output into entry names.
fn parse_slt_listing(listing: &str) -> Vec<String> {
    let Some((_, body)) = listing.split_once("----------") else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    let mut path: Option<String> = None;
    let mut is_dir = false;

    let mut flush = |path: &mut Option<String>, is_dir: &mut bool| {
        if let Some(p) = path.take() {
            let name = normalize_entry(&p);
            if *is_dir {
                entries.push(format!("{}/", name.trim_end_matches('/')));
            } else {
                entries.push(name);
            }
        }
        *is_dir = false;
    };

    for line in body.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            flush(&mut path, &mut is_dir);
            continue;
        }
        if let Some(value) = line.strip_prefix("Path = ") {
            flush(&mut path, &mut is_dir);
            path = Some(value.to_string());
        } else if line == "Folder = +" {
            is_dir = true;
        } else if let Some(attrs) = line.strip_prefix("Attributes = ") {
            if attrs.starts_with('D') {
                is_dir = true;
            }
        }
    }
    flush(&mut path, &mut is_dir);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_archive(Utf8Path::new("mod.ZIP")));
        assert!(is_supported_archive(Utf8Path::new("mod.7z")));
        assert!(is_supported_archive(Utf8Path::new("mod.rar")));
        assert!(!is_supported_archive(Utf8Path::new("mod.tar.gz")));
        assert!(!is_supported_archive(Utf8Path::new("mod")));
    }

    #[test]
    fn test_zip_backslash_names_are_normalised() {
        let temp = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(temp.path().join("m.zip")).unwrap();
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        writer
            .start_file("Red\\package\\a.fdata", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"payload").unwrap();
        writer.finish().unwrap();

        let mut archive = open_archive(&path).unwrap();
        assert_eq!(archive.list_entries().unwrap(), vec!["Red/package/a.fdata"]);
        assert_eq!(archive.read_entry("Red/package/a.fdata").unwrap(), b"payload");
        assert!(matches!(
            archive.read_entry("missing"),
            Err(ArchiveError::MissingEntry { .. })
        ));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let err = open_archive(Utf8Path::new("/tmp/mod.tar")).err().unwrap();
        assert!(matches!(err, ArchiveError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_parse_slt_listing() {
        let listing = "\
7-Zip 23.01

--
Path = mod.rar
Type = Rar5

----------
Path = Red
Folder = +

Path = Red\\package\\a.fdata
Folder = -
Size = 10

Path = 0x12345678.g1t
Attributes = A
";
        assert_eq!(
            parse_slt_listing(listing),
            vec!["Red/", "Red/package/a.fdata", "0x12345678.g1t"]
        );
    }
}
