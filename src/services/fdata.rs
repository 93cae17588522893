//! Decoder for Yumia `.fdata` containers and their `.yumiamod.json` sidecars.
//!
//! An `.fdata` file is an optional 16-byte `PDRK0000` header followed by
//! 16-byte aligned `IDRK0000` entries:
//!
//! ```text
//! 0x00  magic "IDRK0000"
//! 0x08  u64 entry_size   (header + metadata + payload)
//! 0x10  u64 cmp_size
//! 0x18  u64 unc_size
//! 0x20  u32 type, u32 name_hash, u32 tkid_hash, u32 flags
//! 0x30  metadata (entry_size - cmp_size - 0x30 bytes), then payload
//! ```
//!
//! Compressed payloads are a sequence of zlib chunks, each prefixed with a
//! `u32` size when flag `0x100000` is set and with `u16` size + `u64` otherwise.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::read::ZlibDecoder;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use thiserror::Error;

const PDRK_MAGIC: &[u8; 8] = b"PDRK0000";
const IDRK_MAGIC: &[u8; 8] = b"IDRK0000";
const PDRK_HEADER_LEN: usize = 0x10;
const ENTRY_HEADER_LEN: u64 = 0x30;
const ENTRY_ALIGN: usize = 0x10;
const WIDE_CHUNK_FLAG: u32 = 0x100000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FdataError {
    #[error("truncated container: needed {needed} bytes at offset {offset:#x}")]
    Truncated { offset: usize, needed: usize },

    #[error("no IDRK entry at offset {0:#x}")]
    BadEntryMagic(usize),

    #[error("entry at {offset:#x} has inconsistent sizes")]
    BadEntrySize { offset: usize },

    #[error("zlib chunk at {offset:#x} failed to inflate: {reason}")]
    Inflate { offset: usize, reason: String },

    #[error("invalid yumiamod.json: {0}")]
    Sidecar(String),
}

/// Location and identity of one asset inside an `.fdata` container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdataEntry {
    pub offset: usize,
    pub name_hash: u32,
    pub tkid_hash: u32,
}

impl FdataEntry {
    /// `0x{NAME_HASH}.{ext}`, the name LooseFileLoader looks for.
    pub fn default_filename(&self) -> String {
        let ext = tkid_extension(self.tkid_hash)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:#x}", self.tkid_hash));
        format!("0x{:08X}.{}", self.name_hash, ext)
    }
}

fn slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], FdataError> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or(FdataError::Truncated { offset, needed: len })
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, FdataError> {
    let bytes = slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, FdataError> {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice(data, offset, 4)?);
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, FdataError> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice(data, offset, 8)?);
    Ok(u64::from_le_bytes(buf))
}

fn find_magic(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(IDRK_MAGIC.len())
        .position(|window| window == IDRK_MAGIC)
        .map(|pos| from + pos)
}

struct EntryHeader {
    entry_size: u64,
    cmp_size: u64,
    unc_size: u64,
    name_hash: u32,
    tkid_hash: u32,
    flags: u32,
    /// Bytes between the fixed header and the payload.
    metadata_size: u64,
}

fn read_header(data: &[u8], offset: usize) -> Result<EntryHeader, FdataError> {
    if slice(data, offset, 8)? != IDRK_MAGIC {
        return Err(FdataError::BadEntryMagic(offset));
    }
    let mut header = EntryHeader {
        entry_size: read_u64(data, offset + 0x08)?,
        cmp_size: read_u64(data, offset + 0x10)?,
        unc_size: read_u64(data, offset + 0x18)?,
        name_hash: read_u32(data, offset + 0x24)?,
        tkid_hash: read_u32(data, offset + 0x28)?,
        flags: read_u32(data, offset + 0x2C)?,
        metadata_size: 0,
    };
    header.metadata_size = header
        .entry_size
        .checked_sub(ENTRY_HEADER_LEN)
        .and_then(|rest| rest.checked_sub(header.cmp_size))
        .ok_or(FdataError::BadEntrySize { offset })?;
    Ok(header)
}

/// Walk every entry of a container, resynchronising on the magic after gaps.
pub fn scan_entries(data: &[u8]) -> Result<Vec<FdataEntry>, FdataError> {
    let mut pos = if data.starts_with(PDRK_MAGIC) {
        PDRK_HEADER_LEN
    } else {
        0
    };
    let mut entries: Vec<FdataEntry> = Vec::new();

    while pos < data.len() {
        let offset = if data.get(pos..pos + IDRK_MAGIC.len()) == Some(IDRK_MAGIC.as_slice()) {
            pos
        } else {
            match find_magic(data, pos.saturating_sub(0x18)) {
                Some(found) if entries.last().is_none_or(|last| found > last.offset) => found,
                _ => break,
            }
        };

        let header = read_header(data, offset)?;
        entries.push(FdataEntry {
            offset,
            name_hash: header.name_hash,
            tkid_hash: header.tkid_hash,
        });

        let entry_end = usize::try_from(header.entry_size)
            .ok()
            .and_then(|size| offset.checked_add(size))
            .ok_or(FdataError::BadEntrySize { offset })?;
        pos = entry_end.next_multiple_of(ENTRY_ALIGN);
    }

    Ok(entries)
}

/// Decode the payload of the entry at `offset`, inflating it when compressed.
pub fn read_entry(data: &[u8], offset: usize) -> Result<Vec<u8>, FdataError> {
    let header = read_header(data, offset)?;
    let bad_size = || FdataError::BadEntrySize { offset };

    let mut pos = usize::try_from(ENTRY_HEADER_LEN + header.metadata_size)
        .ok()
        .and_then(|skip| offset.checked_add(skip))
        .ok_or_else(bad_size)?;
    let unc_size = usize::try_from(header.unc_size).map_err(|_| bad_size())?;

    if header.cmp_size == header.unc_size {
        return Ok(slice(data, pos, unc_size)?.to_vec());
    }

    // Declared size is untrusted; cap the pre-allocation.
    let mut out = Vec::with_capacity(unc_size.min(data.len().saturating_mul(16)));
    while out.len() < unc_size {
        let zsize = if header.flags & WIDE_CHUNK_FLAG != 0 {
            let size = read_u32(data, pos)? as usize;
            pos += 4;
            size
        } else {
            let size = read_u16(data, pos)? as usize;
            // u16 size followed by an unused u64
            pos += 10;
            size
        };

        let chunk = slice(data, pos, zsize)?;
        let before = out.len();
        ZlibDecoder::new(chunk)
            .take((unc_size - before) as u64)
            .read_to_end(&mut out)
            .map_err(|e| FdataError::Inflate {
                offset: pos,
                reason: e.to_string(),
            })?;
        if out.len() == before {
            return Err(FdataError::Inflate {
                offset: pos,
                reason: "empty chunk".to_string(),
            });
        }
        pos += zsize;
    }
    out.truncate(unc_size);
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct SidecarEntry {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    name_hash: Option<u64>,
    #[serde(default)]
    tkid_hash: Option<u64>,
    #[serde(default)]
    f_extradata: Option<String>,
    #[serde(default)]
    r_extradata: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SidecarFile {
    #[serde(default)]
    files: Vec<SidecarEntry>,
}

/// Parsed `.yumiamod.json`: filename overrides and the asset hashes it replaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YumiaSidecar {
    filenames: HashMap<(u64, u64), String>,
    name_hashes: BTreeSet<u64>,
}

impl YumiaSidecar {
    pub fn parse(data: &[u8]) -> Result<Self, FdataError> {
        let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
        let raw: SidecarFile =
            serde_json::from_slice(data).map_err(|e| FdataError::Sidecar(e.to_string()))?;

        let mut sidecar = YumiaSidecar::default();
        for entry in raw.files {
            for extra in [&entry.f_extradata, &entry.r_extradata].into_iter().flatten() {
                BASE64
                    .decode(extra)
                    .map_err(|e| FdataError::Sidecar(format!("bad extradata: {e}")))?;
            }
            if let Some(name_hash) = entry.name_hash {
                sidecar.name_hashes.insert(name_hash);
            }
            if let (Some(name_hash), Some(tkid_hash), Some(filename)) =
                (entry.name_hash, entry.tkid_hash, entry.filename)
            {
                sidecar.filenames.insert((name_hash, tkid_hash), filename);
            }
        }
        Ok(sidecar)
    }

    pub fn filename_for(&self, entry: &FdataEntry) -> Option<&str> {
        self.filenames
            .get(&(u64::from(entry.name_hash), u64::from(entry.tkid_hash)))
            .map(String::as_str)
    }

    pub fn name_hashes(&self) -> &BTreeSet<u64> {
        &self.name_hashes
    }
}

/// File extension for a type id, as used by the game's loose file lookup.
pub fn tkid_extension(tkid: u32) -> Option<&'static str> {
    let ext = match tkid {
        0x0BD05B27 | 0x6DBD6EA6 => "mit",
        0x0D34474D => "srst",
        0x17614AF5 => "g1mx",
        0x1FDCAA40 => "kidstask",
        0x20A6A0BB => "kidsobjdb",
        0x27BC54B7 => "rigbin",
        0x4D0102AC => "g1em",
        0x4F16D0EF | 0xED410290 => "kts",
        0x5153729B | 0xB340861A => "mtl",
        0x54738C76 => "g1co",
        0x5599AA51 => "kscl",
        0x563BDEF1 => "g1m",
        0x56D8DEDA | 0x133D2C3B => "sid",
        0x5C3E543C => "swg",
        0x6FA91671 => "g1a",
        0x757347E0 => "bpo",
        0x786DCD84 => "g1n",
        0x79C724C2 => "g1p",
        0x7BCD279F => "g1s",
        0x82945A44 => "lsqtree",
        0x8E39AA37 | 0xBE144B78 => "ktid",
        0x9CB3A4B6 | 0xE6A3C3BB => "oidex",
        0xA027E46B => "mov",
        0xA8D88566 => "g1cox",
        0xAD57EBBA => "g1t_new",
        0xAFBEC60C => "g1t",
        0xB097D41F => "g1e",
        0xB0A14534 => "sgcbin",
        0xB1630F51 => "kidsrender",
        0xBBD39F2D => "srsa",
        0xBBF9B49D | 0x56EFE45C => "grp",
        0xBF6B52C7 => "name",
        0xD7F47FB1 => "efpl",
        0xDBCB74A9 | 0x1AB40AE8 => "oid",
        0xF13845EF => "sclshape",
        0xF20DE437 => "texinfo",
        0x1A6300FD => "g1es",
        0x2BCC0C02 => "g1frani",
        0x32AC9403 => "g1fpose",
        0x5B2970FC => "ktf2",
        _ => return None,
    };
    Some(ext)
}

/// Builders for synthetic containers, shared by unit and integration tests.
#[doc(hidden)]
pub mod testing {
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    use super::*;

    /// A stored (uncompressed) entry.
    pub fn stored_entry(name_hash: u32, tkid_hash: u32, payload: &[u8]) -> Vec<u8> {
        entry_bytes(name_hash, tkid_hash, 0, payload.len() as u64, payload)
    }

    /// A compressed entry made of one zlib chunk with a narrow (u16) size prefix.
    pub fn compressed_entry(name_hash: u32, tkid_hash: u32, payload: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).expect("in-memory write");
        let chunk = encoder.finish().expect("in-memory finish");

        let mut body = Vec::new();
        body.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes());
        body.extend_from_slice(&chunk);
        entry_bytes(name_hash, tkid_hash, 0, payload.len() as u64, &body)
    }

    fn entry_bytes(name_hash: u32, tkid_hash: u32, flags: u32, unc_size: u64, body: &[u8]) -> Vec<u8> {
        let cmp_size = body.len() as u64;
        let mut out = Vec::new();
        out.extend_from_slice(IDRK_MAGIC);
        out.extend_from_slice(&(ENTRY_HEADER_LEN + cmp_size).to_le_bytes());
        out.extend_from_slice(&cmp_size.to_le_bytes());
        out.extend_from_slice(&unc_size.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&name_hash.to_le_bytes());
        out.extend_from_slice(&tkid_hash.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(body);
        out.resize(out.len().next_multiple_of(ENTRY_ALIGN), 0);
        out
    }

    /// A `PDRK` container holding `entries` back to back.
    pub fn container(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(PDRK_MAGIC);
        out.resize(PDRK_HEADER_LEN, 0);
        for entry in entries {
            out.extend_from_slice(entry);
        }
        out
    }
}
