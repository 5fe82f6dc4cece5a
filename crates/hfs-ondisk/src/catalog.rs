//! Catalog keys and records.
//!
//! | Record | Type | Size |
//! |--------|------|------|
//! | Folder | 1 | 88 |
//! | File | 2 | 248 |
//! | Folder thread | 3 | 10 + 2 * name length |
//! | File thread | 4 | 10 + 2 * name length |

use crate::volume::{FORK_DATA_SIZE, ForkData};
use hfs_types::{
    Cnid, ParseError, ensure_slice, read_be_u16, read_be_u32, read_fixed, write_be_u16,
    write_be_u32,
};
use serde::{Deserialize, Serialize};

/// Longest node name in UTF-16 code units.
pub const MAX_NAME_UNITS: usize = 255;
/// `keyLength` of the largest catalog key (excluding the length field).
pub const CATALOG_KEY_MAX_LENGTH: u16 = 6 + 2 * 255;
/// Smallest legal catalog `keyLength`.
pub const CATALOG_KEY_MIN_LENGTH: u16 = 6;

pub const RECORD_FOLDER: u16 = 1;
pub const RECORD_FILE: u16 = 2;
pub const RECORD_FOLDER_THREAD: u16 = 3;
pub const RECORD_FILE_THREAD: u16 = 4;

pub const FOLDER_RECORD_SIZE: usize = 88;
pub const FILE_RECORD_SIZE: usize = 248;
pub const THREAD_RECORD_BASE_SIZE: usize = 10;

/// Offset of the data fork inside a file record.
pub const FILE_DATA_FORK_OFFSET: usize = 88;
/// Offset of the resource fork inside a file record.
pub const FILE_RSRC_FORK_OFFSET: usize = FILE_DATA_FORK_OFFSET + FORK_DATA_SIZE;

// ── Names ──────────────────────────────────────────────────────────────────

/// `HFSUniStr255`: a UTF-16 name of at most 255 code units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UniName(Vec<u16>);

impl UniName {
    pub fn from_units(units: Vec<u16>) -> Result<Self, ParseError> {
        if units.len() > MAX_NAME_UNITS {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "longer than 255 UTF-16 units",
            });
        }
        Ok(Self(units))
    }

    pub fn from_str_lossless(name: &str) -> Result<Self, ParseError> {
        Self::from_units(name.encode_utf16().collect())
    }

    #[must_use]
    pub fn units(&self) -> &[u16] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encoded size: length field plus units.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        2 + 2 * self.0.len()
    }

    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let len = usize::from(read_be_u16(data, offset)?);
        let body = ensure_slice(data, offset + 2, len * 2)?;
        let units = body
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Self::from_units(units)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        // len <= 255 enforced at construction
        let len = u16::try_from(self.0.len()).unwrap_or(u16::MAX);
        out.extend_from_slice(&len.to_be_bytes());
        for unit in &self.0 {
            out.extend_from_slice(&unit.to_be_bytes());
        }
    }
}

impl std::fmt::Display for UniName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf16_lossy(&self.0))
    }
}

// ── Key ────────────────────────────────────────────────────────────────────

/// `(parentID, nodeName)` key of the catalog tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub parent_id: Cnid,
    pub name: UniName,
}

impl CatalogKey {
    #[must_use]
    pub fn new(parent_id: Cnid, name: UniName) -> Self {
        Self { parent_id, name }
    }

    /// Key of a thread record: the CNID with an empty name.
    #[must_use]
    pub fn thread(cnid: Cnid) -> Self {
        Self {
            parent_id: cnid,
            name: UniName::default(),
        }
    }

    /// Parse a key (including its `keyLength` prefix).
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let key_len = read_be_u16(data, 0)?;
        if key_len < CATALOG_KEY_MIN_LENGTH || key_len > CATALOG_KEY_MAX_LENGTH {
            return Err(ParseError::InvalidField {
                field: "catalog_key_length",
                reason: "out of range",
            });
        }
        ensure_slice(data, 0, 2 + usize::from(key_len))?;
        let parent_id = Cnid(read_be_u32(data, 2)?);
        let name = UniName::parse(data, 6)?;
        if 4 + name.encoded_len() != usize::from(key_len) {
            return Err(ParseError::InvalidField {
                field: "catalog_key_length",
                reason: "does not match name length",
            });
        }
        Ok(Self { parent_id, name })
    }

    /// Encode with the `keyLength` prefix.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let key_len = 4 + self.name.encoded_len();
        let mut out = Vec::with_capacity(2 + key_len);
        out.extend_from_slice(&u16::try_from(key_len).unwrap_or(u16::MAX).to_be_bytes());
        out.extend_from_slice(&self.parent_id.0.to_be_bytes());
        self.name.encode(&mut out);
        out
    }
}

// ── Records ────────────────────────────────────────────────────────────────

/// `HFSPlusBSDInfo`, carried opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    pub special: u32,
}

impl BsdInfo {
    fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(data, offset, 16)?;
        Ok(Self {
            owner_id: read_be_u32(data, offset)?,
            group_id: read_be_u32(data, offset + 4)?,
            admin_flags: data[offset + 8],
            owner_flags: data[offset + 9],
            file_mode: read_be_u16(data, offset + 10)?,
            special: read_be_u32(data, offset + 12)?,
        })
    }

    fn encode(&self, out: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_be_u32(out, offset, self.owner_id)?;
        write_be_u32(out, offset + 4, self.group_id)?;
        out[offset + 8] = self.admin_flags;
        out[offset + 9] = self.owner_flags;
        write_be_u16(out, offset + 10, self.file_mode)?;
        write_be_u32(out, offset + 12, self.special)
    }
}

/// Dates shared by folder and file records, HFS epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogDates {
    pub create: u32,
    pub content_mod: u32,
    pub attribute_mod: u32,
    pub access: u32,
    pub backup: u32,
}

impl CatalogDates {
    #[must_use]
    pub fn all(at: u32) -> Self {
        Self {
            create: at,
            content_mod: at,
            attribute_mod: at,
            access: at,
            backup: 0,
        }
    }

    fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            create: read_be_u32(data, offset)?,
            content_mod: read_be_u32(data, offset + 4)?,
            attribute_mod: read_be_u32(data, offset + 8)?,
            access: read_be_u32(data, offset + 12)?,
            backup: read_be_u32(data, offset + 16)?,
        })
    }

    fn encode(&self, out: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_be_u32(out, offset, self.create)?;
        write_be_u32(out, offset + 4, self.content_mod)?;
        write_be_u32(out, offset + 8, self.attribute_mod)?;
        write_be_u32(out, offset + 12, self.access)?;
        write_be_u32(out, offset + 16, self.backup)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub flags: u16,
    pub valence: u32,
    pub folder_id: Cnid,
    pub dates: CatalogDates,
    pub bsd: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    pub folder_count: u32,
}

impl FolderRecord {
    #[must_use]
    pub fn new(folder_id: Cnid, now: u32) -> Self {
        Self {
            flags: 0,
            valence: 0,
            folder_id,
            dates: CatalogDates::all(now),
            bsd: BsdInfo::default(),
            user_info: [0; 16],
            finder_info: [0; 16],
            text_encoding: 0,
            folder_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub flags: u16,
    pub file_id: Cnid,
    pub dates: CatalogDates,
    pub bsd: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

impl FileRecord {
    #[must_use]
    pub fn new(file_id: Cnid, now: u32) -> Self {
        Self {
            flags: 0,
            file_id,
            dates: CatalogDates::all(now),
            bsd: BsdInfo::default(),
            user_info: [0; 16],
            finder_info: [0; 16],
            text_encoding: 0,
            data_fork: ForkData::default(),
            resource_fork: ForkData::default(),
        }
    }
}

/// Back-pointer from a CNID to its parent and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub parent_id: Cnid,
    pub name: UniName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogRecord {
    Folder(FolderRecord),
    File(FileRecord),
    FolderThread(ThreadRecord),
    FileThread(ThreadRecord),
}

impl CatalogRecord {
    /// Raw `recordType` of an encoded record.
    pub fn peek_type(data: &[u8]) -> Result<u16, ParseError> {
        read_be_u16(data, 0)
    }

    #[must_use]
    pub fn record_type(&self) -> u16 {
        match self {
            Self::Folder(_) => RECORD_FOLDER,
            Self::File(_) => RECORD_FILE,
            Self::FolderThread(_) => RECORD_FOLDER_THREAD,
            Self::FileThread(_) => RECORD_FILE_THREAD,
        }
    }

    /// CNID of a folder or file record.
    #[must_use]
    pub fn cnid(&self) -> Option<Cnid> {
        match self {
            Self::Folder(f) => Some(f.folder_id),
            Self::File(f) => Some(f.file_id),
            Self::FolderThread(_) | Self::FileThread(_) => None,
        }
    }

    #[must_use]
    pub fn is_thread(&self) -> bool {
        matches!(self, Self::FolderThread(_) | Self::FileThread(_))
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        match Self::peek_type(data)? {
            RECORD_FOLDER => {
                ensure_slice(data, 0, FOLDER_RECORD_SIZE)?;
                Ok(Self::Folder(FolderRecord {
                    flags: read_be_u16(data, 2)?,
                    valence: read_be_u32(data, 4)?,
                    folder_id: Cnid(read_be_u32(data, 8)?),
                    dates: CatalogDates::parse(data, 12)?,
                    bsd: BsdInfo::parse(data, 32)?,
                    user_info: read_fixed::<16>(data, 48)?,
                    finder_info: read_fixed::<16>(data, 64)?,
                    text_encoding: read_be_u32(data, 80)?,
                    folder_count: read_be_u32(data, 84)?,
                }))
            }
            RECORD_FILE => {
                ensure_slice(data, 0, FILE_RECORD_SIZE)?;
                Ok(Self::File(FileRecord {
                    flags: read_be_u16(data, 2)?,
                    file_id: Cnid(read_be_u32(data, 8)?),
                    dates: CatalogDates::parse(data, 12)?,
                    bsd: BsdInfo::parse(data, 32)?,
                    user_info: read_fixed::<16>(data, 48)?,
                    finder_info: read_fixed::<16>(data, 64)?,
                    text_encoding: read_be_u32(data, 80)?,
                    data_fork: ForkData::parse(data, FILE_DATA_FORK_OFFSET)?,
                    resource_fork: ForkData::parse(data, FILE_RSRC_FORK_OFFSET)?,
                }))
            }
            kind @ (RECORD_FOLDER_THREAD | RECORD_FILE_THREAD) => {
                let thread = ThreadRecord {
                    parent_id: Cnid(read_be_u32(data, 4)?),
                    name: UniName::parse(data, 8)?,
                };
                Ok(if kind == RECORD_FOLDER_THREAD {
                    Self::FolderThread(thread)
                } else {
                    Self::FileThread(thread)
                })
            }
            _ => Err(ParseError::InvalidField {
                field: "catalog_record_type",
                reason: "unknown record type",
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        match self {
            Self::Folder(f) => {
                let mut out = vec![0_u8; FOLDER_RECORD_SIZE];
                write_be_u16(&mut out, 0, RECORD_FOLDER)?;
                write_be_u16(&mut out, 2, f.flags)?;
                write_be_u32(&mut out, 4, f.valence)?;
                write_be_u32(&mut out, 8, f.folder_id.0)?;
                f.dates.encode(&mut out, 12)?;
                f.bsd.encode(&mut out, 32)?;
                out[48..64].copy_from_slice(&f.user_info);
                out[64..80].copy_from_slice(&f.finder_info);
                write_be_u32(&mut out, 80, f.text_encoding)?;
                write_be_u32(&mut out, 84, f.folder_count)?;
                Ok(out)
            }
            Self::File(f) => {
                let mut out = vec![0_u8; FILE_RECORD_SIZE];
                write_be_u16(&mut out, 0, RECORD_FILE)?;
                write_be_u16(&mut out, 2, f.flags)?;
                write_be_u32(&mut out, 8, f.file_id.0)?;
                f.dates.encode(&mut out, 12)?;
                f.bsd.encode(&mut out, 32)?;
                out[48..64].copy_from_slice(&f.user_info);
                out[64..80].copy_from_slice(&f.finder_info);
                write_be_u32(&mut out, 80, f.text_encoding)?;
                f.data_fork.encode(&mut out, FILE_DATA_FORK_OFFSET)?;
                f.resource_fork.encode(&mut out, FILE_RSRC_FORK_OFFSET)?;
                Ok(out)
            }
            Self::FolderThread(t) | Self::FileThread(t) => {
                let mut out = Vec::with_capacity(THREAD_RECORD_BASE_SIZE + 2 * t.name.len());
                out.extend_from_slice(&self.record_type().to_be_bytes());
                out.extend_from_slice(&0_u16.to_be_bytes());
                out.extend_from_slice(&t.parent_id.0.to_be_bytes());
                t.name.encode(&mut out);
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::ExtentDescriptor;
    use proptest::prelude::*;

    #[test]
    fn key_layout() {
        let key = CatalogKey::new(
            Cnid::ROOT_FOLDER,
            UniName::from_str_lossless("ab").expect("name"),
        );
        let bytes = key.encode();
        assert_eq!(bytes, vec![0, 10, 0, 0, 0, 2, 0, 2, 0, b'a', 0, b'b']);
        assert_eq!(CatalogKey::parse(&bytes).expect("parse"), key);
    }

    #[test]
    fn thread_key_has_empty_name() {
        let bytes = CatalogKey::thread(Cnid(99)).encode();
        assert_eq!(bytes.len(), 8);
        assert_eq!(read_be_u16(&bytes, 0).expect("len"), CATALOG_KEY_MIN_LENGTH);
    }

    #[test]
    fn key_length_mismatch_rejected() {
        let mut bytes = CatalogKey::new(Cnid(2), UniName::from_str_lossless("x").expect("name"))
            .encode();
        bytes[1] += 2;
        bytes.extend_from_slice(&[0, 0]);
        assert!(CatalogKey::parse(&bytes).is_err());
    }

    #[test]
    fn overlong_name_rejected() {
        assert!(UniName::from_units(vec![b'a'.into(); 256]).is_err());
        assert!(UniName::from_units(vec![b'a'.into(); 255]).is_ok());
    }

    #[test]
    fn folder_and_file_record_sizes() {
        let folder = CatalogRecord::Folder(FolderRecord::new(Cnid(20), 1000));
        let bytes = folder.encode().expect("encode");
        assert_eq!(bytes.len(), FOLDER_RECORD_SIZE);
        assert_eq!(CatalogRecord::parse(&bytes).expect("parse"), folder);

        let mut file = FileRecord::new(Cnid(21), 1000);
        file.data_fork.extents[0] = ExtentDescriptor::new(5, 3);
        file.data_fork.total_blocks = 3;
        let file = CatalogRecord::File(file);
        let bytes = file.encode().expect("encode");
        assert_eq!(bytes.len(), FILE_RECORD_SIZE);
        assert_eq!(read_be_u32(&bytes, FILE_DATA_FORK_OFFSET + 16).expect("start"), 5);
        assert_eq!(CatalogRecord::parse(&bytes).expect("parse"), file);
        assert_eq!(file.cnid(), Some(Cnid(21)));
    }

    #[test]
    fn thread_record_points_back() {
        let thread = CatalogRecord::FileThread(ThreadRecord {
            parent_id: Cnid(2),
            name: UniName::from_str_lossless("file.txt").expect("name"),
        });
        let bytes = thread.encode().expect("encode");
        assert_eq!(bytes.len(), THREAD_RECORD_BASE_SIZE + 16);
        let parsed = CatalogRecord::parse(&bytes).expect("parse");
        assert!(parsed.is_thread());
        assert_eq!(parsed, thread);
    }

    #[test]
    fn unknown_record_type_rejected() {
        let bytes = [0_u8, 9, 0, 0];
        assert!(CatalogRecord::parse(&bytes).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn key_length_tracks_name(parent in 1_u32.., units in proptest::collection::vec(any::<u16>(), 0..=255)) {
            let key = CatalogKey::new(Cnid(parent), UniName::from_units(units.clone()).expect("name"));
            let bytes = key.encode();
            prop_assert_eq!(bytes.len(), 8 + 2 * units.len());
            prop_assert_eq!(usize::from(read_be_u16(&bytes, 0).expect("len")), 6 + 2 * units.len());
            prop_assert_eq!(CatalogKey::parse(&bytes).expect("parse"), key);
        }
    }
}
