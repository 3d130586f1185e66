// FVE metadata block parsing: walks the three redundant copies, validates
// each, and picks the one with the highest sequence number. Keeps the raw
// byte range of every entry alongside its parsed form (the "tagged metadata
// entries" design note) instead of discarding anything unrecognized.

use crate::binary::{read_utf16le_string, Cursor, FileTime, Guid};
use crate::error::{BdeError, ErrorKind, Result};
use crate::source::ByteSource;

const FVE_MAGIC: &[u8; 8] = b"-FVE-FS-";
// Outer header: size(4) + header_size(2) + version(2) + magic(8) +
// integrity_field(8) + volume_guid(16) + sequence_number(8) +
// encrypted_volume_size(8) + converted_area_length(8).
const FVE_HEADER_LEN: usize = 64;
// Offset within the block at which the integrity field covers the rest.
const INTEGRITY_FIELD_COVERAGE_START: usize = 24;

/// Recognized metadata-entry `type` field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Property,
    VolumeMasterKey,
    FullVolumeEncryptionKey,
    Validation,
    StartupKey,
    Description,
    VolumeHeaderBlock,
    Unknown(u16),
}

impl EntryType {
    fn from_raw(raw: u16) -> Self {
        match raw {
            0x0000 => EntryType::Property,
            0x0002 => EntryType::VolumeMasterKey,
            0x0003 => EntryType::FullVolumeEncryptionKey,
            0x0004 => EntryType::Validation,
            0x0006 => EntryType::StartupKey,
            0x0007 => EntryType::Description,
            0x000f => EntryType::VolumeHeaderBlock,
            other => EntryType::Unknown(other),
        }
    }
}

/// Recognized metadata-entry `value_type` field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Erased,
    Key,
    UnicodeString,
    StretchKey,
    UseKey,
    AesCcmEncrypted,
    TpmEncodedBlob,
    ValidationInfo,
    VolumeMasterKey,
    ExternalKey,
    Update,
    ErrorLog,
    OffsetAndSize,
    Unknown(u16),
}

impl ValueType {
    fn from_raw(raw: u16) -> Self {
        match raw {
            0x0000 => ValueType::Erased,
            0x0001 => ValueType::Key,
            0x0002 => ValueType::UnicodeString,
            0x0003 => ValueType::StretchKey,
            0x0004 => ValueType::UseKey,
            0x0005 => ValueType::AesCcmEncrypted,
            0x0006 => ValueType::TpmEncodedBlob,
            0x0007 => ValueType::ValidationInfo,
            0x0008 => ValueType::VolumeMasterKey,
            0x0009 => ValueType::ExternalKey,
            0x000a => ValueType::Update,
            0x000b => ValueType::ErrorLog,
            0x000f => ValueType::OffsetAndSize,
            other => ValueType::Unknown(other),
        }
    }
}

/// One metadata entry: `{ size, type, value_type, version, data }`, plus the
/// nested entries carved out of `data` when the value type is a container
/// (a key protector's `stretch-key`/`aes-ccm-encrypted` children).
#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub entry_type: EntryType,
    pub value_type: ValueType,
    pub version: u16,
    pub data: Vec<u8>,
    pub nested: Vec<MetadataEntry>,
}

/// One AES-CCM-encrypted blob as laid out inside a metadata entry's payload:
/// `{ nonce[12], mac[16], ciphertext[...] }`.
pub struct AesCcmBlob<'a> {
    pub nonce: [u8; 12],
    pub mac: [u8; 16],
    pub ciphertext: &'a [u8],
}

/// A parsed `stretch-key` entry: the encryption method and salt it declares,
/// plus the nested AES-CCM-wrapped key blob that follows them.
pub struct StretchKeyInfo<'a> {
    pub encryption_method: u16,
    pub salt: [u8; 16],
    pub wrapped: &'a MetadataEntry,
}

impl MetadataEntry {
    pub(crate) fn parse_one(cur: &mut Cursor) -> Result<Self> {
        let start = cur.position();
        let size = cur.read_u16()?;
        if size < 8 {
            return Err(BdeError::new(ErrorKind::InvalidData, "metadata entry size below minimum"));
        }
        let entry_type = EntryType::from_raw(cur.read_u16()?);
        let value_type = ValueType::from_raw(cur.read_u16()?);
        let version = cur.read_u16()?;
        let payload_len = size as usize - 8;
        cur.seek(start)?;
        cur.seek(start + 8)?;
        let data = cur.read_bytes(payload_len)?.to_vec();

        // A stretch-key entry's own fixed header (encryption_method + salt,
        // 18 bytes) precedes its nested AES-CCM-wrapped blob; everything else
        // that nests is parsed from the start of its data.
        const STRETCH_KEY_HEADER_LEN: usize = 18;
        let nested = match value_type {
            ValueType::StretchKey if data.len() > STRETCH_KEY_HEADER_LEN => {
                parse_nested_best_effort(&data[STRETCH_KEY_HEADER_LEN..])
            }
            ValueType::UseKey if data.len() > 8 => parse_nested_best_effort(&data),
            _ => Vec::new(),
        };

        Ok(MetadataEntry {
            entry_type,
            value_type,
            version,
            data,
            nested,
        })
    }

    /// Interprets this entry as an AES-CCM-encrypted blob: `{nonce[12],
    /// mac[16], ciphertext}`. Fails if the value type or length is wrong.
    pub fn as_aes_ccm(&self) -> Result<AesCcmBlob<'_>> {
        if self.value_type != ValueType::AesCcmEncrypted {
            return Err(BdeError::new(ErrorKind::InvalidData, "entry is not an AES-CCM-encrypted blob"));
        }
        if self.data.len() < 28 {
            return Err(BdeError::new(ErrorKind::InvalidData, "AES-CCM blob shorter than nonce+mac"));
        }
        let nonce: [u8; 12] = self.data[0..12].try_into().unwrap();
        let mac: [u8; 16] = self.data[12..28].try_into().unwrap();
        let ciphertext = &self.data[28..];
        Ok(AesCcmBlob { nonce, mac, ciphertext })
    }

    /// Interprets this entry as a `stretch-key` entry: `{encryption_method,
    /// salt[16], aes-ccm-encrypted(...)}`.
    pub fn as_stretch_key(&self) -> Result<StretchKeyInfo<'_>> {
        if self.value_type != ValueType::StretchKey {
            return Err(BdeError::new(ErrorKind::InvalidData, "entry is not a stretch-key"));
        }
        if self.data.len() < 18 {
            return Err(BdeError::new(ErrorKind::InvalidData, "stretch-key entry shorter than its fixed header"));
        }
        let encryption_method = u16::from_le_bytes(self.data[0..2].try_into().unwrap());
        let salt: [u8; 16] = self.data[2..18].try_into().unwrap();
        let wrapped = self
            .nested
            .first()
            .ok_or_else(|| BdeError::new(ErrorKind::InvalidData, "stretch-key entry has no wrapped key blob"))?;
        Ok(StretchKeyInfo { encryption_method, salt, wrapped })
    }
}

/// Key-protector protection types, parsed from a `volume-master-key` entry's
/// header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionType {
    ClearKey,
    Tpm,
    StartupKey,
    RecoveryPassword,
    TpmAndPin,
    TpmAndStartupKey,
    TpmPinAndStartupKey,
    UserPassword,
    AutoUnlock,
    Unknown(u16),
}

impl ProtectionType {
    fn from_raw(raw: u16) -> Self {
        match raw {
            0x0000 => ProtectionType::ClearKey,
            0x0100 => ProtectionType::Tpm,
            0x0200 => ProtectionType::StartupKey,
            0x0800 => ProtectionType::RecoveryPassword,
            0x0400 => ProtectionType::TpmAndPin,
            0x0500 => ProtectionType::TpmAndStartupKey,
            0x0600 => ProtectionType::TpmPinAndStartupKey,
            0x1000 => ProtectionType::UserPassword,
            0x2000 => ProtectionType::AutoUnlock,
            other => ProtectionType::Unknown(other),
        }
    }
}

/// The BitLocker sector-cipher mode named by an FVEK entry's
/// `encryption_method` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    Aes128Diffuser,
    Aes256Diffuser,
    Aes128Cbc,
    Aes256Cbc,
    AesXts128,
    AesXts256,
}

impl EncryptionMethod {
    pub fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0x8000 => Ok(EncryptionMethod::Aes128Diffuser),
            0x8001 => Ok(EncryptionMethod::Aes256Diffuser),
            0x8002 => Ok(EncryptionMethod::Aes128Cbc),
            0x8003 => Ok(EncryptionMethod::Aes256Cbc),
            0x8004 => Ok(EncryptionMethod::AesXts128),
            0x8005 => Ok(EncryptionMethod::AesXts256),
            other => Err(BdeError::new(
                ErrorKind::Unsupported,
                format!("unrecognized or unsupported encryption method 0x{:04x}", other),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EncryptionMethod::Aes128Diffuser => "AES-128-CBC+Elephant",
            EncryptionMethod::Aes256Diffuser => "AES-256-CBC+Elephant",
            EncryptionMethod::Aes128Cbc => "AES-128-CBC",
            EncryptionMethod::Aes256Cbc => "AES-256-CBC",
            EncryptionMethod::AesXts128 => "AES-XTS-128",
            EncryptionMethod::AesXts256 => "AES-XTS-256",
        }
    }

    /// Byte length each half of the unwrapped FVEK payload must have: the
    /// cipher key alone for the non-diffuser modes, cipher key + tweak/
    /// diffuser key for the rest.
    pub(crate) fn half_key_len(&self) -> usize {
        match self {
            EncryptionMethod::Aes128Diffuser | EncryptionMethod::Aes128Cbc | EncryptionMethod::AesXts128 => 16,
            EncryptionMethod::Aes256Diffuser | EncryptionMethod::Aes256Cbc | EncryptionMethod::AesXts256 => 32,
        }
    }

    pub(crate) fn has_second_half(&self) -> bool {
        !matches!(self, EncryptionMethod::Aes128Cbc | EncryptionMethod::Aes256Cbc)
    }
}

/// A key protector: a `volume-master-key` metadata entry, carrying its own
/// identifier/timestamp header plus nested entries (the stretch-key and
/// AES-CCM-wrapped VMK blob, in the common cases).
#[derive(Debug, Clone)]
pub struct KeyProtector {
    pub identifier: Guid,
    pub last_changed: FileTime,
    pub protection_type: ProtectionType,
    pub entries: Vec<MetadataEntry>,
}

impl KeyProtector {
    fn parse(entry: &MetadataEntry) -> Result<Self> {
        let mut cur = Cursor::new(&entry.data);
        let identifier = cur.read_guid()?;
        let last_changed = cur.read_filetime()?;
        let protection_type = ProtectionType::from_raw(cur.read_u16()?);
        let remaining = cur.read_bytes(cur.remaining())?;
        let entries = parse_nested_best_effort(remaining);
        Ok(KeyProtector {
            identifier,
            last_changed,
            protection_type,
            entries,
        })
    }
}

/// Parses a run of metadata entries, stopping (rather than failing) on the
/// first malformed entry — used for nested/contained entry lists where a
/// partial read is still useful.
fn parse_nested_best_effort(data: &[u8]) -> Vec<MetadataEntry> {
    let mut cur = Cursor::new(data);
    let mut out = Vec::new();
    while cur.remaining() >= 8 {
        match MetadataEntry::parse_one(&mut cur) {
            Ok(entry) => out.push(entry),
            Err(_) => break,
        }
    }
    out
}

/// One parsed, validated FVE metadata block.
#[derive(Debug, Clone)]
pub struct FveMetadataBlock {
    pub version: u16,
    pub volume_guid: Guid,
    pub sequence_number: u64,
    pub encrypted_volume_size: u64,
    pub creation_time: FileTime,
    pub description: String,
    pub entries: Vec<MetadataEntry>,
}

impl FveMetadataBlock {
    /// Parses and validates one FVE metadata block read from `source` at
    /// `offset`. Returns `invalid_data` if the block fails any structural
    /// check; callers try the remaining copies rather than propagating this.
    pub fn parse(source: &dyn ByteSource, offset: u64) -> Result<Self> {
        // The block begins with the `-FVE-FS-` magic, then size/header_size/
        // version; read just that much first so the magic check happens
        // before `size` is trusted for the full-block allocation below.
        let mut prefix = [0u8; 16];
        source.read_exact_at(offset, &mut prefix)?;
        let magic: [u8; 8] = prefix[0..8].try_into().unwrap();
        if &magic != FVE_MAGIC {
            return Err(BdeError::new(ErrorKind::InvalidData, "FVE metadata magic mismatch"));
        }
        let declared_size = u32::from_le_bytes(prefix[8..12].try_into().unwrap()) as usize;
        if declared_size < FVE_HEADER_LEN + 10 || declared_size > 16 * 1024 * 1024 {
            return Err(BdeError::new(ErrorKind::InvalidData, "FVE metadata block size out of range"));
        }

        let mut block = vec![0u8; declared_size];
        source.read_exact_at(offset, &mut block)?;

        let mut cur = Cursor::new(&block);
        let _magic = cur.read_bytes(8)?;
        let _size = cur.read_u32()?;
        let _header_size = cur.read_u16()?;
        let version = cur.read_u16()?;
        if version != 1 && version != 2 {
            return Err(BdeError::new(ErrorKind::InvalidData, "unsupported FVE metadata version"));
        }

        let integrity_field = cur.read_u64()?;
        let volume_guid = cur.read_guid()?;
        let sequence_number = cur.read_u64()?;
        let encrypted_volume_size = cur.read_u64()?;
        let _converted_area_length = cur.read_u64()?;
        debug_assert_eq!(cur.position(), FVE_HEADER_LEN);

        // Policy: a zero integrity field means "not
        // checked"; a nonzero field is the expected CRC-32 of everything
        // that follows it, and a mismatch is `checksum_mismatch` rather than
        // `invalid_data` so callers can tell the two failure modes apart.
        if integrity_field != 0 {
            let actual = crc32fast::hash(&block[INTEGRITY_FIELD_COVERAGE_START..]) as u64;
            if actual != integrity_field {
                return Err(BdeError::new(ErrorKind::ChecksumMismatch, "FVE metadata integrity field mismatch"));
            }
        }

        // The remainder up to declared_size is the FVE header (copy-of-
        // volume GUID, next nonce counter, creation time, description)
        // followed by entries.
        let _copy_of_volume_guid = cur.read_guid()?;
        let _next_nonce_counter = cur.read_u64()?;
        let creation_time = cur.read_filetime()?;
        let description_len = cur.read_u16()? as usize;
        let description_bytes = cur.read_bytes(description_len)?;
        let description = read_utf16le_string(description_bytes).unwrap_or_default();

        let mut entries = Vec::new();
        let mut consumed = cur.position();
        while consumed < declared_size {
            if declared_size - consumed < 8 {
                return Err(BdeError::new(ErrorKind::InvalidData, "trailing bytes do not form an entry"));
            }
            let entry = MetadataEntry::parse_one(&mut cur)?;
            consumed = cur.position();
            entries.push(entry);
        }
        if consumed != declared_size {
            return Err(BdeError::new(
                ErrorKind::InvalidData,
                "entries do not sum exactly to the block size",
            ));
        }

        Ok(FveMetadataBlock {
            version,
            volume_guid,
            sequence_number,
            encrypted_volume_size,
            creation_time,
            description,
            entries,
        })
    }

    pub fn fvek_entry(&self) -> Option<&MetadataEntry> {
        self.entries.iter().find(|e| e.entry_type == EntryType::FullVolumeEncryptionKey)
    }

    pub fn volume_header_block_entry(&self) -> Option<&MetadataEntry> {
        self.entries.iter().find(|e| e.entry_type == EntryType::VolumeHeaderBlock)
    }

    pub fn protectors(&self) -> Result<Vec<KeyProtector>> {
        self.entries
            .iter()
            .filter(|e| e.entry_type == EntryType::VolumeMasterKey)
            .map(KeyProtector::parse)
            .collect()
    }
}

/// Reads all three redundant FVE metadata blocks and returns the valid one
/// with the highest sequence number. Fails with `invalid_data` only if every
/// copy is unreadable or malformed.
pub fn choose_best_block(source: &dyn ByteSource, offsets: &[u64; 3]) -> Result<FveMetadataBlock> {
    let mut best: Option<FveMetadataBlock> = None;
    for &offset in offsets {
        match FveMetadataBlock::parse(source, offset) {
            Ok(block) => {
                let better = match &best {
                    Some(current) => block.sequence_number > current.sequence_number,
                    None => true,
                };
                if better {
                    best = Some(block);
                }
            }
            Err(_) => continue,
        }
    }
    best.ok_or_else(|| BdeError::new(ErrorKind::InvalidData, "no valid FVE metadata block among the three copies"))
}
