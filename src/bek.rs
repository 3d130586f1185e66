// Parses a `.BEK` startup-key file: a miniature FVE-metadata container
// holding a single `external-key` entry with the raw 32-byte startup key.
// Reuses the same block/entry-walking routine as the volume's own FVE
// metadata parser rather than duplicating it.

use crate::error::{bde_err, ErrorKind, Result};
use crate::metadata::{EntryType, FveMetadataBlock, ValueType};
use crate::source::ByteSource;

/// Parses a `.BEK` container read from `source` and returns the raw
/// startup-key bytes held by its `external-key` entry.
pub fn parse_startup_key(source: &dyn ByteSource) -> Result<Vec<u8>> {
    let block = FveMetadataBlock::parse(source, 0)?;
    block
        .entries
        .iter()
        .find(|e| e.entry_type == EntryType::StartupKey && e.value_type == ValueType::ExternalKey)
        .map(|e| e.data.clone())
        .ok_or_else(|| bde_err!(ErrorKind::ValueMissing, ".BEK container has no external-key entry"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn build_entry(entry_type: u16, value_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((8 + payload.len()) as u16).to_le_bytes());
        out.extend_from_slice(&entry_type.to_le_bytes());
        out.extend_from_slice(&value_type.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn build_bek(entries: &[u8]) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(&0u64.to_le_bytes()); // integrity field
        header.extend_from_slice(&[0u8; 16]); // volume guid
        header.extend_from_slice(&1u64.to_le_bytes()); // sequence number
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());

        let mut sub_header = Vec::new();
        sub_header.extend_from_slice(&[0u8; 16]); // copy-of-volume guid
        sub_header.extend_from_slice(&0u64.to_le_bytes());
        sub_header.extend_from_slice(&0u64.to_le_bytes());
        sub_header.extend_from_slice(&0u16.to_le_bytes());

        let mut block = Vec::new();
        let total = 16 + header.len() + sub_header.len() + entries.len();
        block.extend_from_slice(b"-FVE-FS-");
        block.extend_from_slice(&(total as u32).to_le_bytes());
        block.extend_from_slice(&48u16.to_le_bytes());
        block.extend_from_slice(&2u16.to_le_bytes());
        block.extend_from_slice(&header);
        block.extend_from_slice(&sub_header);
        block.extend_from_slice(entries);
        block
    }

    #[test]
    fn extracts_the_raw_external_key() {
        let key = [0x5Au8; 32];
        let entry = build_entry(0x0006, 0x0009, &key); // StartupKey / ExternalKey
        let source = MemorySource::new(build_bek(&entry));
        let extracted = parse_startup_key(&source).unwrap();
        assert_eq!(extracted, key.to_vec());
    }

    #[test]
    fn fails_with_value_missing_when_no_external_key_entry() {
        let source = MemorySource::new(build_bek(&[]));
        assert_eq!(parse_startup_key(&source).unwrap_err().kind(), ErrorKind::ValueMissing);
    }
}
