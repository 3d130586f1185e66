// Bounds-checked little-endian decoders shared by the header and metadata
// parsers. BitLocker's on-disk structures are little-endian throughout.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};

use crate::error::{BdeError, ErrorKind, Result};

/// A cursor over a borrowed byte slice that never panics: every read checks
/// the remaining length first and returns `invalid_data` on underrun.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(BdeError::new(ErrorKind::InvalidData, "seek past end of buffer"));
        }
        self.pos = pos;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(BdeError::new(
                ErrorKind::InvalidData,
                format!("buffer underrun: need {} bytes, have {}", n, self.remaining()),
            ));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_guid(&mut self) -> Result<Guid> {
        Ok(Guid::from_bytes(self.take(16)?.try_into().unwrap()))
    }

    pub fn read_filetime(&mut self) -> Result<FileTime> {
        Ok(FileTime(self.read_u64()?))
    }
}

/// A Microsoft-style GUID as laid out on disk: the first three fields
/// little-endian, the last two (clock sequence and node) big-endian, per
/// RFC 4122 §4.1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid {
    time_low: u32,
    time_mid: u16,
    time_high_and_version: u16,
    clock_seq_high_and_reserved: u8,
    clock_seq_low: u8,
    node: [u8; 6],
}

impl Guid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid {
            time_low: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            time_mid: u16::from_le_bytes([bytes[4], bytes[5]]),
            time_high_and_version: u16::from_le_bytes([bytes[6], bytes[7]]),
            clock_seq_high_and_reserved: bytes[8],
            clock_seq_low: bytes[9],
            node: [bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]],
        }
    }

    /// Parses the canonical `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX` string
    /// form, used to recognize the BitLocker boot-code GUIDs.
    pub fn parse(s: &str) -> Option<Self> {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for i in 0..16 {
            bytes[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        // The string form is big-endian throughout; convert to the on-disk
        // mixed-endian layout `from_bytes` expects.
        let mut disk = [0u8; 16];
        disk[0..4].copy_from_slice(&bytes[0..4]);
        disk[0..4].reverse();
        disk[4..6].copy_from_slice(&bytes[4..6]);
        disk[4..6].reverse();
        disk[6..8].copy_from_slice(&bytes[6..8]);
        disk[6..8].reverse();
        disk[8..16].copy_from_slice(&bytes[8..16]);
        Some(Guid::from_bytes(disk))
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let clock_seq = u16::from_be_bytes([self.clock_seq_high_and_reserved, self.clock_seq_low]);
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
            self.time_low,
            self.time_mid,
            self.time_high_and_version,
            clock_seq,
            u64::from_be_bytes([
                0, 0, self.node[0], self.node[1], self.node[2], self.node[3], self.node[4], self.node[5]
            ])
        )
    }
}

/// A Windows FILETIME: 100ns intervals since 1601-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileTime(pub u64);

const FILETIME_EPOCH_DIFF_100NS: i64 = 116_444_736_000_000_000;

impl FileTime {
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Converts to a UTC timestamp. Returns `None` for values outside the
    /// range `chrono` can represent (pathologically corrupt metadata).
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let since_unix_100ns = self.0 as i64 - FILETIME_EPOCH_DIFF_100NS;
        let secs = since_unix_100ns.div_euclid(10_000_000);
        let nanos = since_unix_100ns.rem_euclid(10_000_000) * 100;
        DateTime::from_timestamp(secs, nanos as u32)
    }
}

/// Decodes a UTF-16LE byte sequence, stopping at the first NUL code unit.
pub fn read_utf16le_string(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(BdeError::new(ErrorKind::InvalidData, "UTF-16LE data has odd length"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16(&units)
        .map_err(|e| BdeError::with_source(ErrorKind::InvalidData, "invalid UTF-16LE description", e))
}
