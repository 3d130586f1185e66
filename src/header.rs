// Parses the BDE volume header: the first sector of a BitLocker-protected
// volume. Branches on the OEM-name field (offset 3) and, for the Windows
// 7/ToGo layout, the BitLocker boot-code GUID to tell the two on-disk
// variants apart and locate the three redundant FVE metadata blocks.

use crate::binary::{Cursor, Guid};
use crate::error::{BdeError, ErrorKind, Result};

const OEM_ID_OFFSET: usize = 3;
const OEM_ID_LEN: usize = 8;
const BYTES_PER_SECTOR_OFFSET: usize = 11;
// Standard BPB "hidden sectors" field, carried over from the NTFS/FAT boot
// sector BitLocker overlays; used as the first usable LBA.
const HIDDEN_SECTORS_OFFSET: usize = 0x1C;

const VISTA_OEM_ID: &[u8; 8] = b"-FVE-FS-";
const WIN7_OEM_ID_1: &[u8; 8] = b"MSWIN4.1";
const WIN7_OEM_ID_2: &[u8; 8] = b"NTFS    ";

const VISTA_FVE_OFFSETS_OFFSET: usize = 0x1A0;
const WIN7_GUID_OFFSET: usize = 0x1A0;
const WIN7_FVE_OFFSETS_OFFSET: usize = 0x1B0;

const WIN7_BOOT_GUID: &str = "4967D63B-2E29-4AD8-8399-F6A339E3D001";
const TOGO_BOOT_GUID: &str = "92A84D3B-DD80-4D0E-9E4E-B1E3284EAED8";

/// Which of the two observed on-disk layouts a boot sector matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BdeVariant {
    /// Vista: `-FVE-FS-` OEM id, no boot-code GUID, FVE offsets at a fixed
    /// location right after the BIOS parameter block.
    Vista,
    /// Windows 7 or BitLocker To Go: a normal-looking NTFS/FAT OEM id plus a
    /// BitLocker boot-code GUID; the true boot sector has been relocated and
    /// is recovered via a `volume-header-block` metadata entry.
    Windows7,
}

/// The parsed BDE volume header (boot sector).
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub variant: BdeVariant,
    pub bytes_per_sector: u32,
    pub first_usable_lba: u64,
    pub fve_offsets: [u64; 3],
}

impl VolumeHeader {
    /// Parses sector 0 of a BDE volume. `sector` must be at least 512 bytes.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < 512 {
            return Err(BdeError::new(ErrorKind::InvalidData, "boot sector shorter than 512 bytes"));
        }

        let oem_id = &sector[OEM_ID_OFFSET..OEM_ID_OFFSET + OEM_ID_LEN];
        let bytes_per_sector = read_bytes_per_sector(sector)?;
        let first_usable_lba = read_first_usable_lba(sector)?;

        if oem_id == VISTA_OEM_ID {
            let fve_offsets = read_fve_offsets(sector, VISTA_FVE_OFFSETS_OFFSET)?;
            return Ok(VolumeHeader {
                variant: BdeVariant::Vista,
                bytes_per_sector,
                first_usable_lba,
                fve_offsets,
            });
        }

        if oem_id == WIN7_OEM_ID_1 || oem_id == WIN7_OEM_ID_2 {
            let guid_bytes: [u8; 16] = sector[WIN7_GUID_OFFSET..WIN7_GUID_OFFSET + 16]
                .try_into()
                .unwrap();
            let guid = Guid::from_bytes(guid_bytes);
            let win7 = Guid::parse(WIN7_BOOT_GUID).expect("static GUID literal parses");
            let togo = Guid::parse(TOGO_BOOT_GUID).expect("static GUID literal parses");
            if guid == win7 || guid == togo {
                let fve_offsets = read_fve_offsets(sector, WIN7_FVE_OFFSETS_OFFSET)?;
                return Ok(VolumeHeader {
                    variant: BdeVariant::Windows7,
                    bytes_per_sector,
                    first_usable_lba,
                    fve_offsets,
                });
            }
        }

        Err(BdeError::new(ErrorKind::SignatureMismatch, "no recognized BDE boot sector signature"))
    }
}

fn read_bytes_per_sector(sector: &[u8]) -> Result<u32> {
    let mut cur = Cursor::new(sector);
    cur.seek(BYTES_PER_SECTOR_OFFSET)?;
    Ok(cur.read_u16()? as u32)
}

fn read_first_usable_lba(sector: &[u8]) -> Result<u64> {
    let mut cur = Cursor::new(sector);
    cur.seek(HIDDEN_SECTORS_OFFSET)?;
    Ok(cur.read_u32()? as u64)
}

fn read_fve_offsets(sector: &[u8], at: usize) -> Result<[u64; 3]> {
    let mut cur = Cursor::new(sector);
    cur.seek(at)?;
    Ok([cur.read_u64()?, cur.read_u64()?, cur.read_u64()?])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vista_sector() -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[OEM_ID_OFFSET..OEM_ID_OFFSET + 8].copy_from_slice(VISTA_OEM_ID);
        sector[BYTES_PER_SECTOR_OFFSET..BYTES_PER_SECTOR_OFFSET + 2].copy_from_slice(&512u16.to_le_bytes());
        sector[VISTA_FVE_OFFSETS_OFFSET..VISTA_FVE_OFFSETS_OFFSET + 8].copy_from_slice(&4096u64.to_le_bytes());
        sector[VISTA_FVE_OFFSETS_OFFSET + 8..VISTA_FVE_OFFSETS_OFFSET + 16]
            .copy_from_slice(&(4096u64 * 2).to_le_bytes());
        sector[VISTA_FVE_OFFSETS_OFFSET + 16..VISTA_FVE_OFFSETS_OFFSET + 24]
            .copy_from_slice(&(4096u64 * 3).to_le_bytes());
        sector
    }

    fn win7_sector(guid: &str) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[OEM_ID_OFFSET..OEM_ID_OFFSET + 8].copy_from_slice(WIN7_OEM_ID_1);
        sector[BYTES_PER_SECTOR_OFFSET..BYTES_PER_SECTOR_OFFSET + 2].copy_from_slice(&512u16.to_le_bytes());
        let guid_bytes = guid_to_disk_bytes(guid);
        sector[WIN7_GUID_OFFSET..WIN7_GUID_OFFSET + 16].copy_from_slice(&guid_bytes);
        sector[WIN7_FVE_OFFSETS_OFFSET..WIN7_FVE_OFFSETS_OFFSET + 8].copy_from_slice(&16384u64.to_le_bytes());
        sector[WIN7_FVE_OFFSETS_OFFSET + 8..WIN7_FVE_OFFSETS_OFFSET + 16]
            .copy_from_slice(&(16384u64 * 2).to_le_bytes());
        sector[WIN7_FVE_OFFSETS_OFFSET + 16..WIN7_FVE_OFFSETS_OFFSET + 24]
            .copy_from_slice(&(16384u64 * 3).to_le_bytes());
        sector
    }

    /// Converts a canonical big-endian GUID string into the mixed-endian
    /// on-disk layout, mirroring `Guid::parse`'s internal byte shuffle.
    fn guid_to_disk_bytes(guid: &str) -> [u8; 16] {
        let hex: String = guid.chars().filter(|c| *c != '-').collect();
        let mut bytes = [0u8; 16];
        for i in 0..16 {
            bytes[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap();
        }
        let mut disk = [0u8; 16];
        disk[0..4].copy_from_slice(&bytes[0..4]);
        disk[0..4].reverse();
        disk[4..6].copy_from_slice(&bytes[4..6]);
        disk[4..6].reverse();
        disk[6..8].copy_from_slice(&bytes[6..8]);
        disk[6..8].reverse();
        disk[8..16].copy_from_slice(&bytes[8..16]);
        disk
    }

    #[test]
    fn parses_vista_layout() {
        let sector = vista_sector();
        let header = VolumeHeader::parse(&sector).unwrap();
        assert_eq!(header.variant, BdeVariant::Vista);
        assert_eq!(header.bytes_per_sector, 512);
        assert_eq!(header.fve_offsets, [4096, 8192, 12288]);
    }

    #[test]
    fn parses_windows7_layout_with_win7_guid() {
        let sector = win7_sector(WIN7_BOOT_GUID);
        let header = VolumeHeader::parse(&sector).unwrap();
        assert_eq!(header.variant, BdeVariant::Windows7);
        assert_eq!(header.fve_offsets, [16384, 32768, 49152]);
    }

    #[test]
    fn parses_windows7_layout_with_togo_guid() {
        let sector = win7_sector(TOGO_BOOT_GUID);
        let header = VolumeHeader::parse(&sector).unwrap();
        assert_eq!(header.variant, BdeVariant::Windows7);
    }

    #[test]
    fn rejects_unrecognized_signature() {
        let sector = vec![0u8; 512];
        assert_eq!(VolumeHeader::parse(&sector).unwrap_err().kind(), ErrorKind::SignatureMismatch);
    }

    #[test]
    fn rejects_short_buffer() {
        let sector = vec![0u8; 10];
        assert_eq!(VolumeHeader::parse(&sector).unwrap_err().kind(), ErrorKind::InvalidData);
    }
}
