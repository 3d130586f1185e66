// Sector codec (dispatches AES-CBC, AES-CBC+Elephant-diffuser, and AES-XTS
// by encryption method) plus the volume facade that composes header/metadata
// parsing, unlock, and cached sector reads into one random-access handle.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::binary::{Cursor, FileTime, Guid};
use crate::credential::Credential;
use crate::crypto;
use crate::error::{bde_err, ErrorKind, Result};
use crate::header::VolumeHeader;
use crate::key::{self, UnlockedKeys};
use crate::metadata::{choose_best_block, EncryptionMethod, FveMetadataBlock, ProtectionType};
use crate::observer::{Event, LogObserver, Observer};
use crate::options::OpenOptions;
use crate::source::ByteSource;

/// Decrypts one whole physical sector in place, given the unlocked key
/// material and the sector's on-disk LBA.
fn decrypt_sector(keys: &UnlockedKeys, lba: u64, bps: u32, buf: &mut [u8]) -> Result<()> {
    match keys.method {
        EncryptionMethod::Aes128Cbc | EncryptionMethod::Aes256Cbc => {
            decrypt_cbc(&keys.fvek, lba, bps, buf)?;
        }
        EncryptionMethod::Aes128Diffuser | EncryptionMethod::Aes256Diffuser => {
            decrypt_cbc(&keys.fvek, lba, bps, buf)?;
            let tweak = keys
                .tweak
                .as_ref()
                .ok_or_else(|| bde_err!(ErrorKind::InvalidData, "diffuser mode is missing its tweak key"))?;
            crypto::elephant_diffuser_decrypt(tweak, lba, bps, buf)?;
        }
        EncryptionMethod::AesXts128 | EncryptionMethod::AesXts256 => {
            let key2 = keys
                .tweak
                .as_ref()
                .ok_or_else(|| bde_err!(ErrorKind::InvalidData, "XTS mode is missing its second key half"))?;
            decrypt_xts(&keys.fvek, key2, lba, buf)?;
        }
    }
    Ok(())
}

fn decrypt_cbc(fvek: &[u8], lba: u64, bps: u32, buf: &mut [u8]) -> Result<()> {
    let byte_offset = lba
        .checked_mul(bps as u64)
        .ok_or_else(|| bde_err!(ErrorKind::InvalidData, "sector offset overflow computing CBC IV"))?;
    let mut iv = crypto::le128(byte_offset);
    crypto::aes_ecb_encrypt_block(fvek, &mut iv)?;
    crypto::aes_cbc_decrypt(fvek, &iv, buf)
}

/// AES-XTS treats the whole physical sector as a single data unit, tweaked
/// by its LBA — not by a fixed 512-byte sub-unit index.
fn decrypt_xts(key1: &[u8], key2: &[u8], lba: u64, buf: &mut [u8]) -> Result<()> {
    crypto::aes_xts_decrypt(key1, key2, lba as u128, buf)
}

/// Enumeration-only view of one key protector, independent of the raw
/// metadata-entry bytes backing it.
#[derive(Debug, Clone, Copy)]
pub struct ProtectorSummary {
    pub identifier: Guid,
    pub protection_type: ProtectionType,
    pub last_changed: FileTime,
}

/// A parsed, optionally unlocked BitLocker volume. Borrows nothing; the byte
/// source is owned for the volume's lifetime.
pub struct Volume {
    source: Box<dyn ByteSource>,
    header: VolumeHeader,
    block: FveMetadataBlock,
    keys: Option<UnlockedKeys>,
    relocation: Option<(u64, u64)>,
    cache: Option<Mutex<LruCache<u64, Vec<u8>>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    observer: Arc<dyn Observer>,
    options: OpenOptions,
}

impl Volume {
    /// Parses the boot sector and the best of the three FVE metadata
    /// copies. The volume is locked (no `read_at`) until `unlock` succeeds.
    pub fn open(source: Box<dyn ByteSource>, options: OpenOptions) -> Result<Self> {
        let observer: Arc<dyn Observer> = options.observer.clone().unwrap_or_else(|| Arc::new(LogObserver));

        let mut sector0 = vec![0u8; 512];
        source.read_exact_at(0, &mut sector0)?;
        let header = VolumeHeader::parse(&sector0)?;
        observer.on_event(Event::HeaderParsed);

        let block = choose_best_block(source.as_ref(), &header.fve_offsets)?;
        observer.on_event(Event::MetadataBlockChosen {
            sequence_number: block.sequence_number,
        });

        let relocation = block.volume_header_block_entry().and_then(|entry| {
            let mut cur = Cursor::new(&entry.data);
            let offset = cur.read_u64().ok()?;
            let size = cur.read_u64().ok()?;
            Some((offset, size))
        });

        let cache = NonZeroUsize::new(options.cache_capacity).map(|cap| Mutex::new(LruCache::new(cap)));

        Ok(Volume {
            source,
            header,
            block,
            keys: None,
            relocation,
            cache,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            observer,
            options,
        })
    }

    /// Tries every configured credential against the volume's key
    /// protectors. Clears the sector cache on success, since decrypted
    /// sectors from a stale (or never-set) key must not be reused.
    pub fn unlock(&mut self, credentials: &[Credential]) -> Result<()> {
        let keys = key::unlock(&self.block, credentials, &self.options, self.observer.as_ref())?;
        self.keys = Some(keys);
        if let Some(cache) = &self.cache {
            cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.keys.is_some()
    }

    /// Logical size of the decrypted volume, in bytes.
    pub fn size(&self) -> u64 {
        self.block.encrypted_volume_size
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn volume_guid(&self) -> Guid {
        self.block.volume_guid
    }

    pub fn creation_time(&self) -> FileTime {
        self.block.creation_time
    }

    pub fn description(&self) -> &str {
        &self.block.description
    }

    /// `None` until the volume is unlocked: the method is only known after
    /// the FVEK entry has been decrypted.
    pub fn encryption_method_name(&self) -> Option<&'static str> {
        self.keys.as_ref().map(|k| k.method.name())
    }

    /// Enumeration view of every key protector in the active metadata block,
    /// for UI/diagnostic listing; does not require the volume to be unlocked.
    pub fn protector_summaries(&self) -> Result<Vec<ProtectorSummary>> {
        Ok(self
            .block
            .protectors()?
            .iter()
            .map(|p| ProtectorSummary {
                identifier: p.identifier,
                protection_type: p.protection_type,
                last_changed: p.last_changed,
            })
            .collect())
    }

    fn physical_offset_for_lba(&self, lba: u64) -> u64 {
        let bps = self.header.bytes_per_sector as u64;
        let logical_offset = lba * bps;
        if let Some((reloc_offset, reloc_size)) = self.relocation {
            if logical_offset < reloc_size {
                return reloc_offset + logical_offset;
            }
        }
        logical_offset
    }

    fn record_cache_stat(&self, hit: bool) {
        let (hits, misses) = if hit {
            (self.cache_hits.fetch_add(1, Ordering::Relaxed) + 1, self.cache_misses.load(Ordering::Relaxed))
        } else {
            (self.cache_hits.load(Ordering::Relaxed), self.cache_misses.fetch_add(1, Ordering::Relaxed) + 1)
        };
        self.observer.on_event(Event::CacheStats { hits, misses });
    }

    fn sector_plaintext(&self, lba: u64) -> Result<Vec<u8>> {
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = guard.get(&lba) {
                let hit = hit.clone();
                drop(guard);
                self.record_cache_stat(true);
                return Ok(hit);
            }
        }
        self.record_cache_stat(false);

        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| bde_err!(ErrorKind::ValueMissing, "volume is locked; call unlock first"))?;
        let bps = self.header.bytes_per_sector;
        let mut buf = vec![0u8; bps as usize];
        self.source.read_exact_at(self.physical_offset_for_lba(lba), &mut buf)?;
        decrypt_sector(keys, lba, bps, &mut buf)?;

        if let Some(cache) = &self.cache {
            cache.lock().unwrap_or_else(|e| e.into_inner()).put(lba, buf.clone());
        }
        Ok(buf)
    }

    /// Reads decrypted bytes at logical offset `offset` into `buf`, returning
    /// the number of bytes actually copied (short only at end-of-volume).
    /// Fails with `value_missing` if the volume has not been unlocked yet.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.keys.is_none() {
            return Err(bde_err!(ErrorKind::ValueMissing, "volume is locked; call unlock first"));
        }
        let size = self.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let bps = self.header.bytes_per_sector as u64;
        let n = (buf.len() as u64).min(size - offset);

        let first_lba = offset / bps;
        let last_lba = (offset + n - 1) / bps;
        let mut total: u64 = 0;
        for lba in first_lba..=last_lba {
            let sector = self.sector_plaintext(lba)?;
            let sector_start = lba * bps;
            let sector_end = sector_start + bps;
            let read_start = offset.max(sector_start);
            let read_end = (offset + n).min(sector_end);
            let src_start = (read_start - sector_start) as usize;
            let src_end = (read_end - sector_start) as usize;
            let dst_start = (read_start - offset) as usize;
            let len = src_end - src_start;
            buf[dst_start..dst_start + len].copy_from_slice(&sector[src_start..src_end]);
            total += len as u64;
        }
        Ok(total as usize)
    }

    pub fn close(self) {}
}
