// Key hierarchy: unwraps a VMK from a key protector using caller-supplied
// credentials, then unwraps the FVEK (and, where the mode calls for it, the
// TWEAK/diffuser key) using that VMK. Each candidate is tried in turn,
// falling through to the next on failure, via two nested AES-CCM unwraps.

use std::sync::atomic::AtomicBool;

use zeroize::Zeroizing;

use crate::binary::Cursor;
use crate::credential::{user_password_hash, Credential, RecoveryPassword};
use crate::crypto;
use crate::error::{bde_err, BdeError, ErrorKind, Result};
use crate::metadata::{EncryptionMethod, EntryType, FveMetadataBlock, KeyProtector, MetadataEntry, ProtectionType, ValueType};
use crate::observer::{Event, Observer};
use crate::options::OpenOptions;

/// The key material recovered by a successful unlock: the sector cipher
/// mode plus its key halves. Zeroized on drop via `Zeroizing`.
pub struct UnlockedKeys {
    pub method: EncryptionMethod,
    pub fvek: Zeroizing<Vec<u8>>,
    pub tweak: Option<Zeroizing<Vec<u8>>>,
}

/// Tries every configured credential against the chosen metadata block's key
/// protectors (clear-key protectors first, then metadata order unless
/// `options` overrides it), then unwraps the FVEK with whichever VMK came
/// out. Direct `FullVolumeEncryptionKey`/`VolumeMasterKey` credentials skip
/// straight to their respective stage.
pub fn unlock(
    block: &FveMetadataBlock,
    credentials: &[Credential],
    options: &OpenOptions,
    observer: &dyn Observer,
) -> Result<UnlockedKeys> {
    for credential in credentials {
        if let Credential::FullVolumeEncryptionKey(raw) = credential {
            if let Some(method) = plaintext_encryption_method_hint(block) {
                let keys = split_key_payload(method, raw)?;
                observer.on_event(Event::Unlocked { method: keys.method.name() });
                return Ok(keys);
            }
        }
    }
    for credential in credentials {
        if let Credential::VolumeMasterKey(vmk) = credential {
            if let Ok(keys) = unwrap_fvek(block, vmk) {
                observer.on_event(Event::Unlocked { method: keys.method.name() });
                return Ok(keys);
            }
        }
    }

    let protectors = block.protectors()?;
    let order = match &options.protector_order {
        Some(order) => order.clone(),
        None => default_protector_order(&protectors),
    };

    for idx in order {
        let protector = protectors
            .get(idx)
            .ok_or_else(|| bde_err!(ErrorKind::InvalidArgument, "protector_order index {} out of range", idx))?;

        let vmk_result = if protector.protection_type == ProtectionType::ClearKey {
            try_clear_key(protector)
        } else {
            attempt_credentials(protector, credentials, options.abort.as_deref())
        };

        let succeeded = vmk_result.is_ok();
        observer.on_event(Event::ProtectorAttempted {
            protector_id: protector.identifier.to_string(),
            protection_type: protector.protection_type,
            succeeded,
        });

        if let Ok(vmk) = vmk_result {
            if let Ok(keys) = unwrap_fvek(block, &vmk) {
                observer.on_event(Event::Unlocked { method: keys.method.name() });
                return Ok(keys);
            }
        }
    }

    Err(BdeError::new(ErrorKind::UnlockFailed, "no credential/protector pair unlocked the volume"))
}

fn attempt_credentials(
    protector: &KeyProtector,
    credentials: &[Credential],
    abort: Option<&AtomicBool>,
) -> Result<Zeroizing<Vec<u8>>> {
    for credential in credentials {
        if !credential_matches(protector.protection_type, credential) {
            continue;
        }
        let attempt = match credential {
            Credential::RecoveryPassword(s) => {
                RecoveryPassword::parse(s).and_then(|rp| try_password(protector, &rp.password_hash(), abort))
            }
            Credential::Password(p) => try_password(protector, &user_password_hash(p), abort),
            Credential::StartupKey(raw) => try_startup_key(protector, raw),
            Credential::FullVolumeEncryptionKey(_) | Credential::VolumeMasterKey(_) => {
                unreachable!("credential_matches never matches the direct-key credential kinds")
            }
        };
        if attempt.is_ok() {
            return attempt;
        }
    }
    Err(bde_err!(ErrorKind::UnlockFailed, "no configured credential matched this protector"))
}

fn credential_matches(protection_type: ProtectionType, credential: &Credential) -> bool {
    matches!(
        (protection_type, credential),
        (ProtectionType::RecoveryPassword, Credential::RecoveryPassword(_))
            | (ProtectionType::UserPassword, Credential::Password(_))
            | (ProtectionType::StartupKey, Credential::StartupKey(_))
    )
}

/// Clear-key protectors always sort first; ties otherwise keep metadata
/// order (a stable sort).
fn default_protector_order(protectors: &[KeyProtector]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..protectors.len()).collect();
    order.sort_by_key(|&i| u8::from(protectors[i].protection_type != ProtectionType::ClearKey));
    order
}

fn find_nested(entries: &[MetadataEntry], value_type: ValueType) -> Option<&MetadataEntry> {
    entries.iter().find(|e| e.value_type == value_type)
}

/// The VMK plaintext blob is itself a metadata entry; its `data` is the raw
/// VMK bytes.
fn extract_vmk_from_plaintext(plaintext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut cur = Cursor::new(plaintext);
    let entry = MetadataEntry::parse_one(&mut cur)?;
    Ok(Zeroizing::new(entry.data))
}

fn unwrap_vmk_with_raw_key(protector: &KeyProtector, raw_key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let wrapped = find_nested(&protector.entries, ValueType::AesCcmEncrypted)
        .ok_or_else(|| bde_err!(ErrorKind::InvalidData, "protector has no wrapped VMK blob"))?;
    let blob = wrapped.as_aes_ccm()?;
    let plaintext = crypto::aes_ccm_decrypt(raw_key, &blob.nonce, &blob.mac, blob.ciphertext)?;
    extract_vmk_from_plaintext(&plaintext)
}

/// A clear-key protector carries its own unlock key in the clear, alongside
/// the VMK blob that key wraps.
fn try_clear_key(protector: &KeyProtector) -> Result<Zeroizing<Vec<u8>>> {
    let key_entry = find_nested(&protector.entries, ValueType::Key)
        .ok_or_else(|| bde_err!(ErrorKind::InvalidData, "clear-key protector has no raw key entry"))?;
    unwrap_vmk_with_raw_key(protector, &key_entry.data)
}

/// A startup-key protector's `.BEK` key is already high-entropy and is used
/// directly as the CCM key, without a stretch-key pass.
fn try_startup_key(protector: &KeyProtector, raw_key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    unwrap_vmk_with_raw_key(protector, raw_key)
}

/// Recovery-password and user-password protectors stretch the password hash
/// through the BitLocker loop before it can unwrap the VMK blob.
fn try_password(protector: &KeyProtector, password_hash: &[u8; 32], abort: Option<&AtomicBool>) -> Result<Zeroizing<Vec<u8>>> {
    let stretch_entry = find_nested(&protector.entries, ValueType::StretchKey)
        .ok_or_else(|| bde_err!(ErrorKind::InvalidData, "password protector has no stretch-key entry"))?;
    let info = stretch_entry.as_stretch_key()?;
    let intermediate = crypto::stretch_key(password_hash, &info.salt, abort)?;
    let blob = info.wrapped.as_aes_ccm()?;
    let plaintext = crypto::aes_ccm_decrypt(&intermediate, &blob.nonce, &blob.mac, blob.ciphertext)?;
    extract_vmk_from_plaintext(&plaintext)
}

fn unwrap_fvek(block: &FveMetadataBlock, vmk: &[u8]) -> Result<UnlockedKeys> {
    let fvek_entry = block
        .fvek_entry()
        .ok_or_else(|| bde_err!(ErrorKind::ValueMissing, "metadata block has no FVEK entry"))?;
    let blob = fvek_entry.as_aes_ccm()?;
    let plaintext = crypto::aes_ccm_decrypt(vmk, &blob.nonce, &blob.mac, blob.ciphertext)?;
    if plaintext.len() < 2 {
        return Err(bde_err!(ErrorKind::InvalidData, "decrypted FVEK payload too short"));
    }
    let method = EncryptionMethod::from_raw(u16::from_le_bytes(plaintext[0..2].try_into().unwrap()))?;
    split_key_payload(method, &plaintext[2..])
}

fn split_key_payload(method: EncryptionMethod, key_bytes: &[u8]) -> Result<UnlockedKeys> {
    let half = method.half_key_len();
    if method.has_second_half() {
        if key_bytes.len() < half * 2 {
            return Err(bde_err!(ErrorKind::InvalidData, "FVEK payload too short for {}", method.name()));
        }
        Ok(UnlockedKeys {
            method,
            fvek: Zeroizing::new(key_bytes[..half].to_vec()),
            tweak: Some(Zeroizing::new(key_bytes[half..half * 2].to_vec())),
        })
    } else {
        if key_bytes.len() < half {
            return Err(bde_err!(ErrorKind::InvalidData, "FVEK payload too short for {}", method.name()));
        }
        Ok(UnlockedKeys {
            method,
            fvek: Zeroizing::new(key_bytes[..half].to_vec()),
            tweak: None,
        })
    }
}

/// A `property` entry, when present, carries the encryption method in the
/// clear; used to size a caller-supplied raw FVEK (the `FullVolumeEncryptionKey`
/// escrow credential) without needing to unwrap anything first.
fn plaintext_encryption_method_hint(block: &FveMetadataBlock) -> Option<EncryptionMethod> {
    block
        .entries
        .iter()
        .filter(|e| e.entry_type == EntryType::Property)
        .find_map(|e| {
            if e.data.len() < 2 {
                return None;
            }
            EncryptionMethod::from_raw(u16::from_le_bytes(e.data[0..2].try_into().unwrap())).ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::LogObserver;
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

    fn ccm_wrap(key: &[u8], nonce: [u8; 12], plaintext: &[u8]) -> Vec<u8> {
        use aead::generic_array::GenericArray;
        use aes::cipher::KeyInit;
        use ccm::aead::Aead;
        use ccm::consts::{U12, U16};
        use ccm::Ccm;
        type Aes256Ccm = Ccm<aes::Aes256, U16, U12>;
        let cipher = Aes256Ccm::new(GenericArray::from_slice(key));
        let mut ct = cipher.encrypt(GenericArray::from_slice(&nonce), plaintext).unwrap();
        let mac = ct.split_off(ct.len() - 16);
        let mut blob = Vec::new();
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&mac);
        blob.extend_from_slice(&ct);
        blob
    }

    /// A minimal `volume-master-key` entry for a clear-key protector: a raw
    /// key entry plus an aes-ccm-encrypted VMK-bytes entry wrapped under it.
    fn clear_key_protector_entry(vmk: &[u8; 32]) -> Vec<u8> {
        let raw_key = [0x11u8; 32];
        let vmk_entry = build_entry(0x0002, 0x0008, vmk); // VolumeMasterKey entry/value
        let ccm = ccm_wrap(&raw_key, [0x01; 12], &vmk_entry);
        let key_entry = build_entry(0x0000, 0x0001, &raw_key); // value_type Key
        let ccm_entry = build_entry(0x0000, 0x0005, &ccm); // value_type AesCcmEncrypted

        let mut protector_data = Vec::new();
        protector_data.extend_from_slice(&[0u8; 16]); // identifier GUID
        protector_data.extend_from_slice(&0u64.to_le_bytes()); // last_changed FILETIME
        protector_data.extend_from_slice(&0x0000u16.to_le_bytes()); // protection_type ClearKey
        protector_data.extend_from_slice(&key_entry);
        protector_data.extend_from_slice(&ccm_entry);

        build_entry(0x0002, 0x0008, &protector_data) // entry_type VolumeMasterKey
    }

    fn fvek_entry(vmk: &[u8], method: u16, fvek_payload: &[u8]) -> Vec<u8> {
        let mut plaintext = Vec::new();
        plaintext.extend_from_slice(&method.to_le_bytes());
        plaintext.extend_from_slice(fvek_payload);
        let ccm = ccm_wrap(vmk, [0x02; 12], &plaintext);
        build_entry(0x0003, 0x0005, &ccm) // entry_type FullVolumeEncryptionKey, AesCcmEncrypted
    }

    fn build_block(entries: &[u8]) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(&0u64.to_le_bytes()); // integrity field
        header.extend_from_slice(&[0u8; 16]); // volume guid
        header.extend_from_slice(&1u64.to_le_bytes()); // sequence number
        header.extend_from_slice(&1_000_000u64.to_le_bytes());
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
    fn unlocks_with_no_credentials_via_clear_key_protector() {
        let vmk = [0x33u8; 32];
        let mut entries = clear_key_protector_entry(&vmk);
        entries.extend_from_slice(&fvek_entry(&vmk, 0x8003, &[0x44u8; 32])); // AES-256-CBC

        let block_bytes = build_block(&entries);
        let source = MemorySource::new(block_bytes);
        let block = FveMetadataBlock::parse(&source, 0).unwrap();

        let keys = unlock(&block, &[], &OpenOptions::default(), &LogObserver).unwrap();
        assert_eq!(keys.method, EncryptionMethod::Aes256Cbc);
        assert_eq!(&keys.fvek[..], &[0x44u8; 32][..]);
        assert!(keys.tweak.is_none());
    }

    #[test]
    fn unlocks_diffuser_mode_and_splits_tweak_half() {
        let vmk = [0x55u8; 32];
        let mut entries = clear_key_protector_entry(&vmk);
        let mut payload = vec![0x66u8; 16];
        payload.extend(vec![0x77u8; 16]);
        entries.extend_from_slice(&fvek_entry(&vmk, 0x8000, &payload)); // AES-128 + diffuser

        let block_bytes = build_block(&entries);
        let source = MemorySource::new(block_bytes);
        let block = FveMetadataBlock::parse(&source, 0).unwrap();

        let keys = unlock(&block, &[], &OpenOptions::default(), &LogObserver).unwrap();
        assert_eq!(keys.method, EncryptionMethod::Aes128Diffuser);
        assert_eq!(&keys.fvek[..], &[0x66u8; 16][..]);
        assert_eq!(&keys.tweak.unwrap()[..], &[0x77u8; 16][..]);
    }

    #[test]
    fn volume_master_key_credential_bypasses_protector_unwrap() {
        let vmk = [0x22u8; 32];
        let entries = fvek_entry(&vmk, 0x8002, &[0x99u8; 16]); // AES-128-CBC
        let block_bytes = build_block(&entries);
        let source = MemorySource::new(block_bytes);
        let block = FveMetadataBlock::parse(&source, 0).unwrap();

        let credentials = [Credential::VolumeMasterKey(vmk.to_vec())];
        let keys = unlock(&block, &credentials, &OpenOptions::default(), &LogObserver).unwrap();
        assert_eq!(keys.method, EncryptionMethod::Aes128Cbc);
        assert_eq!(&keys.fvek[..], &[0x99u8; 16][..]);
    }

    #[test]
    fn wrong_credential_fails_with_unlock_failed() {
        let vmk = [0x33u8; 32];
        let mut entries = Vec::new();
        // A user-password protector; no clear-key protector present.
        let stretch_header_salt = [0x00u8; 16];
        let vmk_entry = build_entry(0x0002, 0x0008, &vmk);
        let password_hash = user_password_hash("correct horse battery staple");
        let intermediate = crypto::stretch_key(&password_hash, &stretch_header_salt, None).unwrap();
        let ccm = ccm_wrap(&intermediate, [0x03; 12], &vmk_entry);
        let ccm_entry = build_entry(0x0000, 0x0005, &ccm);
        let mut stretch_payload = vec![0u8; 2];
        stretch_payload.extend_from_slice(&stretch_header_salt);
        stretch_payload.extend_from_slice(&ccm_entry);
        let stretch_entry = build_entry(0x0000, 0x0003, &stretch_payload);

        let mut protector_data = Vec::new();
        protector_data.extend_from_slice(&[0u8; 16]);
        protector_data.extend_from_slice(&0u64.to_le_bytes());
        protector_data.extend_from_slice(&0x1000u16.to_le_bytes()); // UserPassword
        protector_data.extend_from_slice(&stretch_entry);
        entries.extend_from_slice(&build_entry(0x0002, 0x0008, &protector_data));
        entries.extend_from_slice(&fvek_entry(&vmk, 0x8002, &[0x11u8; 16]));

        let block_bytes = build_block(&entries);
        let source = MemorySource::new(block_bytes);
        let block = FveMetadataBlock::parse(&source, 0).unwrap();

        let wrong = [Credential::Password("wrong password".to_string())];
        let err = unlock(&block, &wrong, &OpenOptions::default(), &LogObserver).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnlockFailed);

        let right = [Credential::Password("correct horse battery staple".to_string())];
        let keys = unlock(&block, &right, &OpenOptions::default(), &LogObserver).unwrap();
        assert_eq!(&keys.fvek[..], &[0x11u8; 16][..]);
    }
}
