// AES primitives, the BitLocker stretch-key loop, AES-CCM unwrap, and the
// Elephant diffuser, built on the RustCrypto `aes`/`cipher` family with
// `ccm` for the metadata-unwrap authenticated encryption.

use aead::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncrypt, KeyInit, KeyIvInit};
use ccm::aead::Aead;
use ccm::consts::{U12, U16};
use ccm::Ccm;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use xts_mode::Xts128;
use zeroize::Zeroize;

use crate::error::{BdeError, ErrorKind, Result};

type Aes128Ccm = Ccm<aes::Aes128, U16, U12>;
type Aes256Ccm = Ccm<aes::Aes256, U16, U12>;

/// Encrypts a single 16-byte block under ECB mode, used for the BitLocker
/// CBC-IV and Elephant-diffuser keystream derivations (`AES-ECB-encrypt`).
pub fn aes_ecb_encrypt_block(key: &[u8], block: &mut [u8; 16]) -> Result<()> {
    let mut ga = GenericArray::clone_from_slice(block);
    match key.len() {
        16 => aes::Aes128::new(GenericArray::from_slice(key)).encrypt_block(&mut ga),
        32 => aes::Aes256::new(GenericArray::from_slice(key)).encrypt_block(&mut ga),
        n => {
            return Err(BdeError::new(
                ErrorKind::InvalidData,
                format!("unsupported AES key size {} bytes", n),
            ))
        }
    }
    block.copy_from_slice(ga.as_slice());
    Ok(())
}

/// Decrypts `buf` (which must be a whole number of 16-byte blocks) in place
/// under AES-CBC with the given key and IV, no padding.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8; 16], buf: &mut [u8]) -> Result<()> {
    if buf.len() % 16 != 0 {
        return Err(BdeError::new(ErrorKind::InvalidData, "CBC buffer is not block-aligned"));
    }
    match key.len() {
        16 => {
            let dec = cbc::Decryptor::<aes::Aes128>::new(key.into(), iv.into());
            dec.decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(buf)
                .map_err(|_| BdeError::new(ErrorKind::InvalidData, "CBC decrypt failed"))?;
        }
        32 => {
            let dec = cbc::Decryptor::<aes::Aes256>::new(key.into(), iv.into());
            dec.decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(buf)
                .map_err(|_| BdeError::new(ErrorKind::InvalidData, "CBC decrypt failed"))?;
        }
        n => {
            return Err(BdeError::new(
                ErrorKind::InvalidData,
                format!("unsupported AES key size {} bytes", n),
            ))
        }
    }
    Ok(())
}

/// `LE128(v)`: a 64-bit value zero-extended to a 128-bit little-endian byte
/// string, used as the per-sector CBC IV seed and the diffuser tweak base.
pub fn le128(v: u64) -> [u8; 16] {
    (v as u128).to_le_bytes()
}

/// `LE128(v) + delta`, used for the second and later Elephant-diffuser
/// keystream blocks within one sector.
pub fn le128_plus(v: u64, delta: u64) -> [u8; 16] {
    ((v as u128) + delta as u128).to_le_bytes()
}

/// Decrypts one AES-CCM-encrypted metadata blob: `{nonce[12], mac[16],
/// ciphertext}`, BitLocker's fixed parameterization (L=3, M=16). Returns the
/// authenticated plaintext, or `invalid_data` if the tag does not verify.
pub fn aes_ccm_decrypt(key: &[u8], nonce: &[u8], mac: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != 12 {
        return Err(BdeError::new(ErrorKind::InvalidData, "AES-CCM nonce must be 12 bytes"));
    }
    if mac.len() != 16 {
        return Err(BdeError::new(ErrorKind::InvalidData, "AES-CCM tag must be 16 bytes"));
    }
    let mut combined = Vec::with_capacity(ciphertext.len() + mac.len());
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(mac);
    let nonce = GenericArray::from_slice(nonce);

    let result = match key.len() {
        16 => {
            let cipher = Aes128Ccm::new(GenericArray::from_slice(key));
            cipher.decrypt(nonce, combined.as_ref())
        }
        32 => {
            let cipher = Aes256Ccm::new(GenericArray::from_slice(key));
            cipher.decrypt(nonce, combined.as_ref())
        }
        n => {
            return Err(BdeError::new(
                ErrorKind::InvalidData,
                format!("unsupported AES-CCM key size {} bytes", n),
            ))
        }
    };
    result.map_err(|_| BdeError::new(ErrorKind::InvalidData, "AES-CCM authentication failed"))
}

/// BitLocker's password-stretching construction: 2^20 iterations of SHA-256
/// over an 88-byte evolving state (`last_hash ∥ initial_hash ∥ salt ∥
/// counter`). Polled against `abort` every 4,096 iterations so a long-running
/// unlock can be cancelled promptly.
pub fn stretch_key(
    password_hash: &[u8; 32],
    salt: &[u8; 16],
    abort: Option<&std::sync::atomic::AtomicBool>,
) -> Result<[u8; 32]> {
    const ITERATIONS: u64 = 1_048_576;
    const ABORT_POLL_INTERVAL: u64 = 4_096;

    let mut state = [0u8; 88];
    state[32..64].copy_from_slice(password_hash);
    state[64..80].copy_from_slice(salt);
    // state[0..32] (last hash) and state[80..88] (counter) start zeroed.

    for i in 0..ITERATIONS {
        if i % ABORT_POLL_INTERVAL == 0 {
            if let Some(flag) = abort {
                if flag.load(std::sync::atomic::Ordering::Relaxed) {
                    state.zeroize();
                    return Err(BdeError::new(ErrorKind::AbortRequested, "stretch loop cancelled"));
                }
            }
        }
        let digest = Sha256::digest(state);
        state[0..32].copy_from_slice(&digest);
        let counter = u64::from_le_bytes(state[80..88].try_into().unwrap());
        state[80..88].copy_from_slice(&counter.wrapping_add(1).to_le_bytes());
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&state[0..32]);
    state.zeroize();
    Ok(out)
}

/// Diffuser-B and diffuser-A rotation constants, indexed by `i mod 4`.
const DIFFUSER_B_ROTATE: [u32; 4] = [0, 10, 0, 25];
const DIFFUSER_A_ROTATE: [u32; 4] = [9, 0, 13, 0];

fn bytes_to_words(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect()
}

fn words_to_bytes(words: &[u32], buf: &mut [u8]) {
    for (chunk, w) in buf.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&w.to_le_bytes());
    }
}

fn diffuser_pass_inverse(words: &mut [u32], rotate: &[u32; 4], rounds: usize) {
    let n = words.len();
    for _ in 0..rounds {
        for i in (0..n).rev() {
            let a = words[(i + 2) % n];
            let b = words[(i + 5) % n].rotate_left(rotate[i % 4]);
            words[i] = words[i].wrapping_sub(a ^ b);
        }
    }
}

/// Reverses the Elephant diffuser over one already CBC-decrypted sector,
/// given the TWEAK key (the second half of the FVEK payload in diffuser
/// modes) and the sector's logical block address.
pub fn elephant_diffuser_decrypt(tweak_key: &[u8], lba: u64, bps: u32, buf: &mut [u8]) -> Result<()> {
    if buf.len() != bps as usize || bps % 16 != 0 {
        return Err(BdeError::new(ErrorKind::InvalidData, "diffuser buffer size mismatch"));
    }

    let base = lba.checked_mul(bps as u64).ok_or_else(|| {
        BdeError::new(ErrorKind::InvalidData, "sector offset overflow computing diffuser tweak")
    })?;

    let mut sector_key = vec![0u8; bps as usize];
    for (i, block) in sector_key.chunks_exact_mut(16).enumerate() {
        let mut b = le128_plus(base, (i as u64) * 16);
        aes_ecb_encrypt_block(tweak_key, &mut b)?;
        block.copy_from_slice(&b);
    }

    let mut words = bytes_to_words(buf);
    diffuser_pass_inverse(&mut words, &DIFFUSER_B_ROTATE, 3);
    diffuser_pass_inverse(&mut words, &DIFFUSER_A_ROTATE, 5);
    words_to_bytes(&words, buf);

    for (b, k) in buf.iter_mut().zip(sector_key.iter()) {
        *b ^= k;
    }
    sector_key.zeroize();
    Ok(())
}

/// Decrypts one data unit (a whole physical sector) under AES-XTS, given
/// the two half-keys and the data-unit index (the sector's LBA) used as
/// the tweak.
pub fn aes_xts_decrypt(key1: &[u8], key2: &[u8], unit_index: u128, buf: &mut [u8]) -> Result<()> {
    if key1.len() != key2.len() {
        return Err(BdeError::new(ErrorKind::InvalidData, "XTS key halves differ in length"));
    }
    let get_tweak = |n: u128| n.to_le_bytes();
    match key1.len() {
        16 => {
            let cipher1 = aes::Aes128::new(GenericArray::from_slice(key1));
            let cipher2 = aes::Aes128::new(GenericArray::from_slice(key2));
            Xts128::new(cipher1, cipher2).decrypt_area(buf, buf.len(), unit_index, get_tweak);
        }
        32 => {
            let cipher1 = aes::Aes256::new(GenericArray::from_slice(key1));
            let cipher2 = aes::Aes256::new(GenericArray::from_slice(key2));
            Xts128::new(cipher1, cipher2).decrypt_area(buf, buf.len(), unit_index, get_tweak);
        }
        n => {
            return Err(BdeError::new(
                ErrorKind::InvalidData,
                format!("unsupported AES-XTS key size {} bytes", n),
            ))
        }
    }
    Ok(())
}

/// Constant-time equality check, used when validating recovery-password
/// check digits and any other caller-supplied secret material.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.ct_eq(b))
}
