// Caller-supplied unlock material: the five protector-adjacent credential
// shapes enumerated in the key-hierarchy component, plus recovery-password
// parsing and validation (group range, divisibility, check digit).

use sha2::{Digest, Sha256};

use crate::error::{BdeError, ErrorKind, Result};

const GROUP_COUNT: usize = 8;
// Largest multiple of 11 whose quotient still fits in u16 (65_535 * 11);
// 720_896 itself divides to 65_536, which silently truncated to 0 as u16.
const GROUP_MAX: u32 = 720_885;

/// One unlock attempt's input. A `Volume::unlock` call tries every
/// configured credential against every key protector in the chosen FVE
/// metadata block.
#[derive(Clone)]
pub enum Credential {
    /// 48-digit (or 55-character dashed) recovery password.
    RecoveryPassword(String),
    /// UTF-8 user password, re-encoded to UTF-16LE before hashing.
    Password(String),
    /// Raw 32-byte external key read from a `.BEK` file.
    StartupKey(Vec<u8>),
    /// Raw FVEK, bypassing protector unwrap entirely (debug/escrow).
    FullVolumeEncryptionKey(Vec<u8>),
    /// Raw VMK, bypassing protector unwrap but still unwrapping the FVEK.
    VolumeMasterKey(Vec<u8>),
}

/// A parsed, validated BitLocker recovery password: 8 groups of 6 decimal
/// digits, each group divisible by 11 and at most 720,885.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPassword {
    /// Each group's value after dividing out the factor of 11.
    groups: [u16; GROUP_COUNT],
}

impl RecoveryPassword {
    /// Parses either the 48-digit compact form or the 55-character
    /// `dddddd-dddddd-...-dddddd` dashed form. Non-digit characters are
    /// stripped before grouping, so both forms (and minor whitespace noise)
    /// are accepted.
    pub fn parse(input: &str) -> Result<Self> {
        let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() != GROUP_COUNT * 6 {
            return Err(BdeError::new(
                ErrorKind::InvalidArgument,
                format!("recovery password must contain {} digits, found {}", GROUP_COUNT * 6, digits.len()),
            ));
        }

        let mut groups = [0u16; GROUP_COUNT];
        for (i, group) in groups.iter_mut().enumerate() {
            let raw = &digits[i * 6..i * 6 + 6];
            let value: u32 = raw
                .parse()
                .map_err(|_| BdeError::new(ErrorKind::InvalidArgument, "recovery password group is not numeric"))?;
            if value > GROUP_MAX || value % 11 != 0 {
                return Err(BdeError::new(
                    ErrorKind::InvalidArgument,
                    format!("recovery password group {} ({}) fails the divisible-by-11 check digit", i, raw),
                ));
            }
            *group = (value / 11) as u16;
        }
        Ok(RecoveryPassword { groups })
    }

    /// `SHA-256` of the 16-byte little-endian-packed group values — the
    /// `password_hash` fed into the stretch loop for a recovery-password
    /// unlock attempt.
    pub fn password_hash(&self) -> [u8; 32] {
        let mut buf = [0u8; 16];
        for (i, group) in self.groups.iter().enumerate() {
            buf[i * 2..i * 2 + 2].copy_from_slice(&group.to_le_bytes());
        }
        Sha256::digest(buf).into()
    }

    /// Re-formats as the canonical dashed 55-character string. Parsing this
    /// output reproduces the same `RecoveryPassword`.
    pub fn to_canonical_string(&self) -> String {
        self.groups
            .iter()
            .map(|g| format!("{:06}", (*g as u32) * 11))
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// `SHA-256(SHA-256(UTF-16LE(password)))`, the `password_hash` fed into the
/// stretch loop for a user-password unlock attempt.
pub fn user_password_hash(password: &str) -> [u8; 32] {
    let utf16le: Vec<u8> = password.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let first = Sha256::digest(&utf16le);
    Sha256::digest(first).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_groups() -> [u32; 8] {
        // Each value chosen divisible by 11 and <= 720,896.
        [110, 220, 330, 440, 550, 660, 770, 880]
    }

    fn sample_string() -> String {
        sample_groups().iter().map(|v| format!("{:06}", v)).collect::<Vec<_>>().join("-")
    }

    #[test]
    fn parses_dashed_and_compact_forms_identically() {
        let dashed = sample_string();
        let compact: String = dashed.chars().filter(|c| *c != '-').collect();
        assert_eq!(RecoveryPassword::parse(&dashed).unwrap(), RecoveryPassword::parse(&compact).unwrap());
    }

    #[test]
    fn round_trips_through_canonical_string() {
        let original = sample_string();
        let parsed = RecoveryPassword::parse(&original).unwrap();
        assert_eq!(parsed.to_canonical_string(), original);
    }

    #[test]
    fn rejects_group_not_divisible_by_eleven() {
        let mut groups = sample_groups();
        groups[0] += 1;
        let s = groups.iter().map(|v| format!("{:06}", v)).collect::<Vec<_>>().join("-");
        assert_eq!(RecoveryPassword::parse(&s).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_group_above_maximum() {
        let mut groups = sample_groups();
        groups[3] = 720_907; // divisible by 11, but over the cap
        let s = groups.iter().map(|v| format!("{:06}", v)).collect::<Vec<_>>().join("-");
        assert_eq!(RecoveryPassword::parse(&s).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_group_that_would_truncate_to_zero_as_u16() {
        let mut groups = sample_groups();
        groups[3] = 720_896; // divisible by 11, but 720_896 / 11 == 65_536
        let s = groups.iter().map(|v| format!("{:06}", v)).collect::<Vec<_>>().join("-");
        assert_eq!(RecoveryPassword::parse(&s).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_wrong_digit_count() {
        assert!(RecoveryPassword::parse("123456-123456").is_err());
    }

    #[test]
    fn password_hash_is_deterministic() {
        let rp = RecoveryPassword::parse(&sample_string()).unwrap();
        assert_eq!(rp.password_hash(), rp.password_hash());
    }

    #[test]
    fn user_password_hash_is_deterministic_and_sensitive_to_input() {
        assert_eq!(user_password_hash("hunter2"), user_password_hash("hunter2"));
        assert_ne!(user_password_hash("hunter2"), user_password_hash("hunter3"));
    }
}
