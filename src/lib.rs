//! Read-only access to BitLocker Drive Encryption (BDE) volumes.
//!
//! Given a byte-addressable image of a BitLocker-protected volume and some
//! unlock material (a recovery password, a user password, a startup key, a
//! raw VMK or FVEK), [`Volume`] parses the on-disk header and FVE metadata,
//! derives the Full Volume Encryption Key, and exposes the plaintext volume
//! as a random-access block device via [`Volume::read_at`].
//!
//! Layout mirrors the bottom-up component breakdown of the format this
//! crate implements: byte sources and binary decoders at the bottom,
//! crypto primitives next to them, header/metadata parsing and the key
//! hierarchy above that, and the sector codec plus volume facade on top.

mod bek;
mod binary;
mod credential;
mod crypto;
mod error;
mod header;
mod key;
mod metadata;
mod observer;
mod options;
mod source;
mod volume;

pub use bek::parse_startup_key;
pub use binary::{FileTime, Guid};
pub use credential::{user_password_hash, Credential, RecoveryPassword};
pub use error::{BdeError, ErrorKind, Result};
pub use header::{BdeVariant, VolumeHeader};
pub use key::UnlockedKeys;
pub use metadata::{EncryptionMethod, KeyProtector, ProtectionType};
pub use observer::{Event, LogObserver, Observer};
pub use options::OpenOptions;
pub use source::{ByteSource, FileSource, MemorySource, SplitSource};
pub use volume::{ProtectorSummary, Volume};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_surface_compiles_a_locked_open() {
        // A too-short source is rejected before anything credential-shaped
        // is needed; exercises the crate's public entry point end to end.
        let source: Box<dyn ByteSource> = Box::new(MemorySource::new(vec![0u8; 16]));
        let err = Volume::open(source, OpenOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
