// Flat error type for the whole crate: a kind plus an optional boxed cause.
// Covers the taxonomy BitLocker parsing and unlock can fail with (signature
// mismatch, invalid data, checksum mismatch, unlock failure, unsupported
// method, ...).

use std::error::Error as StdError;
use std::fmt;

/// The high-level reason an operation failed.
///
/// Kept flat (not nested per-component) so callers can match on it without
/// knowing which internal module produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-supplied buffer/offset/size violates a stated constraint.
    InvalidArgument,
    /// No known BDE variant detected in the boot sector.
    SignatureMismatch,
    /// Metadata entry malformed, length mismatch, or unknown required field.
    InvalidData,
    /// FVE metadata integrity check (where defined) failed.
    ChecksumMismatch,
    /// All protector/credential combinations were rejected.
    UnlockFailed,
    /// Encryption method or protector type recognized but not implemented.
    Unsupported,
    /// Operation requires the volume to be unlocked first.
    ValueMissing,
    /// Byte source returned an error or a short read mid-stream.
    ReadFailed,
    /// A long operation (key stretching) was cancelled by the caller.
    AbortRequested,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::SignatureMismatch => "signature_mismatch",
            ErrorKind::InvalidData => "invalid_data",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::UnlockFailed => "unlock_failed",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::ValueMissing => "value_missing",
            ErrorKind::ReadFailed => "read_failed",
            ErrorKind::AbortRequested => "abort_requested",
        };
        f.write_str(s)
    }
}

/// The crate's error type. Carries a short message and, where available, the
/// underlying cause (an I/O error, a lower-level parse failure, ...).
pub struct BdeError {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl BdeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        BdeError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        BdeError {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Debug for BdeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BdeError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for BdeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        let mut cause = self.source.as_deref();
        while let Some(c) = cause {
            write!(f, " -> {}", c)?;
            cause = c.source();
        }
        Ok(())
    }
}

impl StdError for BdeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|b| b.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for BdeError {
    fn from(e: std::io::Error) -> Self {
        BdeError::with_source(ErrorKind::ReadFailed, "byte source I/O failed", e)
    }
}

pub type Result<T> = std::result::Result<T, BdeError>;

macro_rules! bde_err {
    ($kind:expr, $($arg:tt)*) => {
        $crate::error::BdeError::new($kind, format!($($arg)*))
    };
}
pub(crate) use bde_err;
