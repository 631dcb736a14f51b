//! Common error types for Lockbox.

use thiserror::Error;

/// Top-level error type for Lockbox operations.
///
/// Variants are grouped by origin: input validation, cryptographic
/// integrity, hardware and storage. Callers match on the variant to pick
/// recovery guidance, so integrity variants deliberately carry no detail.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Algorithm identifier is reserved or unknown.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Operation not permitted by the active policy.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Cryptographic primitive failed for a reason other than integrity.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Key unwrap failed its integrity check.
    #[error("Key unwrap integrity check failed")]
    IntegrityFailure,

    /// Payload decryption failed authentication.
    #[error("Payload authentication failed")]
    AuthenticationFailure,

    /// Hardware security key failure.
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// Vault operation failed.
    #[error("Vault error: {0}")]
    Vault(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Container bytes are malformed.
    #[error("Corrupted container: {0}")]
    Corrupted(String),

    /// Container carries a version this build cannot read.
    #[error("Unsupported container version: {0}")]
    UnsupportedVersion(u32),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Filesystem refused access.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No space left on the target device.
    #[error("Storage full: {0}")]
    StorageFull(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Map an I/O error into the storage taxonomy, keeping the context string.
    ///
    /// `NotFound`, `PermissionDenied` and `StorageFull` get their own variants
    /// so callers can tell them apart; everything else stays `Io`.
    pub fn from_io(err: std::io::Error, context: impl AsRef<str>) -> Self {
        use std::io::ErrorKind;

        let context = context.as_ref();
        match err.kind() {
            ErrorKind::NotFound => Error::NotFound(format!("{}: {}", context, err)),
            ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("{}: {}", context, err))
            }
            ErrorKind::StorageFull => Error::StorageFull(format!("{}: {}", context, err)),
            _ => Error::Io(err),
        }
    }

    /// Whether this error came from the hardware adapter timing out on touch.
    pub fn is_presence_timeout(&self) -> bool {
        matches!(self, Error::Hardware(HardwareError::PresenceTimeout))
    }
}

/// Hardware security key errors.
///
/// Each variant maps to different guidance for the user (plug in the key,
/// retype the PIN, reset the device, touch the key), so they are never
/// folded together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    /// No compatible device is connected.
    #[error("no security key found")]
    NoDevice,

    /// Device rejected the PIN.
    #[error("incorrect PIN ({} attempts remaining)", attempts_label(retries_left))]
    WrongPin {
        /// Attempts left before lockout, when the device reports it.
        retries_left: Option<u8>,
    },

    /// Device PIN is blocked after too many failures.
    #[error("PIN is locked; the device must be reset")]
    PinLocked,

    /// User did not touch the device in time.
    #[error("timed out waiting for user presence")]
    PresenceTimeout,

    /// Operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Requested challenge-response algorithm is reserved.
    #[error("unsupported challenge-response algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Device does not know the addressed credential.
    #[error("credential not found on device")]
    CredentialNotFound,

    /// Adapter has not been initialized.
    #[error("hardware adapter not initialized")]
    NotInitialized,

    /// Transport-level failure.
    #[error("transport failure: {0}")]
    Transport(String),
}

fn attempts_label(retries_left: &Option<u8>) -> String {
    retries_left.map_or_else(|| "unknown".to_string(), |r| r.to_string())
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
