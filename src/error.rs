//! Error taxonomy for the block store.

use std::fmt;
use std::io;

/// Errors that can occur while operating on a DBS device.
///
/// `Busy`, `AlreadyExists`, `NotFound` and `OutOfSpace` are also reachable
/// through the boolean-returning operations (they collapse to `Ok(false)`
/// there); they remain full variants here because lower layers need to
/// distinguish them before a caller decides whether to report them as a
/// hard error or a graceful `false`.
#[derive(Debug)]
pub enum DbsError {
    /// A read, write or flush on the backing file failed or returned a
    /// short count.
    Io(io::Error),
    /// The magic, version or an on-disk invariant didn't check out.
    Corrupt(String),
    /// No free extent, volume slot or snapshot slot remained.
    OutOfSpace,
    /// A volume name collided with an existing one.
    AlreadyExists,
    /// A volume name or snapshot id didn't resolve to anything.
    NotFound,
    /// The target of the operation is in use and cannot be touched right
    /// now (a writable head snapshot, or a device already locked by
    /// another open).
    Busy,
    /// An argument was malformed: wrong size, name too long, lbi out of
    /// bounds.
    InvalidArgument(String),
}

impl fmt::Display for DbsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Corrupt(msg) => write!(f, "corrupt device: {msg}"),
            Self::OutOfSpace => write!(f, "out of space"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::NotFound => write!(f, "not found"),
            Self::Busy => write!(f, "busy"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for DbsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DbsError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, DbsError>;

/// Tells whether an error represents one of the graceful-failure cases
/// the library API reports as a plain `false` rather than propagating it.
pub fn is_graceful(e: &DbsError) -> bool {
    matches!(
        e,
        DbsError::Busy | DbsError::AlreadyExists | DbsError::NotFound | DbsError::OutOfSpace
    )
}
