//! # Error Taxonomy
//!
//! All fallible operations return `eyre::Result`. Conditions a caller is
//! expected to react to are raised as an [`ArenaError`] inside the report
//! (`bail!(ArenaError::BadVersion { .. })`), so they can be recovered with
//! `report.downcast_ref::<ArenaError>()` or the [`ArenaError::kind_of`]
//! shortcut. Everything else (context chains around OS errors, broken
//! preconditions) stays a plain report.
//!
//! | Kind                  | Retry?                    | Caller action                     |
//! |-----------------------|---------------------------|-----------------------------------|
//! | `InvalidFormat`       | no                        | repair or recreate the file       |
//! | `AccessError`         | yes, at caller discretion | check permissions / disk          |
//! | `OutOfMemory`         | after reattach            | free memory, reattach             |
//! | `InvalidFreeSpace`    | after reset or reattach   | roll back the write transaction   |
//! | `BadVersion`          | no                        | fall back to the latest version   |
//! | `Retry`               | yes                       | re-check initiator status, attach |
//!
//! `InvalidFreeSpace` is sticky: once the allocator detects a broken free-list
//! invariant it refuses every further allocate/free until its free-space
//! tracking is rebuilt.

use std::fmt;

use crate::alloc::Ref;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    InvalidFormat { reason: String },
    AccessError { reason: String },
    OutOfMemory { requested: usize },
    InvalidFreeSpace { reason: String },
    BadVersion { version: u64 },
    Retry { reason: String },
    AllocationTooLarge { requested: usize, section_size: usize },
    InvalidRef { reference: Ref },
    ReadOnlyRef { reference: Ref },
    WrongTransactionState { expected: &'static str, actual: &'static str },
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidFormat,
    AccessError,
    OutOfMemory,
    InvalidFreeSpace,
    BadVersion,
    Retry,
    AllocationTooLarge,
    InvalidRef,
    ReadOnlyRef,
    WrongTransactionState,
    ReadOnly,
}

impl ArenaError {
    pub fn invalid_format(reason: impl Into<String>) -> Self {
        ArenaError::InvalidFormat {
            reason: reason.into(),
        }
    }

    pub fn access(reason: impl Into<String>) -> Self {
        ArenaError::AccessError {
            reason: reason.into(),
        }
    }

    pub fn invalid_free_space(reason: impl Into<String>) -> Self {
        ArenaError::InvalidFreeSpace {
            reason: reason.into(),
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        ArenaError::Retry {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ArenaError::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            ArenaError::AccessError { .. } => ErrorKind::AccessError,
            ArenaError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            ArenaError::InvalidFreeSpace { .. } => ErrorKind::InvalidFreeSpace,
            ArenaError::BadVersion { .. } => ErrorKind::BadVersion,
            ArenaError::Retry { .. } => ErrorKind::Retry,
            ArenaError::AllocationTooLarge { .. } => ErrorKind::AllocationTooLarge,
            ArenaError::InvalidRef { .. } => ErrorKind::InvalidRef,
            ArenaError::ReadOnlyRef { .. } => ErrorKind::ReadOnlyRef,
            ArenaError::WrongTransactionState { .. } => ErrorKind::WrongTransactionState,
            ArenaError::ReadOnly => ErrorKind::ReadOnly,
        }
    }

    /// Returns the taxonomy kind carried by `report`, searching its whole
    /// context chain.
    pub fn kind_of(report: &eyre::Report) -> Option<ErrorKind> {
        report
            .chain()
            .find_map(|cause| cause.downcast_ref::<ArenaError>())
            .map(ArenaError::kind)
    }
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::InvalidFormat { reason } => write!(f, "invalid file format: {}", reason),
            ArenaError::AccessError { reason } => write!(f, "access error: {}", reason),
            ArenaError::OutOfMemory { requested } => {
                write!(f, "out of memory: failed to grow arena by {} bytes", requested)
            }
            ArenaError::InvalidFreeSpace { reason } => {
                write!(f, "free-space tracking is invalid: {}", reason)
            }
            ArenaError::BadVersion { version } => {
                write!(f, "version {} is no longer retained", version)
            }
            ArenaError::Retry { reason } => write!(f, "attach must be retried: {}", reason),
            ArenaError::AllocationTooLarge {
                requested,
                section_size,
            } => write!(
                f,
                "allocation of {} bytes exceeds section size {}",
                requested, section_size
            ),
            ArenaError::InvalidRef { reference } => write!(f, "ref {} is not mapped", reference),
            ArenaError::ReadOnlyRef { reference } => {
                write!(f, "ref {} lies in the read-only baseline", reference)
            }
            ArenaError::WrongTransactionState { expected, actual } => write!(
                f,
                "transaction is {} but the operation requires {}",
                actual, expected
            ),
            ArenaError::ReadOnly => write!(f, "database was opened read-only"),
        }
    }
}

impl std::error::Error for ArenaError {}
