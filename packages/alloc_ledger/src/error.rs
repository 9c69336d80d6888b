use std::io::{self, Write};
use std::process;

use thiserror::Error;

/// Errors that can occur when recording allocations in a [`Ledger`][crate::Ledger].
///
/// None of these are expected in a correctly functioning process. Seeing one means the
/// bookkeeping has lost track of reality, so the allocation hooks treat them as fatal.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A record with the same key is already present.
    ///
    /// For a ledger, this means an address was reported as newly allocated while a record for
    /// it was still live, which indicates either a missed release or address reuse by a path
    /// that bypasses the hooks.
    #[error("repeated key: a record with this key is already present")]
    RepeatedKey,

    /// The raw allocation source could not provide storage for bookkeeping records.
    #[error("raw allocation source could not provide {bytes} bytes of bookkeeping storage")]
    StorageExhausted {
        /// The size of the storage request that failed.
        bytes: usize,
    },
}

/// A specialized `Result` type for ledger operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// A static description usable from contexts that must not allocate.
    pub(crate) const fn as_static_str(&self) -> &'static str {
        match self {
            Self::RepeatedKey => {
                "alloc_ledger: allocation reported for an address that is already tracked\n"
            }
            Self::StorageExhausted { .. } => {
                "alloc_ledger: raw allocation source could not provide bookkeeping storage\n"
            }
        }
    }
}

/// Writes `message` to stderr and aborts the process.
///
/// Used from allocation hooks, which can neither return an error nor unwind. Nothing here
/// allocates: stderr is unbuffered and the message is static.
#[cold]
#[cfg_attr(test, mutants::skip)] // Aborting the test process is not observable by a test.
pub(crate) fn fatal(message: &'static str) -> ! {
    // There is nowhere left to report a failure to write the diagnostic.
    drop(io::stderr().write_all(message.as_bytes()));
    process::abort();
}

/// Unwraps a ledger result inside an allocation hook, aborting on error.
#[inline]
pub(crate) fn or_fatal<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => fatal(e.as_static_str()),
    }
}
