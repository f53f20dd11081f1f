// OS connection table access with two-phase buffer sizing
//
// Native table queries report the byte length they need, then fill a caller
// buffer. The table can grow between those two calls, so `TableReader` allows
// exactly one re-probe before giving up on a family for the current cycle.

use std::fmt;
use thiserror::Error;

#[cfg(target_os = "windows")]
pub mod iphelper;

#[cfg(target_os = "windows")]
pub use iphelper::IpHelperTableSource;

/// Address family selector for a table query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Families in capture order
    pub const ALL: [AddressFamily; 2] = [AddressFamily::Ipv4, AddressFamily::Ipv6];

    pub fn name(&self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "IPv4",
            AddressFamily::Ipv6 => "IPv6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("{family} connection table unavailable: still too small after re-probe ({required} bytes needed)")]
    Unavailable {
        family: AddressFamily,
        required: usize,
    },
    #[error("{family} connection table query failed: {reason}")]
    QueryFailed {
        family: AddressFamily,
        reason: String,
    },
}

/// Result of a fetch call against a sized buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The buffer now holds the complete table
    Complete,
    /// The table outgrew the buffer; `required` is the new size hint
    TooSmall { required: usize },
}

/// A native connection table query.
///
/// Both calls are read-only and idempotent.
pub trait TableSource: Send + Sync {
    /// Source name (e.g., "iphelper")
    fn name(&self) -> &'static str;

    /// Check if this source can be queried on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    /// Learn the byte length the table needs right now. Writes no data.
    fn probe(&self, family: AddressFamily) -> Result<usize, TableError>;

    /// Fill `buffer` with the table for `family`
    fn fetch(&self, family: AddressFamily, buffer: &mut [u8]) -> Result<FetchOutcome, TableError>;
}

/// Captures raw table buffers from a `TableSource`
pub struct TableReader<S> {
    source: S,
}

impl<S: TableSource> TableReader<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Capture the raw table for one family.
    ///
    /// Probe, fetch, and on `TooSmall` re-probe and fetch exactly once more.
    /// The returned buffer is owned by the caller and freed when dropped.
    pub fn capture(&self, family: AddressFamily) -> Result<Vec<u8>, TableError> {
        let required = self.source.probe(family)?;
        match self.fetch_sized(family, required)? {
            FetchResult::Table(buffer) => return Ok(buffer),
            FetchResult::Grew(hint) => {
                log::debug!(
                    "{} table grew between probe and fetch ({} -> {} bytes), re-probing",
                    family,
                    required,
                    hint
                );
            }
        }

        let required = self.source.probe(family)?;
        match self.fetch_sized(family, required)? {
            FetchResult::Table(buffer) => Ok(buffer),
            FetchResult::Grew(hint) => {
                log::warn!(
                    "{} table still growing after re-probe, skipping this cycle",
                    family
                );
                Err(TableError::Unavailable {
                    family,
                    required: hint,
                })
            }
        }
    }

    fn fetch_sized(&self, family: AddressFamily, size: usize) -> Result<FetchResult, TableError> {
        let mut buffer = vec![0u8; size];
        match self.source.fetch(family, &mut buffer)? {
            FetchOutcome::Complete => Ok(FetchResult::Table(buffer)),
            FetchOutcome::TooSmall { required } => Ok(FetchResult::Grew(required)),
        }
    }
}

enum FetchResult {
    Table(Vec<u8>),
    Grew(usize),
}
