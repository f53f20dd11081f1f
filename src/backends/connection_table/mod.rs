// Cross-platform connection table backend system
//
// Each backend produces `ConnectionRecord`s for one address family at a time:
// - Windows: iphelper (GetExtendedTcpTable + raw row decoding)
// - Linux: procfs (/proc/net/tcp{,6} + fd inode scanning)

use crate::backends::decode::{DecodeError, decode_table};
use crate::backends::table::{AddressFamily, TableError, TableReader, TableSource};
use crate::backends::{BackendCapabilities, BackendPriority};
use crate::connection::ConnectionRecord;
use anyhow::Result;
use thiserror::Error;

#[cfg(target_os = "linux")]
mod procfs;

#[cfg(target_os = "linux")]
pub use self::procfs::ProcfsTableBackend;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Connection table backend trait
///
/// Abstracts how the OS connection table is read for one address family.
pub trait ConnectionTableBackend: Send + Sync {
    /// Backend name (e.g., "iphelper", "procfs")
    fn name(&self) -> &'static str;

    /// Backend priority for auto-selection
    fn priority(&self) -> BackendPriority;

    /// Check if this backend is available on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    /// Get backend capabilities
    fn capabilities(&self) -> BackendCapabilities;

    /// Called once at the start of every snapshot, before any family is read
    fn prepare_snapshot(&self) {}

    /// Read and decode the table for one family
    fn capture_family(&self, family: AddressFamily) -> Result<Vec<ConnectionRecord>, CaptureError>;
}

/// Backend metadata for selection
#[derive(Debug, Clone)]
pub struct TableBackendInfo {
    pub name: &'static str,
    pub priority: BackendPriority,
    pub available: bool,
}

/// Backend that reads raw owner-pid tables and decodes them row by row
pub struct RawTableBackend<S> {
    reader: TableReader<S>,
}

impl<S: TableSource> RawTableBackend<S> {
    pub fn new(source: S) -> Self {
        Self {
            reader: TableReader::new(source),
        }
    }
}

impl<S: TableSource> ConnectionTableBackend for RawTableBackend<S> {
    fn name(&self) -> &'static str {
        self.reader.source().name()
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Best
    }

    fn is_available() -> bool {
        S::is_available()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            ipv4_support: true,
            ipv6_support: true,
            owning_pid: true,
            scope_ids: true,
        }
    }

    fn capture_family(&self, family: AddressFamily) -> Result<Vec<ConnectionRecord>, CaptureError> {
        // Buffer is dropped on every path out of this function
        let buffer = self.reader.capture(family)?;
        let records = decode_table(family, &buffer)?;
        log::trace!(
            "{} {} table: {} bytes, {} rows",
            self.name(),
            family,
            buffer.len(),
            records.len()
        );
        Ok(records)
    }
}

#[cfg(target_os = "windows")]
pub type IpHelperTableBackend = RawTableBackend<crate::backends::table::IpHelperTableSource>;

/// Detect connection table backends on the current platform
pub fn detect_table_backends() -> Vec<TableBackendInfo> {
    #[allow(unused_mut)]
    let mut backends = Vec::new();

    #[cfg(target_os = "windows")]
    backends.push(TableBackendInfo {
        name: "iphelper",
        priority: BackendPriority::Best,
        available: IpHelperTableBackend::is_available(),
    });

    #[cfg(target_os = "linux")]
    backends.push(TableBackendInfo {
        name: "procfs",
        priority: BackendPriority::Good,
        available: ProcfsTableBackend::is_available(),
    });

    backends
}

/// Select a connection table backend, honoring an explicit preference
pub fn select_table_backend(preference: Option<&str>) -> Result<Box<dyn ConnectionTableBackend>> {
    if let Some(name) = preference {
        return create_table_backend(name);
    }

    detect_table_backends()
        .iter()
        .filter(|b| b.available)
        .max_by_key(|b| b.priority)
        .and_then(|info| create_table_backend(info.name).ok())
        .ok_or_else(|| anyhow::anyhow!("No connection table backend available on this platform"))
}

fn create_table_backend(name: &str) -> Result<Box<dyn ConnectionTableBackend>> {
    match name {
        #[cfg(target_os = "windows")]
        "iphelper" => Ok(Box::new(IpHelperTableBackend::new(
            crate::backends::table::IpHelperTableSource::new(),
        ))),

        #[cfg(target_os = "linux")]
        "procfs" => Ok(Box::new(ProcfsTableBackend::new()?)),

        _ => Err(anyhow::anyhow!("Unknown connection table backend: {}", name)),
    }
}
