// Linux procfs-based connection table backend

use super::{CaptureError, ConnectionTableBackend};
use crate::backends::table::{AddressFamily, TableError};
use crate::backends::{BackendCapabilities, BackendPriority};
use crate::connection::{ConnectionRecord, ConnectionState};
use anyhow::Result;
use procfs::net::{TcpNetEntry, TcpState};
use procfs::process::{FDTarget, all_processes};
use std::collections::HashMap;
use std::sync::Mutex;

/// Connection table backend using the Linux /proc filesystem
///
/// Reads rows from:
/// - /proc/net/tcp - TCP IPv4 table
/// - /proc/net/tcp6 - TCP IPv6 table
///
/// and attributes them to processes by matching socket inodes found under
/// /proc/[pid]/fd/. Sockets owned by processes we cannot inspect get pid 0.
pub struct ProcfsTableBackend {
    /// Socket inode -> owning pid, rebuilt once per snapshot
    socket_owners: Mutex<HashMap<u64, u32>>,
}

impl ProcfsTableBackend {
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("procfs not available (is /proc mounted?)");
        }
        Ok(Self {
            socket_owners: Mutex::new(HashMap::new()),
        })
    }

    /// Socket inode -> owning pid, built by scanning every readable fd table
    fn scan_socket_owners() -> HashMap<u64, u32> {
        let mut owners = HashMap::new();

        let processes = match all_processes() {
            Ok(processes) => processes,
            Err(e) => {
                log::warn!("Failed to enumerate processes: {}", e);
                return owners;
            }
        };

        for process in processes.flatten() {
            let pid = process.pid() as u32;
            // Permission denied for other users' processes unless root
            let Ok(fds) = process.fd() else {
                continue;
            };
            for fd in fds.flatten() {
                if let FDTarget::Socket(inode) = fd.target {
                    owners.insert(inode, pid);
                }
            }
        }

        owners
    }
}

impl ConnectionTableBackend for ProcfsTableBackend {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Good
    }

    fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            ipv4_support: true,
            ipv6_support: std::path::Path::new("/proc/net/tcp6").exists(),
            owning_pid: true,
            scope_ids: false,
        }
    }

    fn prepare_snapshot(&self) {
        let owners = Self::scan_socket_owners();
        log::trace!("Mapped {} socket inodes to owners", owners.len());
        *self
            .socket_owners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = owners;
    }

    fn capture_family(&self, family: AddressFamily) -> Result<Vec<ConnectionRecord>, CaptureError> {
        let entries = match family {
            AddressFamily::Ipv4 => procfs::net::tcp(),
            AddressFamily::Ipv6 => procfs::net::tcp6(),
        }
        .map_err(|e| TableError::QueryFailed {
            family,
            reason: e.to_string(),
        })?;

        let owners = self
            .socket_owners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries
            .iter()
            .map(|entry| record_from_entry(entry, &owners))
            .collect())
    }
}

fn record_from_entry(entry: &TcpNetEntry, owners: &HashMap<u64, u32>) -> ConnectionRecord {
    ConnectionRecord {
        local: entry.local_address,
        remote: entry.remote_address,
        pid: owners.get(&entry.inode).copied().unwrap_or(0),
        state: state_from_procfs(&entry.state),
    }
}

/// Map kernel TCP states onto the table's state codes
fn state_from_procfs(state: &TcpState) -> ConnectionState {
    match state {
        TcpState::Established => ConnectionState::Established,
        TcpState::SynSent => ConnectionState::SynSent,
        TcpState::SynRecv => ConnectionState::SynRcvd,
        TcpState::FinWait1 => ConnectionState::FinWait1,
        TcpState::FinWait2 => ConnectionState::FinWait2,
        TcpState::TimeWait => ConnectionState::TimeWait,
        TcpState::Close => ConnectionState::Closed,
        TcpState::CloseWait => ConnectionState::CloseWait,
        TcpState::LastAck => ConnectionState::LastAck,
        TcpState::Listen => ConnectionState::Listen,
        TcpState::Closing => ConnectionState::Closing,
        // Request socket for a half-open connection; the table has no separate code
        TcpState::NewSynRecv => ConnectionState::SynRcvd,
    }
}
