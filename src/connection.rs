// Connection values shared by every backend and the live monitor

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// TCP state as reported by the OS connection table.
///
/// Codes 1-12 follow the `MIB_TCP_STATE` numbering. Anything else is kept as
/// `Unknown` with its raw code so two unrecognized rows still compare by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    DeleteTcb,
    Unknown(u32),
}

impl ConnectionState {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ConnectionState::Closed,
            2 => ConnectionState::Listen,
            3 => ConnectionState::SynSent,
            4 => ConnectionState::SynRcvd,
            5 => ConnectionState::Established,
            6 => ConnectionState::FinWait1,
            7 => ConnectionState::FinWait2,
            8 => ConnectionState::CloseWait,
            9 => ConnectionState::Closing,
            10 => ConnectionState::LastAck,
            11 => ConnectionState::TimeWait,
            12 => ConnectionState::DeleteTcb,
            other => ConnectionState::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "Closed",
            ConnectionState::Listen => "Listen",
            ConnectionState::SynSent => "Syn-Sent",
            ConnectionState::SynRcvd => "Syn-Rcvd",
            ConnectionState::Established => "Established",
            ConnectionState::FinWait1 => "Fin-Wait-1",
            ConnectionState::FinWait2 => "Fin-Wait-2",
            ConnectionState::CloseWait => "Close-Wait",
            ConnectionState::Closing => "Closing",
            ConnectionState::LastAck => "Last-Ack",
            ConnectionState::TimeWait => "Time-Wait",
            ConnectionState::DeleteTcb => "Delete-Tcb",
            ConnectionState::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the connection table.
///
/// Equality is structural over all four fields. IPv6 endpoints carry their
/// scope id inside the `SocketAddr`, so it takes part in equality too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionRecord {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub pid: u32,
    pub state: ConnectionState,
}

/// Owner identity of a process as seen during one refresh cycle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessIdentity {
    pub name: String,
    pub path: String,
    pub service_name: Option<String>,
}

impl ProcessIdentity {
    /// Placeholder used when the owner could not be resolved (usually because it exited)
    pub fn unknown() -> Self {
        Self {
            name: "Unknown".to_string(),
            path: String::new(),
            service_name: None,
        }
    }
}

/// A connection joined with the identity of its owning process.
///
/// Built fresh every cycle; compare rows by value, never by address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedConnection {
    pub record: ConnectionRecord,
    pub identity: ProcessIdentity,
}

impl EnrichedConnection {
    pub fn new(record: ConnectionRecord, identity: ProcessIdentity) -> Self {
        Self { record, identity }
    }

    pub fn process_name(&self) -> &str {
        &self.identity.name
    }

    pub fn process_path(&self) -> &str {
        &self.identity.path
    }

    pub fn service_name(&self) -> Option<&str> {
        self.identity.service_name.as_deref()
    }

    /// "name" or "name (service)" when the process hosts a service
    pub fn display_name(&self) -> String {
        match self.service_name() {
            Some(service) if !service.is_empty() => {
                format!("{} ({})", self.identity.name, service)
            }
            _ => self.identity.name.clone(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.record.pid
    }

    pub fn local_address(&self) -> IpAddr {
        self.record.local.ip()
    }

    pub fn local_port(&self) -> u16 {
        self.record.local.port()
    }

    pub fn remote_address(&self) -> IpAddr {
        self.record.remote.ip()
    }

    pub fn remote_port(&self) -> u16 {
        self.record.remote.port()
    }

    pub fn state(&self) -> ConnectionState {
        self.record.state
    }
}

/// Render rows as the multi-line "copy details" text, one block per row
pub fn format_details(rows: &[EnrichedConnection]) -> String {
    rows.iter()
        .map(|row| {
            format!(
                "Process Name: {}\nProcess Path: {}\nLocal Endpoint: {}:{}\nRemote Endpoint: {}:{}\nState: {}",
                row.process_name(),
                row.process_path(),
                row.local_address(),
                row.local_port(),
                row.remote_address(),
                row.remote_port(),
                row.state(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
