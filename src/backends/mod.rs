// Backend trait definitions and core types

pub mod actions;
pub mod connection_table;
pub mod decode;
pub mod identity;
pub mod table;

use self::table::AddressFamily;
use std::fmt;

/// Platform identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOS,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Other
        }
    }
}

/// Backend priority ranking (higher = better)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendPriority {
    Fallback = 1, // Works but limited
    Good = 2,     // Solid implementation
    Better = 3,   // Modern, efficient
    Best = 4,     // Native table APIs
}

/// Capabilities that a connection table backend supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    pub ipv4_support: bool,
    pub ipv6_support: bool,
    /// Rows carry the owning process id
    pub owning_pid: bool,
    /// IPv6 rows carry interface scope ids
    pub scope_ids: bool,
}

impl BackendCapabilities {
    pub fn supports(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::Ipv4 => self.ipv4_support,
            AddressFamily::Ipv6 => self.ipv6_support,
        }
    }
}

impl fmt::Display for BackendCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut features = Vec::new();
        if self.ipv4_support {
            features.push("ipv4");
        }
        if self.ipv6_support {
            features.push("ipv6");
        }
        if self.owning_pid {
            features.push("owning-pid");
        }
        if self.scope_ids {
            features.push("scope-ids");
        }
        f.write_str(&features.join(", "))
    }
}
