// Process identity resolution (pid -> name, path, hosted service)
//
// Resolution never fails: a process that exited between the table read and
// the lookup resolves to `ProcessIdentity::unknown()`.

use crate::connection::ProcessIdentity;
use std::sync::Mutex;
use sysinfo::{Pid, System};

#[cfg(target_os = "windows")]
mod scm;
#[cfg(target_os = "linux")]
mod systemd;

/// Maps a process id to the identity shown next to its connections
pub trait IdentityResolver: Send + Sync {
    /// Refresh any cached process data. Called once at the start of each cycle.
    fn refresh(&self) {}

    /// Resolve a pid; unknown or vanished processes yield `ProcessIdentity::unknown()`
    fn resolve(&self, pid: u32) -> ProcessIdentity;
}

/// Looks up the service hosted by a process, if any
pub trait ServiceLookup: Send + Sync {
    /// Rebuild the lookup table; called alongside `IdentityResolver::refresh`
    fn refresh(&self) {}

    fn service_name(&self, pid: u32) -> Option<String>;
}

/// Service lookup for platforms without a service manager we understand
pub struct NoServiceLookup;

impl ServiceLookup for NoServiceLookup {
    fn service_name(&self, _pid: u32) -> Option<String> {
        None
    }
}

/// Platform service lookup
pub fn create_service_lookup() -> Box<dyn ServiceLookup> {
    #[cfg(target_os = "linux")]
    {
        Box::new(systemd::SystemdServiceLookup)
    }

    #[cfg(target_os = "windows")]
    {
        Box::new(scm::ScmServiceLookup::new())
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Box::new(NoServiceLookup)
    }
}

/// Identity resolver backed by a cached sysinfo `System`
///
/// The `System` is refreshed once per cycle instead of being rebuilt per
/// lookup; building one costs tens of milliseconds.
pub struct SysinfoResolver {
    cached_system: Mutex<System>,
    services: Box<dyn ServiceLookup>,
}

impl SysinfoResolver {
    pub fn new() -> Self {
        Self::with_service_lookup(create_service_lookup())
    }

    pub fn with_service_lookup(services: Box<dyn ServiceLookup>) -> Self {
        let cached_system = Mutex::new(System::new_all());
        log::debug!("Created cached System instance for SysinfoResolver");
        Self {
            cached_system,
            services,
        }
    }
}

impl Default for SysinfoResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityResolver for SysinfoResolver {
    fn refresh(&self) {
        let mut system = self
            .cached_system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_all();
        drop(system);

        self.services.refresh();
    }

    fn resolve(&self, pid: u32) -> ProcessIdentity {
        let system = self
            .cached_system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(process) = system.process(Pid::from_u32(pid)) else {
            log::debug!("No process found for pid {}", pid);
            return ProcessIdentity::unknown();
        };

        ProcessIdentity {
            name: process.name().to_string_lossy().into_owned(),
            path: process
                .exe()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            service_name: self.services.service_name(pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_current_process() {
        let resolver = SysinfoResolver::with_service_lookup(Box::new(NoServiceLookup));
        resolver.refresh();

        let identity = resolver.resolve(std::process::id());
        assert!(!identity.name.is_empty());
        assert_ne!(identity, ProcessIdentity::unknown());
        assert_eq!(identity.service_name, None);
    }

    #[test]
    fn test_vanished_process_is_unknown() {
        let resolver = SysinfoResolver::with_service_lookup(Box::new(NoServiceLookup));

        // Above the default pid_max on Linux and never a valid Windows pid
        let identity = resolver.resolve(u32::MAX - 1);
        assert_eq!(identity, ProcessIdentity::unknown());
    }
}
