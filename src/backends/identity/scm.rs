// Windows service lookup via the Service Control Manager
//
// EnumServicesStatusExW(SC_ENUM_PROCESS_INFO) lists every running Win32
// service with its host pid. Shared hosts (svchost.exe) run several services,
// which are joined in name order.

use super::ServiceLookup;
use std::collections::HashMap;
use std::sync::Mutex;
use windows::Win32::System::Services::{
    CloseServiceHandle, ENUM_SERVICE_STATUS_PROCESSW, EnumServicesStatusExW, OpenSCManagerW,
    SC_ENUM_PROCESS_INFO, SC_HANDLE, SC_MANAGER_ENUMERATE_SERVICE, SERVICE_ACTIVE, SERVICE_WIN32,
};
use windows::core::PCWSTR;

pub struct ScmServiceLookup {
    services_by_pid: Mutex<HashMap<u32, String>>,
}

impl ScmServiceLookup {
    pub fn new() -> Self {
        let lookup = Self {
            services_by_pid: Mutex::new(HashMap::new()),
        };
        lookup.refresh();
        lookup
    }
}

impl ServiceLookup for ScmServiceLookup {
    fn refresh(&self) {
        let services = match enumerate_services() {
            Ok(services) => services,
            Err(e) => {
                log::warn!("Failed to enumerate services: {}", e);
                return;
            }
        };

        let mut by_pid: HashMap<u32, Vec<String>> = HashMap::new();
        for (pid, name) in services {
            if pid != 0 {
                by_pid.entry(pid).or_default().push(name);
            }
        }

        let joined = by_pid
            .into_iter()
            .map(|(pid, mut names)| {
                names.sort();
                (pid, names.join(", "))
            })
            .collect();

        *self
            .services_by_pid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = joined;
    }

    fn service_name(&self, pid: u32) -> Option<String> {
        self.services_by_pid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&pid)
            .cloned()
    }
}

/// Closes the SCM handle when dropped
struct ScmHandle(SC_HANDLE);

impl Drop for ScmHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseServiceHandle(self.0);
        }
    }
}

/// (pid, service name) for every active Win32 service
fn enumerate_services() -> anyhow::Result<Vec<(u32, String)>> {
    unsafe {
        let manager = ScmHandle(OpenSCManagerW(
            PCWSTR::null(),
            PCWSTR::null(),
            SC_MANAGER_ENUMERATE_SERVICE,
        )?);

        // Size query, then fill; services can start in between so allow one retry
        let mut needed: u32 = 0;
        let mut returned: u32 = 0;
        let _ = EnumServicesStatusExW(
            manager.0,
            SC_ENUM_PROCESS_INFO,
            SERVICE_WIN32,
            SERVICE_ACTIVE,
            None,
            &mut needed,
            &mut returned,
            None,
            PCWSTR::null(),
        );

        for _ in 0..2 {
            // u64 backing keeps the entry structs (which hold pointers) aligned
            let mut backing = vec![0u64; (needed as usize).div_ceil(8)];
            let buffer = std::slice::from_raw_parts_mut(
                backing.as_mut_ptr() as *mut u8,
                backing.len() * 8,
            );

            let mut resume: u32 = 0;
            let result = EnumServicesStatusExW(
                manager.0,
                SC_ENUM_PROCESS_INFO,
                SERVICE_WIN32,
                SERVICE_ACTIVE,
                Some(buffer),
                &mut needed,
                &mut returned,
                Some(&mut resume as *mut u32),
                PCWSTR::null(),
            );
            if result.is_err() {
                continue;
            }

            let entries = std::slice::from_raw_parts(
                backing.as_ptr() as *const ENUM_SERVICE_STATUS_PROCESSW,
                returned as usize,
            );
            return Ok(entries
                .iter()
                .filter_map(|entry| {
                    let name = entry.lpServiceName.to_string().ok()?;
                    Some((entry.ServiceStatusProcess.dwProcessId, name))
                })
                .collect());
        }

        anyhow::bail!("service list kept growing while it was being read")
    }
}
