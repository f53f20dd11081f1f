// systemd service lookup via the process cgroup hierarchy

use super::ServiceLookup;
use procfs::process::Process;

/// Derives the hosting systemd unit from a process's cgroup path
pub struct SystemdServiceLookup;

impl ServiceLookup for SystemdServiceLookup {
    fn service_name(&self, pid: u32) -> Option<String> {
        let pid = i32::try_from(pid).ok()?;
        let cgroups = Process::new(pid).and_then(|p| p.cgroups()).ok()?;
        service_from_cgroup_paths(cgroups.into_iter().map(|cgroup| cgroup.pathname))
    }
}

/// Innermost `*.service` unit across a process's cgroup paths, without the suffix.
///
/// `/system.slice/ssh.service` yields `ssh`. User manager units
/// (`user@1000.service`) only count when nothing more specific is nested in them.
fn service_from_cgroup_paths<I, S>(paths: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    paths
        .into_iter()
        .filter_map(|path| {
            path.as_ref()
                .rsplit('/')
                .find_map(|segment| segment.strip_suffix(".service"))
                .filter(|unit| !unit.is_empty())
                .map(str::to_string)
        })
        .max_by_key(|unit| !unit.starts_with("user@"))
}
