// Outward-facing collaborators for per-row actions
//
// The monitor never touches processes or firewall policy itself. Killing goes
// through a `ProcessTerminator`, blocking through a `FirewallTaskQueue` that
// some other component drains and applies.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Rule group that rules created from the connection list are filed under
pub const RULE_GROUPING: &str = "ConnWatch";

/// Terminates processes on request
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// Platform process termination (SIGKILL on Unix, TerminateProcess on Windows)
pub struct SystemTerminator;

/// Only positive pids that fit `pid_t` name a single process
fn single_process_pid(pid: u32) -> Result<i32> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => anyhow::bail!("Refusing to signal pid {}: not a single process", pid),
    }
}

impl ProcessTerminator for SystemTerminator {
    #[cfg(target_os = "linux")]
    fn terminate(&self, pid: u32) -> Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let raw = single_process_pid(pid)?;
        kill(Pid::from_raw(raw), Signal::SIGKILL)?;
        log::info!("Sent SIGKILL to pid {}", pid);
        Ok(())
    }

    #[cfg(target_os = "windows")]
    fn terminate(&self, pid: u32) -> Result<()> {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess};

        single_process_pid(pid)?;
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, false, pid)?;
            let result = TerminateProcess(handle, 1);
            let _ = CloseHandle(handle);
            result?;
        }
        log::info!("Terminated pid {}", pid);
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    fn terminate(&self, pid: u32) -> Result<()> {
        single_process_pid(pid)?;
        anyhow::bail!("Process termination is not supported on this platform (pid {})", pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleDirection {
    Inbound,
    Outbound,
}

/// Firewall rule descriptor handed to the task queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpecification {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub grouping: String,
    pub action: RuleAction,
    pub direction: RuleDirection,
    /// IANA protocol number (6 = TCP)
    pub protocol: u8,
    pub local_ports: String,
    pub remote_ports: String,
    pub local_addresses: String,
    pub remote_addresses: String,
    pub profiles: String,
    pub interface_types: String,
    pub icmp_types_and_codes: String,
}

impl RuleSpecification {
    /// Outbound TCP block for one remote address, everything else wildcard
    pub fn block_remote(address: IpAddr) -> Self {
        Self {
            name: format!("Block {}", address),
            description: "Blocked from Live Connections".to_string(),
            enabled: true,
            grouping: RULE_GROUPING.to_string(),
            action: RuleAction::Block,
            direction: RuleDirection::Outbound,
            protocol: 6,
            local_ports: "*".to_string(),
            remote_ports: "*".to_string(),
            local_addresses: "*".to_string(),
            remote_addresses: address.to_string(),
            profiles: "All".to_string(),
            interface_types: "All".to_string(),
            icmp_types_and_codes: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirewallTaskType {
    CreateRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallTask {
    pub task_type: FirewallTaskType,
    pub rule_specification: RuleSpecification,
}

impl FirewallTask {
    pub fn create_rule(rule_specification: RuleSpecification) -> Self {
        Self {
            task_type: FirewallTaskType::CreateRule,
            rule_specification,
        }
    }
}

/// Fire-and-forget queue of firewall work
pub trait FirewallTaskQueue: Send + Sync {
    fn enqueue(&self, task: FirewallTask);
}

/// Task queue backed by an unbounded tokio channel
pub struct ChannelTaskQueue {
    sender: UnboundedSender<FirewallTask>,
}

impl ChannelTaskQueue {
    /// Create the queue and the receiver its consumer drains
    pub fn new() -> (Self, UnboundedReceiver<FirewallTask>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl FirewallTaskQueue for ChannelTaskQueue {
    fn enqueue(&self, task: FirewallTask) {
        log::debug!("Queueing firewall task: {}", task.rule_specification.name);
        if self.sender.send(task).is_err() {
            log::warn!("Firewall task consumer has shut down; task dropped");
        }
    }
}
