// Live connection monitor
//
// Each cycle captures a snapshot, joins every row with its owner's identity
// and swaps the whole list into a watch channel in one step. Readers always
// see either the previous list or the new one, never a mix.

use crate::backends::actions::{
    FirewallTask, FirewallTaskQueue, ProcessTerminator, RuleSpecification,
};
use crate::backends::identity::IdentityResolver;
use crate::config::DEFAULT_PROTECTED_PROCESS;
use crate::connection::{EnrichedConnection, ProcessIdentity};
use crate::snapshot::ConnectionSnapshotService;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A published connection list. Replaced wholesale, never edited in place.
pub type ConnectionList = Arc<Vec<EnrichedConnection>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("Refusing to kill protected process \"{name}\" (pid {pid})")]
    ProtectedProcess { name: String, pid: u32 },
    #[error("Refusing to kill: no owning process is known for this connection (pid 0)")]
    UnattributedProcess,
    #[error("Refusing to kill connwatch's own process (pid {pid})")]
    OwnProcess { pid: u32 },
    #[error("Failed to kill process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
}

/// What a refresh cycle did with its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A new list replaced the previous one
    Published { rows: usize },
    /// A family failed to decode; the previous list stays visible
    Retained,
    /// The monitor was stopped before the result could be published
    Discarded,
}

/// Periodic connection monitor with per-row actions
pub struct LiveMonitor {
    snapshots: ConnectionSnapshotService,
    resolver: Box<dyn IdentityResolver>,
    terminator: Box<dyn ProcessTerminator>,
    tasks: Box<dyn FirewallTaskQueue>,
    protected_process_name: String,
    published: watch::Sender<ConnectionList>,
    running: AtomicBool,
    // Bumped by every start so cycles begun before a stop can't publish after a restart
    epoch: AtomicU64,
}

impl LiveMonitor {
    pub fn new(
        snapshots: ConnectionSnapshotService,
        resolver: Box<dyn IdentityResolver>,
        terminator: Box<dyn ProcessTerminator>,
        tasks: Box<dyn FirewallTaskQueue>,
    ) -> Self {
        let (published, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            snapshots,
            resolver,
            terminator,
            tasks,
            protected_process_name: DEFAULT_PROTECTED_PROCESS.to_string(),
            published,
            running: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn with_protected_process_name(mut self, name: impl Into<String>) -> Self {
        self.protected_process_name = name.into();
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.snapshots.backend_name()
    }

    /// Receiver notified on every publish and on stop
    pub fn subscribe(&self) -> watch::Receiver<ConnectionList> {
        self.published.subscribe()
    }

    /// The currently published list
    pub fn current(&self) -> ConnectionList {
        Arc::clone(&self.published.borrow())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Allow cycles to publish
    pub fn start(&self) {
        self.published.send_if_modified(|_| {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            false
        });
        log::info!("Live monitor started ({} backend)", self.backend_name());
    }

    /// Halt publishing and clear the list. A cycle already running finishes
    /// its work but its result is dropped.
    pub fn stop(&self) {
        self.published.send_if_modified(|current| {
            self.running.store(false, Ordering::SeqCst);
            *current = Arc::new(Vec::new());
            true
        });
        log::info!("Live monitor stopped");
    }

    /// Run one capture, enrich and publish cycle. Blocking.
    pub fn refresh(&self) -> CycleOutcome {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if !self.is_running() {
            return CycleOutcome::Discarded;
        }

        let snapshot = self.snapshots.capture();
        if snapshot.has_malformed_family() {
            log::warn!("Connection table did not decode; keeping the previous list");
            return CycleOutcome::Retained;
        }

        self.resolver.refresh();
        let mut identities: HashMap<u32, ProcessIdentity> = HashMap::new();
        let rows: Vec<EnrichedConnection> = snapshot
            .records
            .into_iter()
            .map(|record| {
                let identity = identities
                    .entry(record.pid)
                    .or_insert_with(|| self.resolver.resolve(record.pid))
                    .clone();
                EnrichedConnection::new(record, identity)
            })
            .collect();
        let count = rows.len();

        // Liveness is checked under the channel lock, the same lock `stop` takes
        let published = self.published.send_if_modified(|current| {
            if !self.running.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != epoch
            {
                return false;
            }
            *current = Arc::new(rows);
            true
        });

        if published {
            log::debug!("Published {} connections", count);
            CycleOutcome::Published { rows: count }
        } else {
            log::debug!("Monitor stopped during refresh; discarding {} rows", count);
            CycleOutcome::Discarded
        }
    }

    /// Whether the kill action may run on this row
    pub fn kill_eligibility(&self, row: &EnrichedConnection) -> Result<(), ActionError> {
        // pid 0 signals the caller's whole process group on Unix
        if row.pid() == 0 {
            return Err(ActionError::UnattributedProcess);
        }
        if row.pid() == std::process::id() {
            return Err(ActionError::OwnProcess { pid: row.pid() });
        }
        if row
            .process_name()
            .eq_ignore_ascii_case(&self.protected_process_name)
        {
            return Err(ActionError::ProtectedProcess {
                name: row.process_name().to_string(),
                pid: row.pid(),
            });
        }
        Ok(())
    }

    pub fn can_kill(&self, row: &EnrichedConnection) -> bool {
        self.kill_eligibility(row).is_ok()
    }

    /// Terminate the process that owns the row
    pub fn kill_process(&self, row: &EnrichedConnection) -> Result<(), ActionError> {
        self.kill_eligibility(row)?;

        self.terminator
            .terminate(row.pid())
            .map_err(|e| ActionError::TerminationFailed {
                pid: row.pid(),
                reason: format!("{:#}", e),
            })?;

        log::info!("Killed {} (pid {})", row.display_name(), row.pid());
        Ok(())
    }

    /// Queue an outbound block rule for the row's remote address
    pub fn create_block_rule(&self, row: &EnrichedConnection) -> RuleSpecification {
        let rule = RuleSpecification::block_remote(row.remote_address());
        log::info!("Queueing rule \"{}\"", rule.name);
        self.tasks.enqueue(FirewallTask::create_rule(rule.clone()));
        rule
    }
}

/// Drive `monitor` every `period` until it is stopped.
///
/// Cycles run on the blocking pool; a slow cycle delays the next tick rather
/// than stacking up behind it.
pub fn spawn_polling(monitor: Arc<LiveMonitor>, period: Duration) -> JoinHandle<()> {
    monitor.start();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::debug!("Polling loop started ({:?} interval)", period);

        loop {
            ticker.tick().await;
            if !monitor.is_running() {
                break;
            }

            let cycle = Arc::clone(&monitor);
            match tokio::task::spawn_blocking(move || cycle.refresh()).await {
                Ok(outcome) => log::trace!("Refresh cycle: {:?}", outcome),
                Err(e) => log::error!("Refresh cycle panicked: {}", e),
            }
        }

        log::debug!("Polling loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::connection_table::{CaptureError, ConnectionTableBackend};
    use crate::backends::decode::DecodeError;
    use crate::backends::table::{AddressFamily, TableError};
    use crate::backends::{BackendCapabilities, BackendPriority};
    use crate::connection::{ConnectionRecord, ConnectionState};
    use std::sync::Mutex;
    use std::sync::mpsc;

    #[derive(Clone)]
    enum Scripted {
        Rows(Vec<ConnectionRecord>),
        Unavailable,
        Malformed,
    }

    struct ScriptedBackend {
        ipv4: Mutex<Scripted>,
        ipv6: Mutex<Scripted>,
    }

    impl ScriptedBackend {
        fn new(ipv4: Scripted, ipv6: Scripted) -> Arc<Self> {
            Arc::new(Self {
                ipv4: Mutex::new(ipv4),
                ipv6: Mutex::new(ipv6),
            })
        }

        fn set(&self, family: AddressFamily, script: Scripted) {
            match family {
                AddressFamily::Ipv4 => *self.ipv4.lock().unwrap() = script,
                AddressFamily::Ipv6 => *self.ipv6.lock().unwrap() = script,
            }
        }
    }

    impl ConnectionTableBackend for Arc<ScriptedBackend> {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn priority(&self) -> BackendPriority {
            BackendPriority::Fallback
        }

        fn is_available() -> bool {
            true
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities {
                ipv4_support: true,
                ipv6_support: true,
                owning_pid: true,
                scope_ids: true,
            }
        }

        fn capture_family(
            &self,
            family: AddressFamily,
        ) -> Result<Vec<ConnectionRecord>, CaptureError> {
            let script = match family {
                AddressFamily::Ipv4 => self.ipv4.lock().unwrap().clone(),
                AddressFamily::Ipv6 => self.ipv6.lock().unwrap().clone(),
            };
            match script {
                Scripted::Rows(rows) => Ok(rows),
                Scripted::Unavailable => Err(TableError::Unavailable {
                    family,
                    required: 0,
                }
                .into()),
                Scripted::Malformed => {
                    Err(DecodeError::TruncatedHeader { family, len: 0 }.into())
                }
            }
        }
    }

    struct MapResolver {
        identities: HashMap<u32, ProcessIdentity>,
        calls: Arc<Mutex<Vec<u32>>>,
    }

    impl IdentityResolver for MapResolver {
        fn resolve(&self, pid: u32) -> ProcessIdentity {
            self.calls.lock().unwrap().push(pid);
            self.identities
                .get(&pid)
                .cloned()
                .unwrap_or_else(ProcessIdentity::unknown)
        }
    }

    /// Blocks inside `refresh` until the test lets it continue
    struct GateResolver {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl IdentityResolver for GateResolver {
        fn refresh(&self) {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }

        fn resolve(&self, _pid: u32) -> ProcessIdentity {
            ProcessIdentity::unknown()
        }
    }

    #[derive(Default)]
    struct RecordingTerminator {
        killed: Arc<Mutex<Vec<u32>>>,
        fail_with: Option<String>,
    }

    impl ProcessTerminator for RecordingTerminator {
        fn terminate(&self, pid: u32) -> anyhow::Result<()> {
            self.killed.lock().unwrap().push(pid);
            match &self.fail_with {
                Some(reason) => Err(anyhow::anyhow!("{}", reason)),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingQueue {
        tasks: Arc<Mutex<Vec<FirewallTask>>>,
    }

    impl FirewallTaskQueue for RecordingQueue {
        fn enqueue(&self, task: FirewallTask) {
            self.tasks.lock().unwrap().push(task);
        }
    }

    fn record(local: &str, remote: &str, pid: u32, state: u32) -> ConnectionRecord {
        ConnectionRecord {
            local: local.parse().unwrap(),
            remote: remote.parse().unwrap(),
            pid,
            state: ConnectionState::from_code(state),
        }
    }

    fn ipv4_rows() -> Vec<ConnectionRecord> {
        vec![
            record("0.0.0.0:445", "0.0.0.0:0", 4, 2),
            record("10.0.0.5:49822", "203.0.113.40:443", 1200, 5),
            record("10.0.0.5:49823", "203.0.113.41:443", 1200, 5),
            record("10.0.0.5:49900", "198.51.100.7:80", 3000, 8),
        ]
    }

    fn ipv6_rows() -> Vec<ConnectionRecord> {
        vec![record("[fe80::1%7]:5355", "[::]:0", 1200, 2)]
    }

    fn identities() -> HashMap<u32, ProcessIdentity> {
        HashMap::from([
            (
                4,
                ProcessIdentity {
                    name: "System".to_string(),
                    path: String::new(),
                    service_name: None,
                },
            ),
            (
                1200,
                ProcessIdentity {
                    name: "svchost.exe".to_string(),
                    path: "C:\\Windows\\System32\\svchost.exe".to_string(),
                    service_name: Some("Dnscache".to_string()),
                },
            ),
        ])
    }

    struct Harness {
        monitor: Arc<LiveMonitor>,
        backend: Arc<ScriptedBackend>,
        resolve_calls: Arc<Mutex<Vec<u32>>>,
        killed: Arc<Mutex<Vec<u32>>>,
        tasks: Arc<Mutex<Vec<FirewallTask>>>,
    }

    fn harness_with(terminator: RecordingTerminator) -> Harness {
        let backend = ScriptedBackend::new(Scripted::Rows(ipv4_rows()), Scripted::Rows(ipv6_rows()));
        let resolve_calls = Arc::new(Mutex::new(Vec::new()));
        let killed = Arc::clone(&terminator.killed);
        let queue = RecordingQueue::default();
        let tasks = Arc::clone(&queue.tasks);

        let monitor = LiveMonitor::new(
            ConnectionSnapshotService::new(Box::new(Arc::clone(&backend))),
            Box::new(MapResolver {
                identities: identities(),
                calls: Arc::clone(&resolve_calls),
            }),
            Box::new(terminator),
            Box::new(queue),
        );

        Harness {
            monitor: Arc::new(monitor),
            backend,
            resolve_calls,
            killed,
            tasks,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingTerminator::default())
    }

    fn row_for_pid(list: &ConnectionList, pid: u32) -> EnrichedConnection {
        list.iter().find(|row| row.pid() == pid).unwrap().clone()
    }

    #[test]
    fn test_refresh_publishes_enriched_rows() {
        let h = harness();
        h.monitor.start();

        assert_eq!(h.monitor.refresh(), CycleOutcome::Published { rows: 5 });

        let list = h.monitor.current();
        assert_eq!(list.len(), 5);
        assert_eq!(list[1].display_name(), "svchost.exe (Dnscache)");
        assert_eq!(list[0].display_name(), "System");
        assert!(list[4].local_address().is_ipv6());
    }

    #[test]
    fn test_each_pid_resolved_once_per_cycle() {
        let h = harness();
        h.monitor.start();
        h.monitor.refresh();

        let mut calls = h.resolve_calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec![4, 1200, 3000]);
    }

    #[test]
    fn test_unresolved_owner_still_listed() {
        let h = harness();
        h.monitor.start();
        h.monitor.refresh();

        let row = row_for_pid(&h.monitor.current(), 3000);
        assert_eq!(row.identity, ProcessIdentity::unknown());
        assert_eq!(row.state(), ConnectionState::CloseWait);
    }

    #[test]
    fn test_unavailable_family_publishes_the_other() {
        let h = harness();
        h.backend.set(AddressFamily::Ipv6, Scripted::Unavailable);
        h.monitor.start();

        assert_eq!(h.monitor.refresh(), CycleOutcome::Published { rows: 4 });
        assert!(h.monitor.current().iter().all(|row| row.local_address().is_ipv4()));
    }

    #[test]
    fn test_malformed_family_keeps_previous_list() {
        let h = harness();
        h.monitor.start();
        h.monitor.refresh();
        let before = h.monitor.current();

        h.backend.set(AddressFamily::Ipv4, Scripted::Malformed);
        assert_eq!(h.monitor.refresh(), CycleOutcome::Retained);
        assert!(Arc::ptr_eq(&before, &h.monitor.current()));

        // Recovers on the next good cycle
        h.backend.set(AddressFamily::Ipv4, Scripted::Rows(ipv4_rows()));
        assert_eq!(h.monitor.refresh(), CycleOutcome::Published { rows: 5 });
    }

    #[test]
    fn test_identical_state_gives_value_equal_lists() {
        let h = harness();
        h.monitor.start();

        h.monitor.refresh();
        let first = h.monitor.current();
        h.monitor.refresh();
        let second = h.monitor.current();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
    }

    #[test]
    fn test_refresh_before_start_is_discarded() {
        let h = harness();
        assert_eq!(h.monitor.refresh(), CycleOutcome::Discarded);
        assert!(h.monitor.current().is_empty());
    }

    #[test]
    fn test_stop_clears_and_blocks_publishing() {
        let h = harness();
        h.monitor.start();
        h.monitor.refresh();
        assert!(!h.monitor.current().is_empty());

        h.monitor.stop();
        assert!(h.monitor.current().is_empty());
        assert!(!h.monitor.is_running());
        assert_eq!(h.monitor.refresh(), CycleOutcome::Discarded);
        assert!(h.monitor.current().is_empty());
    }

    #[test]
    fn test_stop_during_cycle_discards_result() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let backend = ScriptedBackend::new(Scripted::Rows(ipv4_rows()), Scripted::Rows(vec![]));
        let monitor = Arc::new(LiveMonitor::new(
            ConnectionSnapshotService::new(Box::new(backend)),
            Box::new(GateResolver {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }),
            Box::new(RecordingTerminator::default()),
            Box::new(RecordingQueue::default()),
        ));
        monitor.start();

        let cycle = Arc::clone(&monitor);
        let worker = std::thread::spawn(move || cycle.refresh());

        entered_rx.recv().unwrap();
        monitor.stop();
        release_tx.send(()).unwrap();

        assert_eq!(worker.join().unwrap(), CycleOutcome::Discarded);
        assert!(monitor.current().is_empty());
    }

    #[test]
    fn test_cycle_from_before_restart_is_discarded() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let backend = ScriptedBackend::new(Scripted::Rows(ipv4_rows()), Scripted::Rows(vec![]));
        let monitor = Arc::new(LiveMonitor::new(
            ConnectionSnapshotService::new(Box::new(backend)),
            Box::new(GateResolver {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }),
            Box::new(RecordingTerminator::default()),
            Box::new(RecordingQueue::default()),
        ));
        monitor.start();

        let cycle = Arc::clone(&monitor);
        let worker = std::thread::spawn(move || cycle.refresh());

        entered_rx.recv().unwrap();
        monitor.stop();
        monitor.start();
        release_tx.send(()).unwrap();

        assert_eq!(worker.join().unwrap(), CycleOutcome::Discarded);
        assert!(monitor.current().is_empty());
    }

    #[test]
    fn test_kill_protected_process_is_rejected() {
        let h = harness();
        h.monitor.start();
        h.monitor.refresh();
        let system = row_for_pid(&h.monitor.current(), 4);

        assert!(!h.monitor.can_kill(&system));
        assert_eq!(
            h.monitor.kill_process(&system),
            Err(ActionError::ProtectedProcess {
                name: "System".to_string(),
                pid: 4
            })
        );
        assert!(h.killed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_protected_name_ignores_case() {
        let h = harness();
        let mut row = EnrichedConnection::new(ipv4_rows()[0], ProcessIdentity::unknown());
        row.identity.name = "SYSTEM".to_string();

        assert!(h.monitor.kill_process(&row).is_err());
        assert!(h.killed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_kill_unattributed_row_is_rejected() {
        let h = harness();
        let row = EnrichedConnection::new(
            record("10.0.0.5:49950", "198.51.100.9:443", 0, 5),
            ProcessIdentity::unknown(),
        );

        assert!(!h.monitor.can_kill(&row));
        assert_eq!(
            h.monitor.kill_process(&row),
            Err(ActionError::UnattributedProcess)
        );
        assert!(h.killed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_kill_own_process_is_rejected() {
        let h = harness();
        let own_pid = std::process::id();
        let row = EnrichedConnection::new(
            record("127.0.0.1:50000", "127.0.0.1:443", own_pid, 5),
            ProcessIdentity {
                name: "connwatch".to_string(),
                path: String::new(),
                service_name: None,
            },
        );

        assert_eq!(
            h.monitor.kill_process(&row),
            Err(ActionError::OwnProcess { pid: own_pid })
        );
        assert!(h.killed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_kill_delegates_to_terminator() {
        let h = harness();
        h.monitor.start();
        h.monitor.refresh();
        let row = row_for_pid(&h.monitor.current(), 1200);

        assert!(h.monitor.can_kill(&row));
        assert_eq!(h.monitor.kill_process(&row), Ok(()));
        assert_eq!(*h.killed.lock().unwrap(), vec![1200]);
    }

    #[test]
    fn test_kill_failure_is_surfaced() {
        let h = harness_with(RecordingTerminator {
            fail_with: Some("Access is denied.".to_string()),
            ..RecordingTerminator::default()
        });
        h.monitor.start();
        h.monitor.refresh();
        let row = row_for_pid(&h.monitor.current(), 3000);
        let before = h.monitor.current();

        let err = h.monitor.kill_process(&row).unwrap_err();
        assert_eq!(
            err,
            ActionError::TerminationFailed {
                pid: 3000,
                reason: "Access is denied.".to_string()
            }
        );
        assert_eq!(err.to_string(), "Failed to kill process 3000: Access is denied.");
        assert!(Arc::ptr_eq(&before, &h.monitor.current()));
    }

    #[test]
    fn test_block_rule_is_queued_not_applied() {
        let h = harness();
        h.monitor.start();
        h.monitor.refresh();
        let row = row_for_pid(&h.monitor.current(), 3000);

        let rule = h.monitor.create_block_rule(&row);
        assert_eq!(rule.remote_addresses, "198.51.100.7");

        let tasks = h.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0], FirewallTask::create_rule(rule));
    }

    #[tokio::test]
    async fn test_polling_loop_publishes_until_stopped() {
        let h = harness();
        let mut updates = h.monitor.subscribe();

        let handle = spawn_polling(Arc::clone(&h.monitor), Duration::from_millis(10));
        updates.changed().await.unwrap();
        assert_eq!(updates.borrow_and_update().len(), 5);

        h.monitor.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("polling loop should exit after stop")
            .unwrap();
        assert!(h.monitor.current().is_empty());
    }
}
