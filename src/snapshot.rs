// One consistent read of every supported address family

use crate::backends::connection_table::{CaptureError, ConnectionTableBackend};
use crate::backends::table::AddressFamily;
use crate::connection::ConnectionRecord;

/// Why a family is missing from a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The OS query failed or kept outgrowing its buffer
    Unavailable,
    /// The query succeeded but the buffer did not decode
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyFailure {
    pub family: AddressFamily,
    pub kind: FailureKind,
    pub reason: String,
}

/// Decoded rows of every family that could be read this cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub records: Vec<ConnectionRecord>,
    pub failures: Vec<FamilyFailure>,
}

impl Snapshot {
    pub fn has_malformed_family(&self) -> bool {
        self.failures
            .iter()
            .any(|failure| failure.kind == FailureKind::Malformed)
    }
}

/// Captures IPv4 then IPv6 through one backend and concatenates the rows
pub struct ConnectionSnapshotService {
    backend: Box<dyn ConnectionTableBackend>,
}

impl ConnectionSnapshotService {
    pub fn new(backend: Box<dyn ConnectionTableBackend>) -> Self {
        log::debug!("Using connection table backend: {}", backend.name());
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Capture every family in turn. A failed family is left out and noted;
    /// it never stops the other family from being read.
    pub fn capture(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        let capabilities = self.backend.capabilities();
        self.backend.prepare_snapshot();

        for family in AddressFamily::ALL {
            if !capabilities.supports(family) {
                log::trace!("{} backend has no {} table", self.backend.name(), family);
                continue;
            }
            match self.backend.capture_family(family) {
                Ok(records) => snapshot.records.extend(records),
                Err(e) => {
                    let kind = match e {
                        CaptureError::Table(_) => FailureKind::Unavailable,
                        CaptureError::Decode(_) => FailureKind::Malformed,
                    };
                    log::warn!("Skipping {} connections this cycle: {}", family, e);
                    snapshot.failures.push(FamilyFailure {
                        family,
                        kind,
                        reason: e.to_string(),
                    });
                }
            }
        }

        snapshot
    }
}
