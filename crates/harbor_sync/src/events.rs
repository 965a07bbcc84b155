//! Events published by the sync engine.

use crate::error::{ClientError, ClientResult, TransportError};
use harbor_core::{MutationKind, MutationOperation, RecordId};

/// Why a drain cycle stopped before emptying the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainStop {
    /// Another drain was already running; this request was coalesced.
    AlreadyRunning,
    /// Connectivity belief is offline.
    Offline,
    /// The head operation's record has an immediate call in flight.
    InFlight(RecordId),
    /// The head operation failed.
    Failed(TransportError),
    /// The head operation was refused by the remote service and waits for
    /// a manual retry.
    Blocked(RecordId),
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Operations confirmed and removed.
    pub delivered: usize,
    /// Operations still queued when the cycle ended.
    pub remaining: usize,
    /// Operations that ran out of attempts and left the queue this cycle.
    pub exhausted: Vec<MutationOperation>,
    /// Why the cycle stopped early, if it did.
    pub stopped: Option<DrainStop>,
}

impl DrainReport {
    /// Returns true if the queue was emptied.
    pub fn is_complete(&self) -> bool {
        self.stopped.is_none() && self.remaining == 0
    }

    /// Returns true if the cycle ended on a transport failure.
    pub fn failed(&self) -> bool {
        matches!(self.stopped, Some(DrainStop::Failed(_)))
    }

    /// Turns an exhausted operation into an error.
    pub fn check(self) -> ClientResult<Self> {
        match self.exhausted.first() {
            Some(op) => Err(ClientError::QueueExhausted {
                id: op.id.clone(),
                attempts: op.attempts,
            }),
            None => Ok(self),
        }
    }
}

/// Notifications for UI-level indicators.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// An operation was written to the queue.
    Queued {
        /// Target record.
        id: RecordId,
        /// Operation kind.
        kind: MutationKind,
    },
    /// The remote service confirmed an operation.
    Confirmed {
        /// Target record.
        id: RecordId,
        /// Operation kind.
        kind: MutationKind,
    },
    /// A remote call failed; the operation stays (or was put) in the queue.
    TransportFailed {
        /// Target record.
        id: RecordId,
        /// Operation kind.
        kind: MutationKind,
        /// The failure.
        error: TransportError,
        /// Failed attempts so far.
        attempts: u32,
    },
    /// The remote service refused an operation with a non-retryable
    /// answer. It stays queued, and holds back the queue, until the record
    /// is retried.
    Blocked {
        /// Target record.
        id: RecordId,
        /// Operation kind.
        kind: MutationKind,
        /// The refusal.
        error: TransportError,
    },
    /// The remote service confirmed an operation but the canonical copy
    /// could not be written locally. The local copy is kept and the record
    /// stays flagged offline.
    ReconcileFailed {
        /// Target record.
        id: RecordId,
        /// Operation kind.
        kind: MutationKind,
        /// Message of the storage failure.
        error: String,
    },
    /// An operation ran out of attempts and was removed from the queue.
    /// The record stays flagged offline until retried.
    QueueExhausted {
        /// Target record.
        id: RecordId,
        /// Operation kind.
        kind: MutationKind,
        /// Attempts made.
        attempts: u32,
        /// Message of the last failure.
        last_error: Option<String>,
    },
    /// A drain cycle began.
    DrainStarted {
        /// Queue length at start.
        pending: usize,
    },
    /// A drain cycle ended.
    DrainFinished(DrainReport),
    /// The connectivity belief changed.
    ConnectivityChanged {
        /// New belief.
        online: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_completion() {
        assert!(DrainReport::default().is_complete());

        let report = DrainReport {
            remaining: 1,
            stopped: Some(DrainStop::Failed(TransportError::Timeout)),
            ..DrainReport::default()
        };
        assert!(!report.is_complete());
        assert!(report.failed());
        assert!(report.check().is_ok());

        let blocked = DrainReport {
            remaining: 1,
            stopped: Some(DrainStop::Blocked(RecordId::new("A").unwrap())),
            ..DrainReport::default()
        };
        assert!(!blocked.is_complete());
        assert!(!blocked.failed());
    }

    #[test]
    fn exhausted_operation_is_an_error() {
        let mut op = MutationOperation::delete(RecordId::new("A").unwrap(), 0);
        op.attempts = 10;
        let report = DrainReport {
            exhausted: vec![op],
            ..DrainReport::default()
        };
        assert!(matches!(
            report.check(),
            Err(ClientError::QueueExhausted { attempts: 10, .. })
        ));
    }
}
