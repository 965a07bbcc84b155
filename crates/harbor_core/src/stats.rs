//! Aggregate statistics over the record store.

use crate::record::{Record, RecordStatus};
use serde::{Deserialize, Serialize};

/// Cache key under which computed statistics are kept.
pub const STATS_CACHE_KEY: &str = "stats:orders";

/// Counts and totals over the local records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStats {
    /// Live records, deleted-local ones excluded.
    pub total: usize,
    /// Records with status pending-local.
    pub pending_local: usize,
    /// Records with status synced.
    pub synced: usize,
    /// Records with status deleted-local.
    pub deleted_local: usize,
    /// Records carrying the offline flag.
    pub unsynced: usize,
    /// Sum of the numeric amount field over live records.
    pub amount_total: f64,
    /// Milliseconds since the Unix epoch when computed.
    pub computed_at: u64,
}

impl OrderStats {
    /// Computes statistics, summing `amount_field` where it is numeric.
    pub fn compute<'a>(
        records: impl IntoIterator<Item = &'a Record>,
        amount_field: &str,
        now: u64,
    ) -> Self {
        let mut stats = Self {
            computed_at: now,
            ..Self::default()
        };
        for record in records {
            if record.offline {
                stats.unsynced += 1;
            }
            match record.status {
                RecordStatus::DeletedLocal => {
                    stats.deleted_local += 1;
                    continue;
                }
                RecordStatus::PendingLocal => stats.pending_local += 1,
                RecordStatus::Synced => stats.synced += 1,
            }
            stats.total += 1;
            if let Some(amount) = record.field(amount_field).and_then(|v| v.as_f64()) {
                stats.amount_total += amount;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_by_status() {
        let pending = Record::new_local(&json!({"id": "a", "price": 10}), 0).unwrap();
        let synced = Record::from_server(json!({"id": "b", "price": 2.5}).as_object().unwrap(), 0).unwrap();
        let mut deleted = Record::new_local(&json!({"id": "c", "price": 100}), 0).unwrap();
        deleted.mark_deleted(1);
        let unpriced = Record::new_local(&json!({"id": "d", "price": "n/a"}), 0).unwrap();

        let stats = OrderStats::compute([&pending, &synced, &deleted, &unpriced], "price", 42);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending_local, 2);
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.deleted_local, 1);
        assert_eq!(stats.unsynced, 3);
        assert!((stats.amount_total - 12.5).abs() < f64::EPSILON);
        assert_eq!(stats.computed_at, 42);
    }

    #[test]
    fn empty_input() {
        let stats = OrderStats::compute(std::iter::empty(), "price", 0);
        assert_eq!(stats, OrderStats::default());
    }
}
