//! Expired row collector

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::GcError;
use crate::store::RowStore;

/// Deletes rows older than the retention horizon
pub struct RowCollector {
    store: Arc<dyn RowStore>,
    table: String,
    column: String,
    retention: Duration,
}

impl RowCollector {
    pub fn new(store: Arc<dyn RowStore>, table: &str, column: &str, retention: Duration) -> Self {
        Self {
            store,
            table: table.to_string(),
            column: column.to_string(),
            retention,
        }
    }

    /// Seven day horizon over `dns_publication.created`
    pub fn dns_publications(store: Arc<dyn RowStore>) -> Self {
        Self::new(store, "dns_publication", "created", Duration::days(7))
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Delete every row created before `now - retention`, in one
    /// transaction. Returns the number of rows deleted.
    pub fn collect(&self, now: DateTime<Utc>) -> Result<usize, GcError> {
        let cutoff = now - self.retention;
        let deleted = self
            .store
            .delete_older_than(&self.table, &self.column, cutoff)?;
        if deleted > 0 {
            info!(table = %self.table, "Deleted {} rows older than {}", deleted, cutoff);
        } else {
            debug!(table = %self.table, "No rows older than {}", cutoff);
        }
        Ok(deleted)
    }
}
