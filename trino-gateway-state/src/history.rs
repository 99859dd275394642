use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use snafu::{Snafu, ensure};
use tokio::sync::Mutex;
use tracing::{info, instrument};
use trino_gateway_core::{TrinoBackendName, TrinoQueryId};

use crate::QueryHistorySink;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("The history retention must be greater than zero"))]
    ZeroRetention,
}

#[derive(Clone, Debug)]
pub struct QueryHistoryRecord {
    pub query_id: TrinoQueryId,
    pub user: Option<String>,
    pub source: Option<String>,
    pub query: String,
    pub backend: TrinoBackendName,
    pub submitted_at: DateTime<Utc>,
}

/// Ring buffer of the most recent queries, for admin surfaces of a single gateway instance.
pub struct InMemoryHistory {
    retention: usize,
    records: Mutex<VecDeque<QueryHistoryRecord>>,
}

impl InMemoryHistory {
    pub fn new(retention: usize) -> Result<Self, Error> {
        ensure!(retention > 0, ZeroRetentionSnafu);
        info!(retention, "Using in-memory query history");

        Ok(Self {
            retention,
            records: Mutex::new(VecDeque::with_capacity(retention)),
        })
    }
}

impl QueryHistorySink for InMemoryHistory {
    #[instrument(skip(self, record), fields(query_id = record.query_id))]
    async fn record(&self, record: QueryHistoryRecord) -> Result<(), super::Error> {
        let mut records = self.records.lock().await;
        if records.len() == self.retention {
            records.pop_front();
        }
        records.push_back(record);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn recent(&self, limit: usize) -> Result<Vec<QueryHistoryRecord>, super::Error> {
        let records = self.records.lock().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::HistorySinkImplementation;

    use super::*;

    fn record(query_id: &str) -> QueryHistoryRecord {
        QueryHistoryRecord {
            query_id: query_id.to_string(),
            user: Some("will".to_string()),
            source: Some("trino-cli".to_string()),
            query: "SELECT 1".to_string(),
            backend: "trino-1".to_string(),
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_retention_drops_oldest_records() {
        let history: HistorySinkImplementation = InMemoryHistory::new(2).unwrap().into();

        for query_id in ["q1", "q2", "q3"] {
            history.record(record(query_id)).await.unwrap();
        }

        let recent = history.recent(10).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.query_id.as_str()).collect();
        assert_eq!(ids, ["q3", "q2"]);
    }

    #[test]
    fn test_zero_retention_is_rejected() {
        assert!(InMemoryHistory::new(0).is_err());
    }
}
