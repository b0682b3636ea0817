//! Activation history: one record per successful activation.
//!
//! Append-only. The aggregate is reporting only; nothing here feeds back
//! into the estimator.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::jobs::JobType;
use crate::store::HistoryStore;

/// What was activated, when, and for how long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub timestamp: DateTime<Utc>,
    pub total_jobs: usize,
    pub by_type: BTreeMap<JobType, usize>,
    pub estimated_minutes: u32,
    pub configured_minutes: u32,
    pub scheduled_stop_at: DateTime<Utc>,
    /// `"scheduler"` for automatic ticks, the operator's name otherwise.
    pub initiator: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryAggregate {
    pub total_activations: usize,
    pub total_jobs_processed: usize,
    pub avg_configured_minutes: f64,
    pub avg_jobs_per_activation: f64,
}

impl HistoryAggregate {
    pub fn from_records(records: &[ActivationRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }
        let n = records.len() as f64;
        let total_jobs_processed: usize = records.iter().map(|r| r.total_jobs).sum();
        let total_minutes: u64 = records.iter().map(|r| r.configured_minutes as u64).sum();

        Self {
            total_activations: records.len(),
            total_jobs_processed,
            avg_configured_minutes: total_minutes as f64 / n,
            avg_jobs_per_activation: total_jobs_processed as f64 / n,
        }
    }
}

pub struct ActivationHistory {
    store: Arc<dyn HistoryStore>,
}

impl ActivationHistory {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, record: &ActivationRecord) -> Result<(), DatabaseError> {
        self.store.append_activation(record).await
    }

    pub async fn aggregate(&self) -> Result<HistoryAggregate, DatabaseError> {
        let records = self.store.list_activations().await?;
        Ok(HistoryAggregate::from_records(&records))
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<ActivationRecord>, DatabaseError> {
        self.store.recent_activations(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    fn record(total: usize, minutes: u32) -> ActivationRecord {
        let now = Utc::now();
        ActivationRecord {
            timestamp: now,
            total_jobs: total,
            by_type: BTreeMap::from([(JobType::CalculateStats, total)]),
            estimated_minutes: minutes,
            configured_minutes: minutes,
            scheduled_stop_at: now + chrono::Duration::minutes(minutes as i64),
            initiator: "scheduler".into(),
        }
    }

    #[test]
    fn empty_aggregate_is_zero() {
        let agg = HistoryAggregate::from_records(&[]);
        assert_eq!(agg.total_activations, 0);
        assert_eq!(agg.total_jobs_processed, 0);
        assert_eq!(agg.avg_configured_minutes, 0.0);
        assert_eq!(agg.avg_jobs_per_activation, 0.0);
    }

    #[test]
    fn aggregate_averages() {
        let agg = HistoryAggregate::from_records(&[record(10, 5), record(30, 15)]);
        assert_eq!(agg.total_activations, 2);
        assert_eq!(agg.total_jobs_processed, 40);
        assert_eq!(agg.avg_configured_minutes, 10.0);
        assert_eq!(agg.avg_jobs_per_activation, 20.0);
    }

    #[tokio::test]
    async fn record_then_aggregate() {
        let history = ActivationHistory::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()));
        assert_eq!(history.aggregate().await.unwrap(), HistoryAggregate::default());

        history.record(&record(4, 5)).await.unwrap();
        history.record(&record(8, 7)).await.unwrap();

        let agg = history.aggregate().await.unwrap();
        assert_eq!(agg.total_activations, 2);
        assert_eq!(agg.total_jobs_processed, 12);
        assert_eq!(agg.avg_configured_minutes, 6.0);

        let recent = history.recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].total_jobs, 8);
    }

    #[test]
    fn record_serializes_job_types_by_name() {
        let json = serde_json::to_value(record(2, 5)).unwrap();
        assert_eq!(json["by_type"]["CALCULATE_STATS"], 2);
    }
}
