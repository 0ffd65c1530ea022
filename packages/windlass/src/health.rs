//! Aggregate health probe, consumed by the surrounding health-check
//! endpoint.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::limits::Gates;
use crate::store::JobStore;

/// A dependency is reported once its daily quota crosses this share.
const QUOTA_NEAR_LIMIT_PERCENT: u32 = 90;

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Jobs waiting to run.
    pub queue_depth: i64,
    /// Seconds the oldest Pending job has been waiting.
    pub oldest_pending_age_secs: Option<u64>,
    /// Dependencies whose breaker is currently Open.
    pub open_circuits: Vec<String>,
    /// Dependencies within striking distance of their daily ceiling.
    pub quota_near_limit: Vec<String>,
}

pub struct HealthProbe {
    jobs: Arc<dyn JobStore>,
    circuit: Arc<CircuitBreaker>,
    gates: Arc<Gates>,
}

impl HealthProbe {
    pub fn new(jobs: Arc<dyn JobStore>, circuit: Arc<CircuitBreaker>, gates: Arc<Gates>) -> Self {
        Self {
            jobs,
            circuit,
            gates,
        }
    }

    pub async fn snapshot(&self) -> Result<HealthSnapshot> {
        let stats = self.jobs.queue_stats().await?;

        let open_circuits = self
            .circuit
            .all_snapshots()
            .await?
            .into_iter()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.dependency)
            .collect();

        let quota_near_limit = self
            .gates
            .all_usage()
            .await?
            .into_iter()
            .filter(|u| u.limit > 0 && u.used * 100 >= u.limit * QUOTA_NEAR_LIMIT_PERCENT)
            .map(|u| u.dependency)
            .collect();

        Ok(HealthSnapshot {
            queue_depth: stats.queue_depth,
            oldest_pending_age_secs: stats.oldest_pending_age.map(|age| age.as_secs()),
            open_circuits,
            quota_near_limit,
        })
    }
}
