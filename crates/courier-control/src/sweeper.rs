//! Background retention sweeps
//!
//! Two policies share one timer: command records past the retention window
//! are expired, and peers disconnected for longer than the grace window are
//! purged. The state lock is held only for the duration of one sweep.

use crate::config::RelayConfig;
use crate::state::SharedState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// What one sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_records: usize,
    pub purged_peers: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_records == 0 && self.purged_peers.is_empty()
    }
}

#[derive(Clone)]
pub struct RetentionSweeper {
    state: SharedState,
    config: Arc<RelayConfig>,
}

impl RetentionSweeper {
    pub fn new(state: SharedState, config: Arc<RelayConfig>) -> Self {
        Self { state, config }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Apply both policies as if the current time were `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let report = {
            let mut state = self.state.lock().await;
            // A cutoff before the earliest representable time expires nothing
            let expired_records = now
                .checked_sub_signed(self.config.retention_window())
                .map_or(0, |cutoff| state.records.expire_older_than(cutoff));
            let purged_peers = state
                .registry
                .reclaim_disconnected(self.config.grace_window(), now);
            SweepReport {
                expired_records,
                purged_peers,
            }
        };

        if !report.is_empty() {
            info!(
                expired_records = report.expired_records,
                purged_peers = ?report.purged_peers,
                "Retention sweep completed"
            );
        }

        report
    }

    /// Sweep on a fixed interval until the task is aborted
    pub async fn run(self) {
        let mut sweep_tick = tokio::time::interval(self.config.sweep_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        sweep_tick.tick().await;

        debug!(
            interval_secs = self.config.sweep_interval.as_secs_f64(),
            "Retention sweeper started"
        );

        loop {
            sweep_tick.tick().await;
            self.sweep().await;
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Peer;
    use crate::state::RelayState;
    use courier_proto::{CommandRecord, Role};
    use courier_transport::MemoryConnection;
    use serde_json::json;
    use std::time::Duration;

    fn record(id: &str, issued_at: DateTime<Utc>) -> CommandRecord {
        CommandRecord {
            id: id.to_string(),
            origin: "c1".to_string(),
            target: "a1".to_string(),
            issued_at,
            responded_at: None,
            kind: "shell".to_string(),
            payload: json!("whoami"),
            response: None,
        }
    }

    async fn disconnected_agent(state: &SharedState, id: &str) -> DateTime<Utc> {
        let (server_end, _agent_end) = MemoryConnection::pair();
        let mut guard = state.lock().await;
        guard
            .registry
            .upsert(Peer::new(id, Role::Agent, Some(Arc::new(server_end))));
        guard.registry.mark_disconnected(id);
        guard.registry.get(id).unwrap().disconnected_at.unwrap()
    }

    #[tokio::test]
    async fn test_grace_window_boundaries() {
        let state = RelayState::shared();
        let sweeper = RetentionSweeper::new(state.clone(), Arc::new(RelayConfig::default()));
        let disconnected_at = disconnected_agent(&state, "a1").await;

        let report = sweeper
            .sweep_at(disconnected_at + chrono::Duration::seconds(9))
            .await;
        assert!(report.purged_peers.is_empty());
        assert!(state.lock().await.registry.contains("a1"));

        let report = sweeper
            .sweep_at(disconnected_at + chrono::Duration::seconds(11))
            .await;
        assert_eq!(report.purged_peers, vec!["a1".to_string()]);
        assert!(!state.lock().await.registry.contains("a1"));
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_is_not_purged() {
        let state = RelayState::shared();
        let sweeper = RetentionSweeper::new(state.clone(), Arc::new(RelayConfig::default()));
        let disconnected_at = disconnected_agent(&state, "a1").await;

        let (server_end, _agent_end) = MemoryConnection::pair();
        state
            .lock()
            .await
            .registry
            .upsert(Peer::new("a1", Role::Agent, Some(Arc::new(server_end))));

        let report = sweeper
            .sweep_at(disconnected_at + chrono::Duration::seconds(60))
            .await;
        assert!(report.is_empty());
        assert!(state.lock().await.registry.contains("a1"));
    }

    #[tokio::test]
    async fn test_record_expiry() {
        let state = RelayState::shared();
        let now = Utc::now();
        {
            let mut guard = state.lock().await;
            guard
                .records
                .insert(record("old", now - chrono::Duration::hours(25)));
            guard.records.insert(record("fresh", now));
        }

        let sweeper = RetentionSweeper::new(state.clone(), Arc::new(RelayConfig::default()));
        let report = sweeper.sweep_at(now).await;
        assert_eq!(report.expired_records, 1);

        // Sweeping again removes nothing
        assert!(sweeper.sweep_at(now).await.is_empty());
        assert_eq!(state.lock().await.records.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_retention_does_not_panic() {
        let state = RelayState::shared();
        let now = Utc::now();
        state
            .lock()
            .await
            .records
            .insert(record("k1", now - chrono::Duration::days(400)));

        let config = RelayConfig {
            retention: Duration::from_secs(10_000_000_000_000),
            ..Default::default()
        };
        let report = RetentionSweeper::new(state.clone(), Arc::new(config))
            .sweep_at(now)
            .await;
        assert_eq!(report.expired_records, 0);
        assert!(state.lock().await.records.contains("k1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_runs_on_interval() {
        let state = RelayState::shared();
        let config = RelayConfig {
            sweep_interval: Duration::from_secs(5),
            ..Default::default()
        };
        disconnected_agent(&state, "a1").await;
        // Paused time does not move the wall clock; backdate the disconnect instead
        state
            .lock()
            .await
            .registry
            .get_mut("a1")
            .unwrap()
            .disconnected_at = Some(Utc::now() - chrono::Duration::seconds(30));

        let handle = RetentionSweeper::new(state.clone(), Arc::new(config)).spawn();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(state.lock().await.registry.contains("a1"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!state.lock().await.registry.contains("a1"));
        handle.abort();
    }
}
