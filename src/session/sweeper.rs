//! # Inactivity Sweeper
//!
//! Periodic task that force-closes sessions idle past the configured
//! threshold. Eviction goes through the registry, so the client connection
//! (if still open) is torn down with the session.

use crate::config::SessionConfig;
use crate::events::CloseReason;
use crate::session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct InactivitySweeper {
    registry: Arc<SessionRegistry>,
    period: Duration,
    idle_after: chrono::Duration,
}

impl InactivitySweeper {
    pub fn new(registry: Arc<SessionRegistry>, config: &SessionConfig) -> Self {
        Self {
            registry,
            period: Duration::from_secs(config.sweep_interval_secs),
            idle_after: chrono::Duration::seconds(config.inactivity_timeout_secs as i64),
        }
    }

    /// Runs the sweep loop until the process exits.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            loop {
                ticker.tick().await;
                let evicted = self.sweep_once();
                if evicted > 0 {
                    info!(evicted, "inactivity sweep evicted sessions");
                }
            }
        })
    }

    /// One pass over the registry; returns how many sessions were evicted.
    pub fn sweep_once(&self) -> usize {
        let stale = self.registry.list_idle_since(self.idle_after);
        let mut evicted = 0;
        for session_id in stale {
            debug!(session_id = %session_id, "closing idle session");
            if self.registry.remove(&session_id, CloseReason::Inactivity) {
                evicted += 1;
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::protocol::ServerFrame;
    use tokio::sync::mpsc;

    fn sweeper_with(
        inactivity_timeout_secs: u64,
    ) -> (Arc<SessionRegistry>, InactivitySweeper) {
        let registry = Arc::new(SessionRegistry::new(8, 5, EventBus::new(16)));
        let config = SessionConfig {
            max_concurrent_sessions: 8,
            inactivity_timeout_secs,
            sweep_interval_secs: 60,
            pipeline_timeout_secs: 30,
            history_depth: 5,
        };
        let sweeper = InactivitySweeper::new(registry.clone(), &config);
        (registry, sweeper)
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions_and_closes_their_connections() {
        let (registry, sweeper) = sweeper_with(300);

        registry.create(Some("stale".to_string()), "u1", "c1").unwrap();
        registry.create(Some("active".to_string()), "u2", "c2").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
        registry.attach_client("stale", tx).unwrap();
        registry.force_last_activity("stale", chrono::Duration::seconds(600));

        assert_eq!(sweeper.sweep_once(), 1);

        assert!(registry.get("stale").is_err());
        assert!(registry.get("active").is_ok());
        // Channel closed along with the session.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn sweep_is_a_noop_when_everything_is_fresh() {
        let (registry, sweeper) = sweeper_with(300);
        registry.create(Some("s1".to_string()), "u1", "c1").unwrap();
        assert_eq!(sweeper.sweep_once(), 0);
        assert!(registry.get("s1").is_ok());
    }
}
