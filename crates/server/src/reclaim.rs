// Reclaim sweep - returns unconfirmed dispatches to pending

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::TaskServer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub lease: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            lease: Duration::from_secs(900),
        }
    }
}

/// Start the sweep in the background. Returns `None` when disabled.
pub fn spawn_reclaim_task(server: Arc<TaskServer>, config: ReclaimConfig) -> Option<JoinHandle<()>> {
    if !config.enabled {
        info!("reclaim sweep disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        reclaim_loop(server, config).await;
    }))
}

async fn reclaim_loop(server: Arc<TaskServer>, config: ReclaimConfig) {
    let lease = match chrono::Duration::from_std(config.lease) {
        Ok(lease) => lease,
        Err(err) => {
            error!("reclaim lease out of range: {err}");
            return;
        }
    };
    debug!(
        interval_secs = config.interval.as_secs(),
        lease_secs = config.lease.as_secs(),
        "reclaim sweep started"
    );

    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;

        let server = Arc::clone(&server);
        let swept = tokio::task::spawn_blocking(move || server.reclaim_stale(lease)).await;
        match swept {
            Ok(Ok(reclaimed)) if !reclaimed.is_empty() => {
                info!(count = reclaimed.len(), "reclaimed stale dispatches");
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!("reclaim sweep failed: {err}"),
            Err(err) => error!("reclaim sweep panicked: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use taskd_common::{derive_token, Channel, NewTask, SecretRing, TaskKind, TaskStatus};

    #[tokio::test]
    async fn disabled_sweep_spawns_nothing() {
        let server = Arc::new(TaskServer::new(
            Arc::new(MemoryStore::new()),
            SecretRing::new("s"),
        ));
        let config = ReclaimConfig {
            enabled: false,
            ..ReclaimConfig::default()
        };
        assert!(spawn_reclaim_task(server, config).is_none());
    }

    #[tokio::test]
    async fn sweep_returns_stale_dispatch_to_pending() {
        let server = Arc::new(TaskServer::new(
            Arc::new(MemoryStore::new()),
            SecretRing::new("s"),
        ));
        let task = server
            .enqueue(NewTask {
                target: "HOST1".into(),
                channel: Channel::Host,
                title: "ping".into(),
                kind: TaskKind::Message,
                payload: "hello".into(),
                due_at: None,
            })
            .unwrap();
        server
            .fetch_pending("HOST1", Some(&derive_token("HOST1", "s")))
            .unwrap();

        let handle = spawn_reclaim_task(
            Arc::clone(&server),
            ReclaimConfig {
                enabled: true,
                interval: Duration::from_millis(10),
                lease: Duration::ZERO,
            },
        )
        .expect("sweep enabled");

        let mut status = TaskStatus::Dispatched;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = server.store().get(task.id).unwrap().unwrap().status;
            if status == TaskStatus::Pending {
                break;
            }
        }
        handle.abort();
        assert_eq!(status, TaskStatus::Pending);
    }
}
