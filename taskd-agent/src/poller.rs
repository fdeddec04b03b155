//! Fetch, execute, confirm.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use taskd_common::{ConfirmAck, DispatchedTask, Outcome, TaskId};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{executor::ExecutorSet, ClientError, HttpChannel};

/// Server side of the poll loop.
#[async_trait]
pub trait TaskChannel: Send + Sync {
    async fn fetch(&self) -> Result<Vec<DispatchedTask>, ClientError>;

    async fn confirm(&self, task_id: TaskId, outcome: &Outcome) -> Result<ConfirmAck, ClientError>;
}

#[async_trait]
impl TaskChannel for HttpChannel {
    async fn fetch(&self) -> Result<Vec<DispatchedTask>, ClientError> {
        self.fetch_tasks().await
    }

    async fn confirm(&self, task_id: TaskId, outcome: &Outcome) -> Result<ConfirmAck, ClientError> {
        self.confirm_task(task_id, outcome).await
    }
}

/// Tally of one fetch/execute/confirm pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tasks whose confirmation did not reach the server; they stay
    /// `dispatched` until the server reclaims them.
    pub unconfirmed: usize,
}

pub struct Poller<C> {
    channel: C,
    executors: ExecutorSet,
}

impl<C: TaskChannel> Poller<C> {
    pub fn new(channel: C, executors: ExecutorSet) -> Self {
        Self { channel, executors }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// A failed fetch fails the cycle. Execution and confirmation failures
    /// are counted and logged; the rest of the batch still runs.
    pub async fn run_cycle(&self) -> Result<CycleReport, ClientError> {
        let tasks = self.channel.fetch().await?;
        let mut report = CycleReport {
            fetched: tasks.len(),
            ..CycleReport::default()
        };
        if tasks.is_empty() {
            debug!("no pending tasks");
            return Ok(report);
        }
        info!(count = tasks.len(), "received tasks");

        for task in &tasks {
            info!(task_id = %task.id, kind = %task.kind, title = %task.title, "executing task");
            let outcome = self.executors.execute(task).await;
            if outcome.is_success() {
                report.succeeded += 1;
                info!(task_id = %task.id, "{}", outcome.message);
            } else {
                report.failed += 1;
                warn!(task_id = %task.id, "{}", outcome.message);
            }

            match self.channel.confirm(task.id, &outcome).await {
                Ok(ack) if ack.applied => debug!(task_id = %task.id, "confirmation applied"),
                Ok(_) => info!(task_id = %task.id, "server ignored confirmation"),
                Err(err) => {
                    report.unconfirmed += 1;
                    error!(task_id = %task.id, "failed to confirm task: {err}");
                }
            }
        }

        Ok(report)
    }

    /// Polls every `interval` until `shutdown` resolves. A cycle in progress
    /// finishes before the loop exits.
    pub async fn run_until<F>(&self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.fetched > 0 => info!(?report, "cycle finished"),
                        Ok(_) => {}
                        Err(ClientError::Unauthorized) => {
                            error!("server rejected host token; check host id and secret");
                        }
                        Err(err) => warn!("fetch failed, retrying next tick: {err}"),
                    }
                }
            }
        }
    }
}
