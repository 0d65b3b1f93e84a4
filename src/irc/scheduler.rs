/// Per-network reconnect pacing.
///
/// Each network gets one FIFO [`Queue`] serviced at its reconnect interval,
/// so at most one connection attempt per network is in flight and a mass
/// disconnect does not stampede the server.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use super::connection::ConnectionInstance;
use crate::config::NetworkConfig;
use crate::error::ConnectError;
use crate::util::queue::{Completion, Queue};

pub type AttemptResult = Result<Arc<ConnectionInstance>, ConnectError>;

pub struct ScheduledAttempt {
    added_delay: Duration,
    attempt: BoxFuture<'static, AttemptResult>,
}

type SchedulerQueue = Arc<Queue<ScheduledAttempt, AttemptResult>>;

#[derive(Default)]
pub struct SchedulerRegistry {
    queues: Mutex<HashMap<String, SchedulerQueue>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_for(&self, network: &NetworkConfig) -> SchedulerQueue {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues
            .entry(network.domain.clone())
            .or_insert_with(|| {
                Arc::new(Queue::new(
                    |item: ScheduledAttempt| {
                        async move {
                            if !item.added_delay.is_zero() {
                                tokio::time::sleep(item.added_delay).await;
                            }
                            item.attempt.await
                        }
                        .boxed()
                    },
                    network.reconnect_interval(),
                ))
            })
            .clone()
    }

    /// Queue a connection attempt for `nick`. A second request for the same
    /// nick while the first still waits shares the first one's outcome.
    pub fn reschedule(
        &self,
        network: &NetworkConfig,
        nick: &str,
        added_delay: Duration,
        attempt: BoxFuture<'static, AttemptResult>,
    ) -> Completion<AttemptResult> {
        let queue = self.queue_for(network);
        let id = format!("Scheduler.reschedule {} {nick}", network.domain);
        let completion = queue.enqueue(id, ScheduledAttempt { added_delay, attempt });
        debug!(
            domain = %network.domain,
            nick,
            added_delay_ms = added_delay.as_millis() as u64,
            queued = queue.size(),
            "scheduler: queued connection attempt"
        );
        completion
    }

    /// Attempts waiting (or running) for `domain`.
    pub fn pending(&self, domain: &str) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues.get(domain).map_or(0, |q| q.size())
    }

    /// Reject every queued attempt on every network.
    pub fn kill_all(&self) {
        let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        for queue in queues.values() {
            queue.kill_all();
        }
    }
}
