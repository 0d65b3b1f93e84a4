/// Bounded N-way concurrency built from [`Queue`] lanes.
///
/// Unpinned items go to the first idle lane at or after the round-robin
/// cursor. When every lane is busy they wait, in submission order, in an
/// overflow queue whose head is handed to whichever lane frees up next.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{select_all, BoxFuture, FutureExt};

use super::queue::{Completion, ProcessFn, Queue, QueueError};

struct Lanes<T, R> {
    queues: Vec<Queue<T, R>>,
    cursor: AtomicUsize,
}

impl<T, R> Lanes<T, R>
where
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn free_lane(&self) -> Option<&Queue<T, R>> {
        let n = self.queues.len();
        let start = self.cursor.load(Ordering::Relaxed) % n;
        let idx = (0..n).map(|i| (start + i) % n).find(|&i| self.queues[i].size() == 0)?;
        self.cursor.store(idx + 1, Ordering::Relaxed);
        Some(&self.queues[idx])
    }
}

pub struct QueuePool<T, R> {
    lanes: Arc<Lanes<T, R>>,
    overflow: Queue<(String, T), Completion<R>>,
}

impl<T, R> QueuePool<T, R>
where
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// A pool of `size` lanes (at least one) sharing `process`.
    pub fn new<F>(size: usize, process: F) -> Self
    where
        F: Fn(T) -> BoxFuture<'static, R> + Send + Sync + 'static,
    {
        let process: ProcessFn<T, R> = Arc::new(process);
        let lanes = Arc::new(Lanes {
            queues: (0..size.max(1))
                .map(|_| Queue::with_process(process.clone(), None))
                .collect(),
            cursor: AtomicUsize::new(0),
        });

        let overflow_lanes = lanes.clone();
        let overflow = Queue::new(
            move |(id, payload): (String, T)| {
                let lanes = overflow_lanes.clone();
                async move {
                    loop {
                        if let Some(lane) = lanes.free_lane() {
                            return lane.enqueue(id, payload);
                        }
                        let waits = lanes.queues.iter().map(Queue::once_free);
                        select_all(waits).await;
                    }
                }
                .boxed()
            },
            None,
        );

        Self { lanes, overflow }
    }

    pub fn size(&self) -> usize {
        self.lanes.queues.len()
    }

    /// Queue an item. `lane` pins it to one lane, bypassing the overflow.
    pub fn enqueue(
        &self,
        id: impl Into<String>,
        payload: T,
        lane: Option<usize>,
    ) -> Result<Completion<R>, QueueError> {
        let id = id.into();
        if let Some(lane) = lane {
            let queue = self.lanes.queues.get(lane).ok_or(QueueError::OutOfBounds {
                lane,
                size: self.size(),
            })?;
            return Ok(queue.enqueue(id, payload));
        }

        // Anything already overflowing goes first.
        if self.overflow.size() == 0 {
            if let Some(queue) = self.lanes.free_lane() {
                return Ok(queue.enqueue(id, payload));
            }
        }

        let placed = self.overflow.enqueue(id.clone(), (id, payload));
        Ok(async move { placed.await?.await }.boxed().shared())
    }

    /// Items not yet handed to a lane.
    pub fn waiting_items(&self) -> usize {
        self.overflow.size()
    }

    pub fn kill_all(&self) {
        self.overflow.kill_all();
        for queue in &self.lanes.queues {
            queue.kill_all();
        }
    }
}
