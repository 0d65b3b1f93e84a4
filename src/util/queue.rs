/// FIFO critical-section queue.
///
/// Items are processed one at a time by a single worker task; the next item
/// is only taken once the previous one has produced its result. Enqueuing an
/// id that is still waiting hands back the existing completion instead of
/// adding a second entry.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::trace;

/// The critical section run for each item.
pub type ProcessFn<T, R> = Arc<dyn Fn(T) -> BoxFuture<'static, R> + Send + Sync>;

/// Outcome of a queued item, awaitable by any number of callers.
pub type Completion<R> = Shared<BoxFuture<'static, Result<R, QueueError>>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue killed")]
    Killed,
    #[error("lane {lane} is out of bounds for a pool of {size}")]
    OutOfBounds { lane: usize, size: usize },
}

struct Item<T, R> {
    id: String,
    payload: T,
    tx: oneshot::Sender<R>,
    completion: Completion<R>,
}

struct State<T, R> {
    pending: VecDeque<Item<T, R>>,
    processing: bool,
    free_waiters: Vec<oneshot::Sender<()>>,
}

impl<T, R> State<T, R> {
    fn size(&self) -> usize {
        self.pending.len() + usize::from(self.processing)
    }
}

struct Inner<T, R> {
    state: Mutex<State<T, R>>,
    wake: Notify,
    process: ProcessFn<T, R>,
    interval: Option<Duration>,
}

impl<T, R> Inner<T, R> {
    fn lock(&self) -> MutexGuard<'_, State<T, R>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Queue<T, R> {
    inner: Arc<Inner<T, R>>,
    worker: JoinHandle<()>,
}

impl<T, R> Queue<T, R>
where
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Start a queue. With `interval` set, the worker pauses that long after
    /// each item; otherwise items run back to back, each after one yield.
    pub fn new<F>(process: F, interval: Option<Duration>) -> Self
    where
        F: Fn(T) -> BoxFuture<'static, R> + Send + Sync + 'static,
    {
        Self::with_process(Arc::new(process), interval)
    }

    pub fn with_process(process: ProcessFn<T, R>, interval: Option<Duration>) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                processing: false,
                free_waiters: Vec::new(),
            }),
            wake: Notify::new(),
            process,
            interval: interval.filter(|d| !d.is_zero()),
        });
        let worker = tokio::spawn(run_worker(inner.clone()));
        Self { inner, worker }
    }

    /// Queue `payload` under `id`. A still-waiting item with the same id
    /// is not duplicated; its completion is returned instead.
    pub fn enqueue(&self, id: impl Into<String>, payload: T) -> Completion<R> {
        let id = id.into();
        let mut st = self.inner.lock();
        if let Some(existing) = st.pending.iter().find(|item| item.id == id) {
            return existing.completion.clone();
        }

        let (tx, rx) = oneshot::channel();
        let completion = rx.map(|r| r.map_err(|_| QueueError::Killed)).boxed().shared();
        st.pending.push_back(Item {
            id,
            payload,
            tx,
            completion: completion.clone(),
        });
        drop(st);
        self.inner.wake.notify_one();
        completion
    }

    /// Items waiting plus the one in its critical section.
    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    /// Resolves once nothing is queued or in flight.
    pub fn once_free(&self) -> BoxFuture<'static, ()> {
        let mut st = self.inner.lock();
        if st.size() == 0 {
            return futures::future::ready(()).boxed();
        }
        let (tx, rx) = oneshot::channel();
        st.free_waiters.push(tx);
        rx.map(|_| ()).boxed()
    }

    /// Reject every waiting item. The item in flight runs to completion.
    pub fn kill_all(&self) {
        let killed: Vec<_> = self.inner.lock().pending.drain(..).collect();
        if !killed.is_empty() {
            trace!(count = killed.len(), "queue: killed waiting items");
        }
    }
}

impl<T, R> Drop for Queue<T, R> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker<T, R>(inner: Arc<Inner<T, R>>)
where
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    loop {
        let next = {
            let mut st = inner.lock();
            match st.pending.pop_front() {
                Some(item) => {
                    st.processing = true;
                    Some(item)
                }
                None => {
                    for waiter in st.free_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                    None
                }
            }
        };

        let Some(item) = next else {
            inner.wake.notified().await;
            continue;
        };

        if inner.interval.is_none() {
            tokio::task::yield_now().await;
        }

        let Item { payload, tx, .. } = item;
        let outcome = (inner.process)(payload).await;
        let _ = tx.send(outcome);

        inner.lock().processing = false;
        if let Some(interval) = inner.interval {
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    fn sleeper(ms: u64) -> Queue<u32, u32> {
        Queue::new(
            move |n| {
                async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    n * 2
                }
                .boxed()
            },
            None,
        )
    }

    // ── Ordering ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn processes_one_item_at_a_time_in_order() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let q = {
            let (live, peak, seen) = (live.clone(), peak.clone(), seen.clone());
            Queue::new(
                move |n: u32| {
                    let (live, peak, seen) = (live.clone(), peak.clone(), seen.clone());
                    async move {
                        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        seen.lock().unwrap().push(n);
                        live.fetch_sub(1, Ordering::SeqCst);
                        n
                    }
                    .boxed()
                },
                None,
            )
        };

        let waits: Vec<_> = (0..4).map(|n| q.enqueue(format!("item{n}"), n)).collect();
        assert_eq!(q.size(), 4);
        for (n, w) in waits.into_iter().enumerate() {
            assert_eq!(w.await, Ok(n as u32));
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_id_shares_completion() {
        let q = sleeper(10);
        let _blocker = q.enqueue("blocker", 0);
        let first = q.enqueue("same", 1);
        let second = q.enqueue("same", 99);
        assert_eq!(q.size(), 2);
        assert_eq!(first.await, Ok(2));
        assert_eq!(second.await, Ok(2));
    }

    // ── Pacing ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn interval_spaces_out_items() {
        let q: Queue<u32, Instant> =
            Queue::new(|_| async { Instant::now() }.boxed(), Some(Duration::from_secs(5)));
        let start = Instant::now();
        let a = q.enqueue("a", 0);
        let b = q.enqueue("b", 0);
        let a = a.await.unwrap();
        let b = b.await.unwrap();
        assert!(a - start < Duration::from_secs(1));
        assert!(b - a >= Duration::from_secs(5));
    }

    // ── Lifecycle ────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn kill_all_rejects_waiting_items() {
        let q = sleeper(50);
        let running = q.enqueue("running", 1);
        while !q.inner.lock().processing {
            tokio::task::yield_now().await;
        }
        let doomed = q.enqueue("doomed", 2);
        q.kill_all();
        assert_eq!(doomed.await, Err(QueueError::Killed));
        assert_eq!(running.await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn once_free_resolves_when_drained() {
        let q = sleeper(20);
        q.once_free().await;
        let _w = q.enqueue("x", 1);
        let start = Instant::now();
        q.once_free().await;
        assert!(Instant::now() - start >= Duration::from_millis(20));
        assert_eq!(q.size(), 0);
    }
}
