//! Per-key FIFO task queues with bounded cross-key concurrency.
//!
//! Tasks submitted for the same stream run strictly in submission order on a
//! shared worker pool; tasks for different streams run in parallel up to the
//! worker count. A task submitted after another on the same key observes all
//! effects of the earlier task.

use crate::error::{RepositoryError, Result};
use crate::types::StreamId;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A queued unit of work. The flag is true when the task was cancelled by
/// `close()` before it started; the task must then report `QueueClosed`
/// instead of executing.
type Task = Box<dyn FnOnce(bool) + Send + 'static>;

enum WorkerMsg {
    Key(StreamId),
    Shutdown,
}

struct Inner {
    name: &'static str,
    /// Pending tasks per stream. A key's presence means it is scheduled: at
    /// most one of its tasks executes at any moment, and the entry is pruned
    /// once drained so the map does not grow with streams ever seen.
    lanes: Mutex<HashMap<StreamId, VecDeque<Task>>>,
    ready_tx: Sender<WorkerMsg>,
    closed: AtomicBool,
}

/// Handle on a submitted task; resolves to the task's result.
pub struct TaskHandle<T> {
    name: &'static str,
    rx: Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task completes.
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(result) => result,
            // Sender dropped without a result: the worker died mid-task.
            Err(_) => Err(RepositoryError::QueueClosed(self.name)),
        }
    }
}

/// Named per-key FIFO serialiser.
pub struct ExecutionQueue {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl ExecutionQueue {
    /// Create a queue running at most `concurrency` tasks at once across all
    /// keys.
    pub fn new(name: &'static str, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (ready_tx, ready_rx) = unbounded();
        let inner = Arc::new(Inner {
            name,
            lanes: Mutex::new(HashMap::new()),
            ready_tx,
            closed: AtomicBool::new(false),
        });

        let workers = (0..concurrency)
            .map(|_| {
                let inner = Arc::clone(&inner);
                let rx = ready_rx.clone();
                std::thread::spawn(move || worker_loop(inner, rx))
            })
            .collect();

        Self {
            inner,
            workers: Mutex::new(workers),
            worker_count: concurrency,
        }
    }

    /// Submit a task for `key`. Tasks for the same key run in submission
    /// order; the returned handle resolves to the task's result, or to
    /// `QueueClosed` if the queue shut down before the task started.
    pub fn run<T, F>(&self, key: StreamId, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let name = self.inner.name;
        let (tx, rx) = bounded(1);
        let task: Task = Box::new(move |cancelled| {
            let result = if cancelled {
                Err(RepositoryError::QueueClosed(name))
            } else {
                f()
            };
            let _ = tx.send(result);
        });

        if let Err(task) = self.submit(key, task) {
            // Queue already closed; resolve the handle immediately.
            task(true);
        }

        TaskHandle { name, rx }
    }

    fn submit(&self, key: StreamId, task: Task) -> std::result::Result<(), Task> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(task);
        }
        let mut lanes = self.inner.lanes.lock();
        // Re-check under the lock: close() drains lanes while holding it.
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(task);
        }
        match lanes.get_mut(&key) {
            Some(lane) => lane.push_back(task),
            None => {
                let mut lane = VecDeque::new();
                lane.push_back(task);
                lanes.insert(key, lane);
                let _ = self.inner.ready_tx.send(WorkerMsg::Key(key));
            }
        }
        Ok(())
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the queue: reject new submissions, fail not-yet-started tasks
    /// with `QueueClosed`, and wait for in-flight tasks to finish.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancelled: Vec<Task> = {
            let mut lanes = self.inner.lanes.lock();
            lanes.drain().flat_map(|(_, lane)| lane).collect()
        };
        for task in cancelled {
            task(true);
        }

        for _ in 0..self.worker_count {
            let _ = self.inner.ready_tx.send(WorkerMsg::Shutdown);
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(inner: Arc<Inner>, ready_rx: Receiver<WorkerMsg>) {
    while let Ok(msg) = ready_rx.recv() {
        let key = match msg {
            WorkerMsg::Shutdown => break,
            WorkerMsg::Key(key) => key,
        };

        // One key is owned by one worker at a time: the key is enqueued only
        // on lane creation and re-enqueued only by the worker that just
        // finished a task for it.
        let task = {
            let mut lanes = inner.lanes.lock();
            lanes.get_mut(&key).and_then(|lane| lane.pop_front())
        };
        let Some(task) = task else { continue };

        task(false);

        let mut lanes = inner.lanes.lock();
        match lanes.get_mut(&key) {
            Some(lane) if lane.is_empty() => {
                lanes.remove(&key);
            }
            Some(_) => {
                // More work arrived; requeue so other keys get a turn.
                let _ = inner.ready_tx.send(WorkerMsg::Key(key));
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Cid, StreamId, StreamType};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn key(n: u8) -> StreamId {
        StreamId::new(StreamType(0), Cid::from_bytes(&[n]))
    }

    #[test]
    fn test_fifo_per_key() {
        let queue = ExecutionQueue::new("test queue", 4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let order = Arc::clone(&order);
                queue.run(key(1), move || {
                    order.lock().push(i);
                    Ok(i)
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().unwrap(), i);
        }
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_keys_run_in_parallel() {
        let queue = ExecutionQueue::new("test queue", 2);
        let (gate_tx, gate_rx) = bounded::<()>(0);

        // Task on key 1 blocks until key 2's task releases it; both complete
        // only if the two keys execute concurrently.
        let gate_rx2 = gate_rx.clone();
        let blocked = queue.run(key(1), move || {
            gate_rx2
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| RepositoryError::Corruption("gate never opened".into()))?;
            Ok(())
        });
        let opener = queue.run(key(2), move || {
            gate_tx.send(()).ok();
            Ok(())
        });

        opener.wait().unwrap();
        blocked.wait().unwrap();
    }

    #[test]
    fn test_failure_does_not_cancel_siblings() {
        let queue = ExecutionQueue::new("test queue", 2);

        let failing = queue.run(key(1), || {
            Err::<(), _>(RepositoryError::Corruption("boom".into()))
        });
        let sibling = queue.run(key(1), || Ok(42));

        assert!(failing.wait().is_err());
        assert_eq!(sibling.wait().unwrap(), 42);
    }

    #[test]
    fn test_close_rejects_pending_and_new_tasks() {
        let queue = ExecutionQueue::new("test queue", 1);
        let (started_tx, started_rx) = bounded::<()>(1);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let ran = Arc::new(AtomicUsize::new(0));

        let ran1 = Arc::clone(&ran);
        let in_flight = queue.run(key(1), move || {
            started_tx.send(()).ok();
            gate_rx.recv_timeout(Duration::from_secs(5)).ok();
            ran1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        // Queued behind the in-flight task; will be cancelled by close().
        let ran2 = Arc::clone(&ran);
        let pending = queue.run(key(1), move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // Only close once the first task is actually executing.
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let closer = std::thread::spawn(move || {
            // Let close() start draining, then release the in-flight task.
            std::thread::sleep(Duration::from_millis(50));
            gate_tx.send(()).ok();
        });
        queue.close();
        closer.join().unwrap();

        in_flight.wait().unwrap();
        assert!(matches!(
            pending.wait(),
            Err(RepositoryError::QueueClosed(_))
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let late = queue.run(key(2), || Ok(()));
        assert!(matches!(late.wait(), Err(RepositoryError::QueueClosed(_))));
    }

    #[test]
    fn test_close_is_idempotent() {
        let queue = ExecutionQueue::new("test queue", 2);
        queue.run(key(1), || Ok(())).wait().unwrap();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
    }

    #[test]
    fn test_lane_pruned_after_drain() {
        let queue = ExecutionQueue::new("test queue", 2);
        for i in 0..5 {
            queue.run(key(i), || Ok(())).wait().unwrap();
        }
        // The result is delivered before the worker prunes, so give it a
        // moment to finish bookkeeping.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !queue.inner.lanes.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(queue.inner.lanes.lock().is_empty());
    }
}
