use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::Builder;
use std::time::Duration;
use crossbeam_channel::{unbounded, Receiver, Sender};
use crate::error::{S9Result, S9SocketError};
use super::types::lock;

/// Idle time after which a cached worker thread exits
const CACHED_KEEP_ALIVE: Duration = Duration::from_secs(60);

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    shutdown: AtomicBool,
    idle: AtomicUsize,
}

// ============================================================================
// WorkerPool - cached or fixed pool with abrupt one-shot shutdown
// ============================================================================

/// Worker threads fed from one shared queue.
///
/// A cached pool grows a thread whenever a task would otherwise wait, and lets idle threads
/// exit after a keep-alive. A fixed pool starts all its threads upfront.
///
/// `shutdown_now` cancels queued tasks and rejects new ones. Running tasks are not
/// interrupted; owners unblock them by closing the sockets they block on.
pub(crate) struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    state: Arc<PoolState>,
    keep_alive: Option<Duration>,
    next_worker: AtomicUsize,
}

impl WorkerPool {
    /// Unbounded pool that spawns threads on demand
    pub(crate) fn cached(name: &str) -> Self {
        Self::with_keep_alive(name, Some(CACHED_KEEP_ALIVE))
    }

    /// Pool of exactly `size` long-lived threads
    pub(crate) fn fixed(name: &str, size: usize) -> S9Result<Self> {
        if size == 0 {
            return Err(S9SocketError::InvalidConfiguration("Worker pool size cannot be zero".to_string()));
        }
        let pool = Self::with_keep_alive(name, None);
        for _ in 0..size {
            pool.spawn_worker()?;
        }
        Ok(pool)
    }

    fn with_keep_alive(name: &str, keep_alive: Option<Duration>) -> Self {
        let (sender, receiver) = unbounded::<Task>();
        Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            receiver,
            state: Arc::new(PoolState::default()),
            keep_alive,
            next_worker: AtomicUsize::new(0),
        }
    }

    pub(crate) fn submit<F>(&self, task: F) -> S9Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(S9SocketError::PoolShutdown);
        }
        {
            let sender = lock!(self.sender);
            let sender = sender.as_ref().ok_or(S9SocketError::PoolShutdown)?;
            sender.send(Box::new(task)).map_err(|_| S9SocketError::PoolShutdown)?;
        }

        if self.keep_alive.is_some() && self.receiver.len() > self.state.idle.load(Ordering::SeqCst) {
            self.spawn_worker()?;
        }
        Ok(())
    }

    /// Rejects new tasks and drops every queued one. Returns the number of cancelled tasks.
    pub(crate) fn shutdown_now(&self) -> usize {
        if self.state.shutdown.swap(true, Ordering::SeqCst) {
            return 0;
        }
        lock!(self.sender).take();
        let cancelled = self.receiver.try_iter().count();
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Worker pool {} shut down, {} queued tasks cancelled", self.name, cancelled);
        }
        cancelled
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }

    fn spawn_worker(&self) -> S9Result<()> {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let receiver = self.receiver.clone();
        let state = Arc::clone(&self.state);
        let keep_alive = self.keep_alive;

        Builder::new()
            .name(format!("{}-worker-{}", self.name, id))
            .spawn(move || {
                loop {
                    state.idle.fetch_add(1, Ordering::SeqCst);
                    let task = match keep_alive {
                        Some(keep_alive) => receiver.recv_timeout(keep_alive).ok(),
                        None => receiver.recv().ok(),
                    };
                    state.idle.fetch_sub(1, Ordering::SeqCst);

                    let Some(task) = task else { break };
                    if state.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!("Worker task panicked");
                    }
                }
            })?;
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Disconnect the queue so idle workers exit
        lock!(self.sender).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn cached_pool_runs_concurrent_blocking_tasks() {
        let pool = WorkerPool::cached("test-cached");
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();

        for _ in 0..4 {
            let started_tx = started_tx.clone();
            let release_rx = release_rx.clone();
            pool.submit(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }).unwrap();
        }

        // All four block at once, so the cached pool must have grown to four threads
        for _ in 0..4 {
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        for _ in 0..4 {
            release_tx.send(()).unwrap();
        }
    }

    #[test]
    fn fixed_pool_rejects_zero_size() {
        assert!(matches!(WorkerPool::fixed("test-fixed", 0), Err(S9SocketError::InvalidConfiguration(_))));
    }

    #[test]
    fn shutdown_cancels_queued_tasks_and_rejects_new_ones() {
        let pool = WorkerPool::fixed("test-shutdown", 1).unwrap();
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        let (ran_tx, ran_rx) = mpsc::channel::<()>();

        pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().ok();
        }).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The only worker is busy, so these stay queued
        for _ in 0..3 {
            let ran_tx = ran_tx.clone();
            pool.submit(move || { ran_tx.send(()).ok(); }).unwrap();
        }

        assert_eq!(pool.shutdown_now(), 3);
        assert_eq!(pool.shutdown_now(), 0);
        assert!(pool.is_shutdown());
        assert!(matches!(pool.submit(|| {}), Err(S9SocketError::PoolShutdown)));

        release_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(ran_tx);
        assert!(ran_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let pool = WorkerPool::fixed("test-panic", 1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(|| panic!("boom")).unwrap();
        pool.submit(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }
}
