//! Shared execution pool and the manual-wake event.
//!
//! Query work is deferred onto a fixed set of OS threads so the
//! connection's I/O task never blocks on execution. Completion is
//! signalled back by activating the connection's [`WakeHandle`], the
//! only cross-thread interaction in the engine. Everything else about a
//! connection stays on the task that owns it.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// An event with no file descriptor behind it, activated to wake a
/// connection parked on deferred work.
///
/// Activation is safe from any thread, and a wake that fires before the
/// connection starts waiting is not lost.
#[derive(Clone, Default)]
pub struct WakeHandle {
    notify: Arc<Notify>,
}

impl WakeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activates the event. Callable from any thread.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Suspends until the event is activated.
    pub async fn woken(&self) {
        self.notify.notified().await;
    }
}

/// A fixed pool of worker threads draining a shared job queue.
///
/// Handles are cheap to clone; one lives on every connection. Workers
/// exit when the last handle is dropped.
#[derive(Clone)]
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        for index in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let builder = thread::Builder::new().name(format!("vireo-worker-{index}"));
            let spawned = builder.spawn(move || {
                debug!(worker = index, "execution worker started");
                loop {
                    let job = receiver.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                }
                debug!(worker = index, "execution worker stopped");
            });
            if let Err(e) = spawned {
                error!(worker = index, error = %e, "failed to spawn execution worker");
            }
        }

        Self { sender }
    }

    /// Enqueues a job for the next free worker.
    pub fn submit(&self, job: Job) {
        if self.sender.send(job).is_err() {
            error!("execution pool is gone; dropping job");
        }
    }
}
