//! Delayed, coalescing saves keyed by path
//!
//! Attribute writes arrive in bursts (`cp -a`, `setfattr` loops), and each
//! remote save is a round trip. Instead of one timer thread per entry, a
//! single worker owns a [`DelayQueue`] and every schedule for a path bumps a
//! generation number. Only the latest generation of a path may fire, and
//! only if nobody cancelled it in between: the consumer must
//! [`Debouncer::claim`] an expiry while holding the entry lock, which is
//! what keeps a debounced save from racing an explicit one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;

/// Default quiet period before a debounced save runs
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Command {
    Schedule { path: String, generation: u64 },
    Shutdown,
}

/// A timer that ran out; must be claimed before acting on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub path: String,
    generation: u64,
}

#[derive(Debug)]
struct Shared {
    delay: Duration,
    pending: Mutex<HashMap<String, u64>>,
    next_generation: AtomicU64,
}

/// Handle used to schedule and cancel debounced saves
///
/// Cheap to clone; all clones drive the same worker.
#[derive(Debug, Clone)]
pub struct Debouncer {
    shared: Arc<Shared>,
    tx: flume::Sender<Command>,
}

/// Receives expired timers from the worker
#[derive(Debug)]
pub struct ExpiryReceiver {
    rx: flume::Receiver<Expired>,
}

impl ExpiryReceiver {
    /// Wait for the next expiry; `None` once the worker has stopped
    pub async fn recv(&self) -> Option<Expired> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<Expired> {
        self.rx.try_recv().ok()
    }
}

impl Debouncer {
    /// Start the worker on the current tokio runtime
    pub fn spawn(delay: Duration) -> (Self, ExpiryReceiver, JoinHandle<()>) {
        let (tx, command_rx) = flume::unbounded();
        let (expired_tx, rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            delay,
            pending: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        });

        let worker = tokio::spawn(run_worker(shared.clone(), command_rx, expired_tx));
        (Self { shared, tx }, ExpiryReceiver { rx }, worker)
    }

    /// Start (or restart) the timer for `path`
    pub fn schedule(&self, path: &str) {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
        self.shared
            .pending
            .lock()
            .insert(path.to_string(), generation);
        if self
            .tx
            .send(Command::Schedule {
                path: path.to_string(),
                generation,
            })
            .is_err()
        {
            tracing::debug!("debounce worker stopped, dropping schedule for {}", path);
            self.shared.pending.lock().remove(path);
        }
    }

    /// Cancel a pending timer; returns whether one was pending
    pub fn cancel(&self, path: &str) -> bool {
        self.shared.pending.lock().remove(path).is_some()
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.shared.pending.lock().contains_key(path)
    }

    /// Take ownership of an expiry. Returns false when the timer was
    /// cancelled or rescheduled after it fired, in which case the caller
    /// must not act on it.
    pub fn claim(&self, expired: &Expired) -> bool {
        let mut pending = self.shared.pending.lock();
        match pending.get(&expired.path) {
            Some(&generation) if generation == expired.generation => {
                pending.remove(&expired.path);
                true
            }
            _ => false,
        }
    }

    /// Drop every pending timer and stop the worker
    pub fn shutdown(&self) {
        let dropped = {
            let mut pending = self.shared.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            tracing::info!("discarding {} pending attribute saves", dropped);
        }
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn delay(&self) -> Duration {
        self.shared.delay
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    commands: flume::Receiver<Command>,
    expired_tx: flume::Sender<Expired>,
) {
    let mut queue: DelayQueue<(String, u64)> = DelayQueue::new();

    loop {
        tokio::select! {
            command = commands.recv_async() => match command {
                Ok(Command::Schedule { path, generation }) => {
                    queue.insert((path, generation), shared.delay);
                }
                Ok(Command::Shutdown) | Err(_) => break,
            },
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let (path, generation) = expired.into_inner();
                // Superseded schedules are dropped here already
                let current = shared.pending.lock().get(&path) == Some(&generation);
                if current && expired_tx.send(Expired { path, generation }).is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("debounce worker stopped");
}
