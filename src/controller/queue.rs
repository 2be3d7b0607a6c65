use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::Notify;
use tracing::debug;

/// Default capacity of a command queue
pub const DEFAULT_CAPACITY: usize = 16;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Entry {
    identity: String,
    job: Job,
}

/// Bounded FIFO of deferred async work.
///
/// Event callbacks append closures instead of acting directly, so shared state
/// is never mutated re-entrantly while I/O is in flight. A single worker
/// drains the queue in order.
pub struct CommandQueue {
    name: &'static str,
    capacity: usize,
    entries: Mutex<VecDeque<Entry>>,
    signal: Notify,
}

impl CommandQueue {
    pub fn new(name: &'static str) -> Self {
        Self::with_capacity(name, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            signal: Notify::new(),
        }
    }

    /// Non-blocking append.
    ///
    /// On overflow the oldest entry with the same identity is dropped, or the
    /// oldest entry overall if none shares it.
    pub fn append<F, Fut>(&self, identity: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let identity = identity.into();
        {
            let mut entries = self.entries.lock();
            if entries.len() >= self.capacity {
                let victim = entries
                    .iter()
                    .position(|e| e.identity == identity)
                    .unwrap_or(0);
                if let Some(dropped) = entries.remove(victim) {
                    debug!(queue = self.name, dropped = %dropped.identity, "command queue full, dropping entry");
                }
            }
            entries.push_back(Entry {
                identity,
                job: Box::new(move || Box::pin(f())),
            });
        }
        self.signal.notify_one();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities of the queued entries, oldest first
    pub fn pending(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.identity.clone()).collect()
    }

    /// Runs queued entries in order until the queue is empty
    pub async fn drain(&self) {
        loop {
            let next = self.entries.lock().pop_front();
            match next {
                Some(entry) => (entry.job)().await,
                None => break,
            }
        }
    }

    /// Worker loop: wait for the signal, drain, repeat
    pub async fn run(&self) {
        loop {
            self.signal.notified().await;
            self.drain().await;
        }
    }
}
