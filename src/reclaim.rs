//! Deferred reclamation of unreachable versions.
//!
//! Every version registers a disposer that owns its root node. When the last
//! handle to the version is dropped, its [`Tracker`] posts a notice to a
//! background worker which runs the disposer and thereby releases the nodes
//! only that version still referenced. Dropping a handle therefore never
//! performs the (potentially large) release work on the caller's thread.
//!
//! The worker is started lazily with the first registration. If the thread
//! cannot be spawned, disposers run inline on the dropping thread instead.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;

use crate::config::config;
use crate::error::{Result, TrieError};

/// Cleanup action run once the tracked handle becomes unreachable.
pub type Disposer = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Registration number of a tracked handle. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

enum Notice {
    Unreachable(Token),
    Flush(Sender<()>),
}

#[derive(Default)]
struct Registry {
    entries: DashMap<Token, Disposer>,
    next_token: AtomicU64,
    live: AtomicUsize,
    reclaimed: AtomicU64,
    failures: AtomicU64,
}

impl Registry {
    fn register(&self, disposer: Disposer) -> Token {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(token, disposer);
        self.live.fetch_add(1, Ordering::AcqRel);
        token
    }

    /// Runs and forgets the disposer registered under `token`.
    ///
    /// The live count drops only after the disposer finished, also when
    /// it panicked.
    fn reclaim(&self, token: Token) -> Result<()> {
        let Some((_, disposer)) = self.entries.remove(&token) else {
            return Err(TrieError::invariant(format!(
                "handle {token} reclaimed twice or never registered"
            )));
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(disposer));
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        outcome.map_err(|payload| {
            TrieError::invariant(format!(
                "disposer of handle {token} panicked: {}",
                panic_message(payload.as_ref())
            ))
        })
    }

    fn reclaim_logged(&self, token: Token) {
        if let Err(err) = self.reclaim(token) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(%err, %token, "reclamation failed");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::default)
}

fn queue() -> Option<&'static Sender<Notice>> {
    static QUEUE: OnceLock<Option<Sender<Notice>>> = OnceLock::new();
    QUEUE
        .get_or_init(|| {
            let (sender, receiver) = crossbeam_channel::unbounded();
            let name = config().reclaimer_thread_name.clone();
            match thread::Builder::new()
                .name(name)
                .spawn(move || run(registry(), receiver))
            {
                Ok(_) => Some(sender),
                Err(err) => {
                    tracing::error!(%err, "cannot spawn reclamation worker, reclaiming inline");
                    None
                }
            }
        })
        .as_ref()
}

fn run(registry: &Registry, notices: Receiver<Notice>) {
    tracing::debug!("reclamation worker started");
    for notice in notices.iter() {
        match notice {
            Notice::Unreachable(token) => registry.reclaim_logged(token),
            Notice::Flush(done) => {
                // The flushing thread may have given up waiting.
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("reclamation queue closed");
}

fn notify(token: Token) {
    match queue() {
        Some(queue) => {
            if let Err(err) = queue.send(Notice::Unreachable(token)) {
                tracing::warn!(%token, "reclamation worker is gone, reclaiming inline");
                if let Notice::Unreachable(token) = err.into_inner() {
                    registry().reclaim_logged(token);
                }
            }
        }
        None => registry().reclaim_logged(token),
    }
}

/// Registers `disposer` and returns the tracker whose drop schedules it.
pub fn track<F>(disposer: F) -> Tracker
where
    F: FnOnce() + Send + Sync + 'static,
{
    let token = registry().register(Box::new(disposer));
    // Start the worker with the first registration.
    let _ = queue();
    Tracker { token }
}

/// Schedules its disposer when dropped.
#[derive(Debug)]
pub struct Tracker {
    token: Token,
}

impl Tracker {
    pub fn token(&self) -> Token {
        self.token
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        notify(self.token);
    }
}

/// Number of tracked handles whose disposer has not completed yet.
pub fn live_handles() -> usize {
    registry().live.load(Ordering::Acquire)
}

/// Number of disposers that have run, successfully or not.
pub fn reclaimed() -> u64 {
    registry().reclaimed.load(Ordering::Relaxed)
}

/// Number of reclamations that failed.
pub fn failures() -> u64 {
    registry().failures.load(Ordering::Relaxed)
}

/// Blocks until every notice posted before this call has been processed.
///
/// Must not be called from inside a disposer.
pub fn flush() {
    let Some(queue) = queue() else {
        return;
    };
    let (done, wait) = crossbeam_channel::bounded(1);
    if queue.send(Notice::Flush(done)).is_ok() && wait.recv().is_err() {
        tracing::warn!("reclamation worker stopped before flushing");
    }
}
