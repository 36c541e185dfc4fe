//! Reply throttling per (sender, recipient) pair.
//!
//! `RateLimiter` is a cheap cloneable handle used by every session. Checking
//! and marking a pair happens under one short lock on the throttle set; the
//! newly throttled key is then handed over a channel to the single
//! `ExpiryWorker`, which owns the expiry queue and is the only place keys are
//! ever removed.

mod queue;

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use self::queue::ExpiryQueue;

/// Default cooldown between two replies to the same pair: 24 hours.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Registrations the worker may lag behind before callers wait on it.
const REGISTRATION_BACKLOG: usize = 64;

/// Fixed-size digest of an ordered address pair.
///
/// Addresses are hashed verbatim. The first address is length-prefixed so no
/// split of the same bytes between `from` and `to` yields the same key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateKey([u8; 32]);

impl RateKey {
    pub fn new(from: &str, to: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((from.len() as u64).to_be_bytes());
        hasher.update(from.as_bytes());
        hasher.update(to.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RateKey(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…)")
    }
}

type ThrottleSet = Arc<Mutex<HashSet<RateKey>>>;

fn lock(track: &ThrottleSet) -> MutexGuard<'_, HashSet<RateKey>> {
    // The set holds plain keys; a panic elsewhere cannot leave it inconsistent.
    track.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for checking and consuming reply permission.
#[derive(Clone)]
pub struct RateLimiter {
    track: ThrottleSet,
    register: mpsc::Sender<RateKey>,
}

impl RateLimiter {
    /// Create a limiter with the given cooldown window.
    ///
    /// The returned worker must be running (see [`spawn_expiry_worker`])
    /// for throttled pairs to ever become permitted again.
    pub fn new(window: Duration) -> (Self, ExpiryWorker) {
        let track: ThrottleSet = Arc::default();
        let (register, incoming) = mpsc::channel(REGISTRATION_BACKLOG);

        let limiter = Self {
            track: Arc::clone(&track),
            register,
        };
        let worker = ExpiryWorker {
            window,
            track,
            incoming,
            queue: ExpiryQueue::new(),
        };
        (limiter, worker)
    }

    /// Returns `true` if a reply from `from` to `to` is permitted, and
    /// consumes that permission for the rest of the window. Returns `false`
    /// while the pair is throttled; repeated calls never extend the window.
    pub async fn ratelimit(&self, from: &str, to: &str) -> bool {
        let key = RateKey::new(from, to);

        if lock(&self.track).contains(&key) {
            return false;
        }

        // Reserve queue space before marking the pair. From here to the end
        // there is no await, so a dropped caller never leaves a key in the
        // throttle set that the worker does not know about.
        let permit = self.register.reserve().await;

        if !lock(&self.track).insert(key) {
            return false;
        }

        match permit {
            Ok(permit) => permit.send(key),
            Err(_) => error!(?key, "Expiry worker is gone, pair stays throttled until restart"),
        }

        true
    }

    /// Whether the pair is currently throttled, without consuming anything.
    pub fn is_throttled(&self, from: &str, to: &str) -> bool {
        lock(&self.track).contains(&RateKey::new(from, to))
    }

    /// Number of pairs currently throttled.
    pub fn throttled(&self) -> usize {
        lock(&self.track).len()
    }
}

/// Sole owner of the expiry queue.
pub struct ExpiryWorker {
    window: Duration,
    track: ThrottleSet,
    incoming: mpsc::Receiver<RateKey>,
    queue: ExpiryQueue,
}

impl ExpiryWorker {
    /// Queue newly throttled keys and evict them once their window passes.
    ///
    /// Returns as soon as `shutdown` flips to `true` (or its sender is
    /// dropped), discarding whatever is still queued.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(window = ?self.window, "Rate limiter expiry worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let due = self.queue.next_expiry();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                key = self.incoming.recv() => match key {
                    Some(key) => self.enqueue(key),
                    None => {
                        debug!("All rate limiter handles dropped");
                        break;
                    }
                },
                _ = sleep_until_due(due) => self.evict_expired(Instant::now()),
            }
        }

        info!(pending = self.queue.len(), "Rate limiter expiry worker stopped");
    }

    fn enqueue(&mut self, key: RateKey) {
        self.queue.push(key, Instant::now() + self.window);
        debug!(?key, queued = self.queue.len(), "Pair throttled");
    }

    fn evict_expired(&mut self, now: Instant) {
        let mut track = lock(&self.track);
        let mut evicted = 0usize;
        while let Some(key) = self.queue.pop_expired(now) {
            track.remove(&key);
            evicted += 1;
        }
        drop(track);

        if evicted > 0 {
            debug!(evicted, queued = self.queue.len(), "Throttle window expired");
        }
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Spawn the expiry worker for the lifetime of the process.
pub fn spawn_expiry_worker(
    worker: ExpiryWorker,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(worker.run(shutdown))
}
