//! Keyed, cancellable debouncing synchronized to a frame clock.
//!
//! A slider drag produces dozens of changes per second; rendering each one
//! would stack renders on top of each other. [`SmartDebounce`] collapses them:
//! each key has at most one pending invocation, and a new call replaces the
//! pending one (last write wins).
//!
//! ## Lifecycle of a call
//!
//! ```text
//! call(args) ──► [delay timer] ──► [next frame tick] ──► claim ──► run f(args)
//!       │                 ▲                                   ▲
//!       └── a newer call for the same key aborts this one ────┘ (until claimed)
//! ```
//!
//! Once a call has claimed its slot it runs to completion; cancelling the key
//! afterwards only affects later calls. A call that is cancelled before it
//! claims never runs, and its `on_cancel` hook fires.
//!
//! ## Backpressure
//!
//! At most `max_concurrent` keys may be pending at once. A call for a new key
//! beyond that is dropped with a warning and counted; it is not queued. A call
//! for a key that is already pending replaces it even at capacity, since the
//! pending count does not grow.
//!
//! All scheduling runs on the tokio runtime: calls must be made from inside
//! one.

use crate::config::DebounceConfig;
use crate::lock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Hook invoked when a pending call is superseded or cancelled.
pub type CancelHook = Arc<dyn Fn() + Send + Sync>;

/// Stand-in for the display refresh: ticks on fixed boundaries from its origin.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    origin: Instant,
    interval: Duration,
}

impl FrameClock {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            interval,
        }
    }

    /// A clock ticking `hz` times per second.
    pub fn from_rate(hz: u32) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / hz.max(1) as f64))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next tick boundary strictly after now.
    pub async fn next_frame(&self) {
        let step = self.interval.as_nanos();
        if step == 0 {
            tokio::task::yield_now().await;
            return;
        }
        let elapsed = Instant::now().saturating_duration_since(self.origin).as_nanos();
        let ticks = elapsed / step + 1;
        let offset = u64::try_from(ticks * step).unwrap_or(u64::MAX);
        sleep_until(self.origin + Duration::from_nanos(offset)).await;
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::from_rate(60)
    }
}

/// Per-call scheduling options.
#[derive(Clone)]
pub struct DebounceOptions {
    /// Wait for the next frame tick after the delay.
    pub use_animation_frame: bool,
    pub on_cancel: Option<CancelHook>,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            use_animation_frame: true,
            on_cancel: None,
        }
    }
}

impl std::fmt::Debug for DebounceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceOptions")
            .field("use_animation_frame", &self.use_animation_frame)
            .field("on_cancel", &self.on_cancel.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebounceStats {
    /// Every `call`, including dropped ones.
    pub total: u64,
    pub executed: u64,
    pub cancelled: u64,
    pub dropped: u64,
    pub pending: usize,
}

struct PendingCall {
    ticket: u64,
    handle: JoinHandle<()>,
    on_cancel: Option<CancelHook>,
}

struct Inner {
    max_concurrent: usize,
    clock: FrameClock,
    pending: Mutex<HashMap<String, PendingCall>>,
    next_ticket: AtomicU64,
    stats: Mutex<DebounceStats>,
}

impl Inner {
    /// Take ownership of the slot for `key` if `ticket` still holds it.
    fn claim(&self, key: &str, ticket: u64) -> bool {
        let mut pending = lock(&self.pending);
        if pending.get(key).map(|p| p.ticket) != Some(ticket) {
            return false;
        }
        pending.remove(key);
        lock(&self.stats).executed += 1;
        true
    }
}

/// The debounce scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SmartDebounce {
    inner: Arc<Inner>,
}

impl SmartDebounce {
    pub fn new(max_concurrent: usize, clock: FrameClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                clock,
                pending: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
                stats: Mutex::new(DebounceStats::default()),
            }),
        }
    }

    pub fn from_config(config: &DebounceConfig) -> Self {
        Self::new(config.max_concurrent, FrameClock::new(config.frame_interval()))
    }

    pub fn clock(&self) -> FrameClock {
        self.inner.clock
    }

    /// Debounce `f` under `key`: each call waits `delay`, then (optionally) the
    /// next frame tick, and runs only if no newer call replaced it.
    pub fn intelligent<A, F, Fut>(
        &self,
        key: impl Into<String>,
        f: F,
        delay: Duration,
        options: DebounceOptions,
    ) -> Debounced<A>
    where
        A: Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Debounced {
            scheduler: self.clone(),
            key: key.into(),
            f: Arc::new(move |args| Box::pin(f(args)) as BoxFuture),
            delay: Some(delay),
            options,
        }
    }

    /// Like [`intelligent`](Self::intelligent) without the delay timer: each
    /// call runs on the next frame tick, still replacing a pending call for
    /// the same key.
    pub fn immediate<A, F, Fut>(&self, key: impl Into<String>, f: F) -> Debounced<A>
    where
        A: Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Debounced {
            scheduler: self.clone(),
            key: key.into(),
            f: Arc::new(move |args| Box::pin(f(args)) as BoxFuture),
            delay: None,
            options: DebounceOptions::default(),
        }
    }

    /// Cancel the pending call for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = lock(&self.inner.pending).remove(key);
        match removed {
            Some(call) => {
                self.finish_cancel(key, call);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending call. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, PendingCall)> = lock(&self.inner.pending).drain().collect();
        let count = drained.len();
        for (key, call) in drained {
            self.finish_cancel(&key, call);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.inner.pending).contains_key(key)
    }

    pub fn stats(&self) -> DebounceStats {
        let mut stats = *lock(&self.inner.stats);
        stats.pending = self.pending_count();
        stats
    }

    /// Abort a call already removed from the pending map. Runs the hook
    /// outside the lock so it may call back into the scheduler.
    fn finish_cancel(&self, key: &str, call: PendingCall) {
        call.handle.abort();
        lock(&self.inner.stats).cancelled += 1;
        debug!(key, "debounced call cancelled");
        if let Some(hook) = call.on_cancel {
            hook();
        }
    }
}

impl Default for SmartDebounce {
    fn default() -> Self {
        Self::from_config(&DebounceConfig::default())
    }
}

/// A debounced function bound to a key. Cheap to clone.
pub struct Debounced<A> {
    scheduler: SmartDebounce,
    key: String,
    f: Arc<dyn Fn(A) -> BoxFuture + Send + Sync>,
    delay: Option<Duration>,
    options: DebounceOptions,
}

impl<A> Clone for Debounced<A> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            key: self.key.clone(),
            f: Arc::clone(&self.f),
            delay: self.delay,
            options: self.options.clone(),
        }
    }
}

impl<A: Send + 'static> Debounced<A> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Schedule a run with `args`, replacing any pending run for this key.
    ///
    /// Returns `false` when the call was dropped for backpressure.
    pub fn call(&self, args: A) -> bool {
        let inner = &self.scheduler.inner;
        lock(&inner.stats).total += 1;

        let mut pending = lock(&inner.pending);
        let superseded = pending.remove(&self.key);
        if superseded.is_none() && pending.len() >= inner.max_concurrent {
            drop(pending);
            lock(&inner.stats).dropped += 1;
            warn!(
                key = %self.key,
                limit = inner.max_concurrent,
                "too many pending operations, call dropped"
            );
            return false;
        }

        let ticket = inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let job = (self.f)(args);
        let task_inner = Arc::clone(inner);
        let key = self.key.clone();
        let delay = self.delay;
        let use_frame = self.options.use_animation_frame || delay.is_none();
        let handle = tokio::spawn(async move {
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            if use_frame {
                task_inner.clock.next_frame().await;
            }
            if task_inner.claim(&key, ticket) {
                job.await;
            }
        });
        pending.insert(
            self.key.clone(),
            PendingCall {
                ticket,
                handle,
                on_cancel: self.options.on_cancel.clone(),
            },
        );
        drop(pending);

        if let Some(previous) = superseded {
            self.scheduler.finish_cancel(&self.key, previous);
        }
        true
    }
}
