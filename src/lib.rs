//! # Simple Edit
//!
//! The core of a photo editor: load an image, adjust filters, add watermarks,
//! rotate and resize, preview the result as the user drags sliders, and export.
//!
//! # Architecture: The Preview Pipeline
//!
//! Every edit flows through the same loop:
//!
//! ```text
//! edit ──► SmartDebounce ──► FilterCache "changed?" ──┬─► direct (calling task)
//!                                                     ├─► WorkerPool (threads)
//!                                                     └─► FallbackProcessor
//!                                ──► commit frame ──► mark applied ──► hide loading
//! ```
//!
//! Slider drags produce far more edits than a machine can render, so edits are
//! coalesced per key and synchronized to a frame clock. A render that would
//! reproduce what is already on screen is skipped. Cheap renders run inline;
//! expensive ones go to a worker thread, and any worker failure falls back to
//! processing on the calling task.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`imaging`] | Pixel buffers, filter kernels, watermarks, the shared operation dispatcher |
//! | [`cache`] | Stable state hashing, last-applied tracking, bounded snapshot store |
//! | [`debounce`] | Keyed, cancellable, frame-synchronized debouncing |
//! | [`workers`] | Worker wire protocol, thread workers, the pool with timeouts and restarts |
//! | [`fallback`] | The same operations on the calling task, yielding between steps |
//! | [`loading`] | Named loading indicators, control disabling, safety timeouts |
//! | [`preview`] | The orchestrator that owns all of the above |
//! | [`host`] | Traits for the UI collaborators the core calls into |
//! | [`config`] | `simple-edit.toml` loading, merging, validation |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## One Operation Dispatcher
//!
//! Worker threads, the fallback, and the direct path all call
//! [`imaging::apply_operation`]. A filter value produces the same pixels no
//! matter which path ran it, and a fix to a kernel fixes every path at once.
//!
//! ## Injected Services, No Globals
//!
//! The orchestrator constructs and owns its cache, debouncer, pool, fallback,
//! and loading coordinator. UI collaborators (notifications, control panels,
//! filter forms) are optional trait objects handed to the builder; a missing
//! one is simply not called.
//!
//! ## Futures Instead of Callbacks
//!
//! Each pool job resolves a `tokio::sync::oneshot`, raced against
//! `tokio::time::timeout`. Debounce timers and the frame clock are tokio
//! timers, so tests drive every timing path deterministically with a paused
//! clock.
//!
//! ## Moving Buffers Into Workers
//!
//! Pixel buffers are handed to the pool as `Arc<ImageData>`. When the caller
//! holds the only reference, the buffer moves into the worker without a copy;
//! otherwise it is copied. Workers never share memory with the display frame.

pub mod cache;
pub mod config;
pub mod debounce;
pub mod fallback;
pub mod host;
pub mod imaging;
pub mod loading;
pub mod output;
pub mod preview;
pub mod workers;

#[cfg(test)]
pub(crate) mod test_helpers;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every guarded structure here stays consistent between statements, so a
/// panic elsewhere never leaves it half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
