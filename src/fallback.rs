//! Pixel processing on the calling task, for when workers are unavailable.
//!
//! Runs the same [`apply_operation`] the workers run, on a private copy of the
//! source pixels. Long runs (more than `chunk_threshold` operations) apply one
//! operation per frame tick so other scheduled work (debounce timers, loading
//! timeouts) keeps moving between steps. Short runs do everything in one pass
//! and then yield once before returning.
//!
//! A failing operation is logged, counted and skipped. Only a malformed source
//! buffer fails the whole run.
//!
//! The orchestrator holds its fallback as a [`FallbackExecutor`];
//! [`FallbackProcessor`] is the only production implementation.

use crate::config::FallbackConfig;
use crate::debounce::FrameClock;
use crate::imaging::{
    ApplyContext, ImageData, Operation, Surface, SurfaceError, apply_operation, apply_operations,
    calculate_progress,
};
use crate::lock;
use crate::workers::ProgressFn;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tracing::{debug, warn};

pub type FallbackFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ImageData, SurfaceError>> + Send + 'a>>;

/// Processes operations on the calling task when no worker can.
pub trait FallbackExecutor: Send + Sync {
    fn process<'a>(
        &'a self,
        image: &'a ImageData,
        operations: &'a [Operation],
        options: FallbackOptions,
    ) -> FallbackFuture<'a>;

    fn stats(&self) -> FallbackStats;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackStats {
    pub runs: u64,
    /// Runs that yielded to the frame clock between operations.
    pub chunked_runs: u64,
    pub operations_applied: u64,
    pub operations_failed: u64,
}

#[derive(Clone)]
pub struct FallbackOptions {
    pub context: ApplyContext,
    pub progress: Option<ProgressFn>,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            context: ApplyContext::main_thread(None),
            progress: None,
        }
    }
}

#[derive(Debug)]
pub struct FallbackProcessor {
    chunk_threshold: usize,
    clock: FrameClock,
    stats: Mutex<FallbackStats>,
}

impl FallbackProcessor {
    pub fn new(chunk_threshold: usize, clock: FrameClock) -> Self {
        Self {
            chunk_threshold,
            clock,
            stats: Mutex::new(FallbackStats::default()),
        }
    }

    pub fn from_config(config: &FallbackConfig, clock: FrameClock) -> Self {
        Self::new(config.chunk_threshold, clock)
    }

    pub fn chunk_threshold(&self) -> usize {
        self.chunk_threshold
    }

    /// Apply `operations` to a copy of `image` and return the result.
    pub async fn process_in_main_thread(
        &self,
        image: &ImageData,
        operations: &[Operation],
        options: FallbackOptions,
    ) -> Result<ImageData, SurfaceError> {
        let mut surface = Surface::new(image.clone())?;
        let total = operations.len();
        let chunked = total > self.chunk_threshold;
        let report = |fraction: f32| {
            if let Some(progress) = &options.progress {
                progress(fraction);
            }
        };

        let (applied, failed) = if chunked {
            let mut applied = 0u64;
            let mut failed = 0u64;
            for (i, op) in operations.iter().enumerate() {
                match apply_operation(&mut surface, op, &options.context) {
                    Ok(()) => applied += 1,
                    Err(e) => {
                        warn!(operation = %op.label(), error = %e, "fallback operation skipped");
                        failed += 1;
                    }
                }
                report(calculate_progress(i + 1, total));
                self.clock.next_frame().await;
            }
            (applied, failed)
        } else {
            let summary = apply_operations(&mut surface, operations, &options.context, report);
            tokio::task::yield_now().await;
            (summary.applied as u64, summary.failed.len() as u64)
        };

        {
            let mut stats = lock(&self.stats);
            stats.runs += 1;
            stats.chunked_runs += chunked as u64;
            stats.operations_applied += applied;
            stats.operations_failed += failed;
        }
        debug!(operations = total, chunked, failed, "fallback run finished");
        Ok(surface.into_image_data())
    }

    pub fn stats(&self) -> FallbackStats {
        *lock(&self.stats)
    }
}

impl FallbackExecutor for FallbackProcessor {
    fn process<'a>(
        &'a self,
        image: &'a ImageData,
        operations: &'a [Operation],
        options: FallbackOptions,
    ) -> FallbackFuture<'a> {
        Box::pin(self.process_in_main_thread(image, operations, options))
    }

    fn stats(&self) -> FallbackStats {
        FallbackProcessor::stats(self)
    }
}

impl Default for FallbackProcessor {
    fn default() -> Self {
        Self::from_config(&FallbackConfig::default(), FrameClock::default())
    }
}
