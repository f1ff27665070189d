//! Shared test utilities for the simple-edit test suite.
//!
//! Provides scripted workers for the pool, a failing fallback, recording host
//! collaborators, and image builders.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let pool = WorkerPool::new(config, Arc::new(SilentSpawner)).unwrap();
//! let err = pool.dispatch(solid(4, 4, [255, 0, 0, 255]), vec![], Default::default()).await;
//! assert!(matches!(err, Err(PoolError::Timeout { .. })));
//! ```

use crate::fallback::{FallbackExecutor, FallbackFuture, FallbackOptions, FallbackStats};
use crate::host::{ControlPanel, FilterSource, Notifier};
use crate::imaging::{FilterKind, FilterState, ImageData, Operation, SurfaceError};
use crate::workers::{
    JobId, WorkerEvent, WorkerHandle, WorkerMessage, WorkerRequest, WorkerResponse, WorkerSpawner,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

// =========================================================================
// Image builders
// =========================================================================

pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> ImageData {
    ImageData::solid(width, height, rgba)
}

// =========================================================================
// Scripted workers
// =========================================================================

/// Accepts every request and never answers.
pub struct SilentHandle;

impl WorkerHandle for SilentHandle {
    fn post(&mut self, _request: WorkerRequest) -> Result<(), String> {
        Ok(())
    }

    fn terminate(&mut self) {}
}

pub struct SilentSpawner;

impl WorkerSpawner for SilentSpawner {
    fn spawn(
        &self,
        _slot: usize,
        _worker_id: u64,
        _events: UnboundedSender<WorkerEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        Ok(Box::new(SilentHandle))
    }
}

#[derive(Clone, Copy)]
enum Reply {
    Echo,
    Reject,
    Fault,
}

/// Answers each request synchronously from inside `post`.
struct ScriptedHandle {
    slot: usize,
    worker_id: u64,
    events: Option<UnboundedSender<WorkerEvent>>,
    reply: Reply,
    transfer: bool,
}

impl WorkerHandle for ScriptedHandle {
    fn post(&mut self, request: WorkerRequest) -> Result<(), String> {
        let events = self.events.as_ref().ok_or("terminated")?;
        let id = request.id;
        let message = match self.reply {
            Reply::Echo => WorkerMessage::Response(WorkerResponse::Success {
                id,
                result: request.data.image_data,
            }),
            Reply::Reject => WorkerMessage::Response(WorkerResponse::Failure {
                id,
                error: "rejected".to_string(),
            }),
            Reply::Fault => WorkerMessage::Fault("scripted fault".to_string()),
        };
        events
            .send(WorkerEvent {
                slot: self.slot,
                worker_id: self.worker_id,
                message,
            })
            .map_err(|_| "pool gone".to_string())
    }

    fn supports_transfer(&self) -> bool {
        self.transfer
    }

    fn terminate(&mut self) {
        self.events = None;
    }
}

fn scripted(
    slot: usize,
    worker_id: u64,
    events: UnboundedSender<WorkerEvent>,
    reply: Reply,
    transfer: bool,
) -> io::Result<Box<dyn WorkerHandle>> {
    Ok(Box::new(ScriptedHandle {
        slot,
        worker_id,
        events: Some(events),
        reply,
        transfer,
    }))
}

/// Returns the input image unchanged.
pub struct EchoSpawner {
    pub transfer: bool,
}

impl Default for EchoSpawner {
    fn default() -> Self {
        Self { transfer: true }
    }
}

impl WorkerSpawner for EchoSpawner {
    fn spawn(
        &self,
        slot: usize,
        worker_id: u64,
        events: UnboundedSender<WorkerEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        scripted(slot, worker_id, events, Reply::Echo, self.transfer)
    }
}

/// Answers every job with a failure response.
pub struct RejectingSpawner;

impl WorkerSpawner for RejectingSpawner {
    fn spawn(
        &self,
        slot: usize,
        worker_id: u64,
        events: UnboundedSender<WorkerEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        scripted(slot, worker_id, events, Reply::Reject, true)
    }
}

/// Faults on every job.
pub struct FaultySpawner;

impl WorkerSpawner for FaultySpawner {
    fn spawn(
        &self,
        slot: usize,
        worker_id: u64,
        events: UnboundedSender<WorkerEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        scripted(slot, worker_id, events, Reply::Fault, true)
    }
}

/// Workers that record what they are given and answer only when the test
/// says so, in whatever order it likes.
#[derive(Default)]
pub struct ManualSpawner {
    workers: Mutex<HashMap<usize, ManualWorker>>,
    fail: AtomicBool,
}

struct ManualWorker {
    worker_id: u64,
    events: UnboundedSender<WorkerEvent>,
    posted: Arc<Mutex<Vec<JobId>>>,
}

impl ManualSpawner {
    /// While set, every spawn fails.
    pub fn fail_spawns(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Job ids posted to the current worker of `slot`.
    pub fn posted(&self, slot: usize) -> Vec<JobId> {
        self.workers
            .lock()
            .unwrap()
            .get(&slot)
            .map(|w| w.posted.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Send `message` as the current worker of `slot`.
    pub fn send(&self, slot: usize, message: WorkerMessage) {
        let workers = self.workers.lock().unwrap();
        let worker = &workers[&slot];
        worker
            .events
            .send(WorkerEvent {
                slot,
                worker_id: worker.worker_id,
                message,
            })
            .unwrap();
    }

    pub fn succeed(&self, slot: usize, id: JobId, result: ImageData) {
        self.send(
            slot,
            WorkerMessage::Response(WorkerResponse::Success { id, result }),
        );
    }
}

struct ManualHandle {
    posted: Arc<Mutex<Vec<JobId>>>,
}

impl WorkerHandle for ManualHandle {
    fn post(&mut self, request: WorkerRequest) -> Result<(), String> {
        self.posted.lock().unwrap().push(request.id);
        Ok(())
    }

    fn terminate(&mut self) {}
}

impl WorkerSpawner for ManualSpawner {
    fn spawn(
        &self,
        slot: usize,
        worker_id: u64,
        events: UnboundedSender<WorkerEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::other("spawning disabled"));
        }
        let posted = Arc::new(Mutex::new(Vec::new()));
        self.workers.lock().unwrap().insert(
            slot,
            ManualWorker {
                worker_id,
                events,
                posted: Arc::clone(&posted),
            },
        );
        Ok(Box::new(ManualHandle { posted }))
    }
}

// =========================================================================
// Fallback
// =========================================================================

/// A fallback that fails every run, as it does on a malformed buffer.
pub struct FailingFallback;

impl FallbackExecutor for FailingFallback {
    fn process<'a>(
        &'a self,
        _image: &'a ImageData,
        _operations: &'a [Operation],
        _options: FallbackOptions,
    ) -> FallbackFuture<'a> {
        Box::pin(async {
            Err(SurfaceError::Empty {
                width: 0,
                height: 0,
            })
        })
    }

    fn stats(&self) -> FallbackStats {
        FallbackStats::default()
    }
}

// =========================================================================
// Host collaborators
// =========================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    warnings: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    successes: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn successes(&self) -> Vec<String> {
        self.successes.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn warning(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn success(&self, message: &str) {
        self.successes.lock().unwrap().push(message.to_string());
    }
}

#[derive(Default)]
pub struct RecordingControls {
    calls: Mutex<Vec<(FilterKind, bool)>>,
}

impl RecordingControls {
    pub fn calls(&self) -> Vec<(FilterKind, bool)> {
        self.calls.lock().unwrap().clone()
    }

    /// Last state set for `kind`; controls start enabled.
    pub fn is_enabled(&self, kind: FilterKind) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| *k == kind)
            .is_none_or(|(_, enabled)| *enabled)
    }
}

impl ControlPanel for RecordingControls {
    fn set_control_enabled(&self, filter: FilterKind, enabled: bool) {
        self.calls.lock().unwrap().push((filter, enabled));
    }
}

/// A form that always reports the same values.
pub struct StaticFilterSource(pub FilterState);

impl FilterSource for StaticFilterSource {
    fn current_filters(&self) -> FilterState {
        self.0
    }
}
