//! Fixed-size worker pool with per-job timeouts.
//!
//! ## Slot lifecycle
//!
//! ```text
//! Idle ──dispatch──► Busy ──response / timeout / fault──► Idle
//!   │                  │
//!   │                  └──restart──► Restarted ──spawned──► Idle
//!   │                                   │  spawn failed: retried on next dispatch
//!   └──────────shutdown──────────► Terminated
//! ```
//!
//! Jobs go to the least recently used idle slot; when every slot is busy the
//! least recently used busy slot takes a second job (the worker queues it).
//!
//! ## Responses
//!
//! A single demux task reads every worker's events and routes them by job id.
//! Progress messages call the job's progress callback; success and failure
//! resolve the job's oneshot and free its slot. Messages from a worker that
//! has since been replaced, or for jobs that already resolved (timed out,
//! cancelled), are ignored.
//!
//! ## Failures
//!
//! | Event | Effect |
//! |---|---|
//! | job timeout | job rejected with [`PoolError::Timeout`], slot freed, worker kept |
//! | failure response | job rejected with [`PoolError::Processing`] |
//! | worker fault | every job on the slot rejected with [`PoolError::Fault`] |
//! | dead inbox | job rejected, worker replaced immediately |
//!
//! Timeouts, failures and faults count against the slot; once a slot's error
//! count exceeds the restart threshold its worker is replaced and the count
//! reset. Jobs still on a slot when its worker is replaced count as failed.
//!
//! All methods that spawn (construction, restart) must run inside a tokio
//! runtime.

use super::protocol::{
    JobId, JobOptions, WorkerEvent, WorkerMessage, WorkerRequest, WorkerResponse,
};
use super::worker::{WorkerHandle, WorkerSpawner};
use crate::config::{WorkersConfig, effective_pool_size};
use crate::imaging::{ImageData, Operation};
use crate::lock;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("job {job_id} timed out after {after:?}")]
    Timeout { job_id: JobId, after: Duration },
    #[error("worker on slot {slot} faulted: {message}")]
    Fault { slot: usize, message: String },
    #[error("job {0} was cancelled")]
    Cancelled(JobId),
    #[error("worker failed to process job: {0}")]
    Processing(String),
    #[error("no worker available")]
    Unavailable,
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
}

/// Callback receiving the completed fraction of a job.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub size: usize,
    pub timeout: Duration,
    pub restart_threshold: u32,
}

impl PoolConfig {
    pub fn from_config(config: &WorkersConfig) -> Self {
        Self {
            size: effective_pool_size(config),
            timeout: config.timeout(),
            restart_threshold: config.restart_threshold,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_config(&WorkersConfig::default())
    }
}

#[derive(Clone, Default)]
pub struct DispatchOptions {
    /// Overrides the pool's default timeout.
    pub timeout: Option<Duration>,
    pub progress: Option<ProgressFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    Restarted,
    Terminated,
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: usize,
    pub worker_id: u64,
    pub state: SlotState,
    pub active_jobs: usize,
    pub jobs_completed: u64,
    pub error_count: u32,
    pub last_used: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub faults: u64,
    pub cancelled: u64,
    pub restarts: u64,
    /// Buffers moved into a worker without copying.
    pub transferred: u64,
    /// Buffers copied because they were shared or the worker cannot take ownership.
    pub copied: u64,
    pub active_jobs: usize,
}

struct Slot {
    handle: Option<Box<dyn WorkerHandle>>,
    worker_id: u64,
    state: SlotState,
    active_jobs: usize,
    jobs_completed: u64,
    error_count: u32,
    last_used: Option<Instant>,
}

impl Slot {
    fn info(&self, slot: usize) -> SlotInfo {
        SlotInfo {
            slot,
            worker_id: self.worker_id,
            state: self.state,
            active_jobs: self.active_jobs,
            jobs_completed: self.jobs_completed,
            error_count: self.error_count,
            last_used: self.last_used,
        }
    }

    fn is_available(&self) -> bool {
        self.handle.is_some() && matches!(self.state, SlotState::Idle | SlotState::Busy)
    }

    fn release_one(&mut self) {
        self.active_jobs = self.active_jobs.saturating_sub(1);
        if self.active_jobs == 0 && self.state == SlotState::Busy {
            self.state = SlotState::Idle;
        }
    }
}

struct PendingJob {
    slot: usize,
    responder: oneshot::Sender<Result<ImageData, PoolError>>,
    progress: Option<ProgressFn>,
}

struct PoolState {
    slots: Vec<Slot>,
    jobs: HashMap<JobId, PendingJob>,
    next_job_id: JobId,
    next_worker_id: u64,
    stats: PoolStats,
    shut_down: bool,
}

struct PoolShared {
    config: PoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    events: UnboundedSender<WorkerEvent>,
    state: Mutex<PoolState>,
}

/// A fixed set of isolated workers. See the module docs for the protocol.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    demux: JoinHandle<()>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, spawner: Arc<dyn WorkerSpawner>) -> Result<Self, PoolError> {
        let (events, rx) = unbounded_channel();
        let size = config.size.max(1);
        let mut slots = Vec::with_capacity(size);
        for slot in 0..size {
            let worker_id = slot as u64;
            let handle = spawner.spawn(slot, worker_id, events.clone())?;
            slots.push(Slot {
                handle: Some(handle),
                worker_id,
                state: SlotState::Idle,
                active_jobs: 0,
                jobs_completed: 0,
                error_count: 0,
                last_used: None,
            });
        }
        let shared = Arc::new(PoolShared {
            config,
            spawner,
            events,
            state: Mutex::new(PoolState {
                slots,
                jobs: HashMap::new(),
                next_job_id: 1,
                next_worker_id: size as u64,
                stats: PoolStats {
                    size,
                    ..PoolStats::default()
                },
                shut_down: false,
            }),
        });
        let demux = tokio::spawn(demux_loop(Arc::clone(&shared), rx));
        info!(size, "worker pool started");
        Ok(Self { shared, demux })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Process `image` through `operations` on a worker.
    ///
    /// Pass an `Arc<ImageData>` you do not keep (or a plain `ImageData`) to
    /// let the buffer move into the worker without a copy.
    pub async fn dispatch(
        &self,
        image: impl Into<Arc<ImageData>>,
        operations: Vec<Operation>,
        options: DispatchOptions,
    ) -> Result<ImageData, PoolError> {
        let timeout = options.timeout.unwrap_or(self.shared.config.timeout);
        let (tx, mut rx) = oneshot::channel();
        let job_id = self.shared.submit(image.into(), operations, options.progress, tx)?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Cancelled(job_id)),
            Err(_) => {
                if self.shared.expire(job_id, timeout) {
                    return Err(PoolError::Timeout {
                        job_id,
                        after: timeout,
                    });
                }
                // Resolved while the timer fired.
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(PoolError::Cancelled(job_id)),
                }
            }
        }
    }

    /// Replace the worker in `slot`, rejecting its in-flight jobs.
    pub fn restart(&self, slot: usize) -> Result<(), PoolError> {
        let mut state = lock(&self.shared.state);
        if slot >= state.slots.len() || state.shut_down {
            return Err(PoolError::Unavailable);
        }
        self.shared.restart_locked(&mut state, slot, "worker restarted")
    }

    /// Reject every in-flight job and free all slots. Workers keep running.
    pub fn cancel_all(&self) -> usize {
        let mut state = lock(&self.shared.state);
        let jobs: Vec<(JobId, PendingJob)> = state.jobs.drain().collect();
        let count = jobs.len();
        for (id, job) in jobs {
            let _ = job.responder.send(Err(PoolError::Cancelled(id)));
        }
        for slot in state.slots.iter_mut() {
            slot.active_jobs = 0;
            if slot.state == SlotState::Busy {
                slot.state = SlotState::Idle;
            }
        }
        state.stats.cancelled += count as u64;
        if count > 0 {
            info!(count, "cancelled in-flight jobs");
        }
        count
    }

    /// Cancel everything and terminate every worker. The pool rejects all
    /// further dispatches.
    pub fn shutdown(&self) {
        self.cancel_all();
        let mut state = lock(&self.shared.state);
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        for slot in state.slots.iter_mut() {
            if let Some(mut handle) = slot.handle.take() {
                handle.terminate();
            }
            slot.state = SlotState::Terminated;
        }
        info!("worker pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.shared.state).shut_down
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.shared.state);
        PoolStats {
            active_jobs: state.jobs.len(),
            ..state.stats
        }
    }

    pub fn slots(&self) -> Vec<SlotInfo> {
        let state = lock(&self.shared.state);
        state
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| s.info(i))
            .collect()
    }

    pub fn is_idle(&self, slot: usize) -> bool {
        lock(&self.shared.state)
            .slots
            .get(slot)
            .is_some_and(|s| s.state == SlotState::Idle && s.active_jobs == 0)
    }

    pub fn size(&self) -> usize {
        lock(&self.shared.state).slots.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        self.demux.abort();
    }
}

impl PoolShared {
    fn submit(
        &self,
        image: Arc<ImageData>,
        operations: Vec<Operation>,
        progress: Option<ProgressFn>,
        responder: oneshot::Sender<Result<ImageData, PoolError>>,
    ) -> Result<JobId, PoolError> {
        let mut state = lock(&self.state);
        if state.shut_down {
            return Err(PoolError::Unavailable);
        }
        self.revive_locked(&mut state);
        let slot = pick_slot(&state.slots).ok_or(PoolError::Unavailable)?;

        let job_id = state.next_job_id;
        state.next_job_id += 1;

        let transfer = state.slots[slot]
            .handle
            .as_ref()
            .is_some_and(|h| h.supports_transfer());
        let buffer = if transfer {
            match Arc::try_unwrap(image) {
                Ok(owned) => {
                    state.stats.transferred += 1;
                    owned
                }
                Err(shared) => {
                    state.stats.copied += 1;
                    (*shared).clone()
                }
            }
        } else {
            state.stats.copied += 1;
            (*image).clone()
        };

        let request = WorkerRequest::process(
            job_id,
            buffer,
            operations,
            JobOptions {
                report_progress: progress.is_some(),
            },
        );

        let posted = match state.slots[slot].handle.as_mut() {
            Some(handle) => handle.post(request),
            None => Err("no worker".to_string()),
        };
        if let Err(reason) = posted {
            warn!(slot, job = job_id, %reason, "worker inbox dead, replacing worker");
            if let Err(e) = self.restart_locked(&mut state, slot, "worker inbox dead") {
                warn!(slot, error = %e, "worker replacement failed");
            }
            return Err(PoolError::Fault {
                slot,
                message: reason,
            });
        }

        let s = &mut state.slots[slot];
        s.state = SlotState::Busy;
        s.active_jobs += 1;
        s.last_used = Some(Instant::now());
        state.jobs.insert(
            job_id,
            PendingJob {
                slot,
                responder,
                progress,
            },
        );
        state.stats.dispatched += 1;
        debug!(job = job_id, slot, "job dispatched");
        Ok(job_id)
    }

    /// Reject a job that ran out of time. Returns false if it already resolved.
    fn expire(&self, job_id: JobId, after: Duration) -> bool {
        let mut state = lock(&self.state);
        let Some(job) = state.jobs.remove(&job_id) else {
            return false;
        };
        warn!(job = job_id, slot = job.slot, ?after, "job timed out");
        state.stats.timeouts += 1;
        let slot = &mut state.slots[job.slot];
        slot.release_one();
        slot.error_count += 1;
        self.maybe_restart(&mut state, job.slot);
        true
    }

    fn handle_event(&self, event: WorkerEvent) {
        let mut state = lock(&self.state);
        match state.slots.get(event.slot) {
            Some(slot) if slot.worker_id == event.worker_id => {}
            _ => {
                debug!(slot = event.slot, worker_id = event.worker_id, "ignoring message from replaced worker");
                return;
            }
        }

        match event.message {
            WorkerMessage::Response(WorkerResponse::Progress { id, result, .. }) => {
                let callback = state
                    .jobs
                    .get(&id)
                    .filter(|job| job.slot == event.slot)
                    .and_then(|job| job.progress.clone());
                drop(state);
                if let Some(callback) = callback {
                    callback(result.clamp(0.0, 1.0));
                }
            }
            WorkerMessage::Response(WorkerResponse::Success { id, result }) => {
                let Some(job) = take_job(&mut state, id, event.slot) else {
                    return;
                };
                let slot = &mut state.slots[event.slot];
                slot.release_one();
                slot.jobs_completed += 1;
                state.stats.completed += 1;
                debug!(job = id, slot = event.slot, "job completed");
                let _ = job.responder.send(Ok(result));
            }
            WorkerMessage::Response(WorkerResponse::Failure { id, error }) => {
                let Some(job) = take_job(&mut state, id, event.slot) else {
                    return;
                };
                let slot = &mut state.slots[event.slot];
                slot.release_one();
                slot.error_count += 1;
                state.stats.failed += 1;
                warn!(job = id, slot = event.slot, %error, "job failed");
                let _ = job.responder.send(Err(PoolError::Processing(error)));
                self.maybe_restart(&mut state, event.slot);
            }
            WorkerMessage::Fault(message) => {
                warn!(slot = event.slot, %message, "worker fault");
                state.stats.faults += 1;
                reject_slot_jobs(&mut state, event.slot, &message);
                let slot = &mut state.slots[event.slot];
                slot.error_count += 1;
                slot.active_jobs = 0;
                if slot.state == SlotState::Busy {
                    slot.state = SlotState::Idle;
                }
                self.maybe_restart(&mut state, event.slot);
            }
        }
    }

    fn maybe_restart(&self, state: &mut PoolState, slot: usize) {
        if state.shut_down || state.slots[slot].error_count <= self.config.restart_threshold {
            return;
        }
        if let Err(e) = self.restart_locked(state, slot, "error threshold exceeded") {
            warn!(slot, error = %e, "worker replacement failed");
        }
    }

    fn restart_locked(
        &self,
        state: &mut PoolState,
        slot: usize,
        reason: &str,
    ) -> Result<(), PoolError> {
        let rejected = reject_slot_jobs(state, slot, reason);
        state.stats.failed += rejected as u64;
        let worker_id = state.next_worker_id;
        state.next_worker_id += 1;

        let s = &mut state.slots[slot];
        if let Some(mut handle) = s.handle.take() {
            handle.terminate();
        }
        s.state = SlotState::Restarted;
        s.active_jobs = 0;
        // Replies from the old worker no longer match this id.
        s.worker_id = worker_id;

        let handle = self.spawner.spawn(slot, worker_id, self.events.clone())?;
        let s = &mut state.slots[slot];
        s.handle = Some(handle);
        s.state = SlotState::Idle;
        s.error_count = 0;
        s.jobs_completed = 0;
        state.stats.restarts += 1;
        info!(slot, worker_id, reason, "worker restarted");
        Ok(())
    }

    /// Retry slots whose replacement worker failed to spawn.
    fn revive_locked(&self, state: &mut PoolState) {
        for slot in 0..state.slots.len() {
            let s = &state.slots[slot];
            if s.handle.is_some() || s.state != SlotState::Restarted {
                continue;
            }
            let worker_id = s.worker_id;
            match self.spawner.spawn(slot, worker_id, self.events.clone()) {
                Ok(handle) => {
                    let s = &mut state.slots[slot];
                    s.handle = Some(handle);
                    s.state = SlotState::Idle;
                    s.error_count = 0;
                    s.jobs_completed = 0;
                    state.stats.restarts += 1;
                    info!(slot, worker_id, "worker revived");
                }
                Err(e) => warn!(slot, error = %e, "worker still unavailable"),
            }
        }
    }
}

/// Remove a job if it belongs to `slot`.
fn take_job(state: &mut PoolState, id: JobId, slot: usize) -> Option<PendingJob> {
    match state.jobs.get(&id) {
        Some(job) if job.slot == slot => state.jobs.remove(&id),
        Some(_) => None,
        None => {
            debug!(job = id, "ignoring response for unknown job");
            None
        }
    }
}

/// Reject every job on `slot` with a fault. Returns how many were rejected.
fn reject_slot_jobs(state: &mut PoolState, slot: usize, message: &str) -> usize {
    let ids: Vec<JobId> = state
        .jobs
        .iter()
        .filter(|(_, job)| job.slot == slot)
        .map(|(id, _)| *id)
        .collect();
    for &id in &ids {
        if let Some(job) = state.jobs.remove(&id) {
            let _ = job.responder.send(Err(PoolError::Fault {
                slot,
                message: message.to_string(),
            }));
        }
    }
    ids.len()
}

/// Least recently used idle slot, else least recently used busy slot.
fn pick_slot(slots: &[Slot]) -> Option<usize> {
    let available = || slots.iter().enumerate().filter(|(_, s)| s.is_available());
    available()
        .filter(|(_, s)| s.active_jobs == 0)
        .min_by_key(|(_, s)| s.last_used)
        .or_else(|| available().min_by_key(|(_, s)| s.last_used))
        .map(|(i, _)| i)
}

async fn demux_loop(shared: Arc<PoolShared>, mut events: UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        shared.handle_event(event);
    }
}
