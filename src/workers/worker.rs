//! Worker handles and the thread-backed worker.
//!
//! The pool only talks to workers through [`WorkerHandle`] (post a request,
//! terminate) and hears back through a shared event channel. How a worker is
//! created is behind [`WorkerSpawner`]; production uses [`ThreadSpawner`],
//! tests plug in spawners whose workers never answer or fail on purpose.
//!
//! A thread worker owns nothing but its inbox. Each request's pixels are moved
//! in, processed on a private [`Surface`], and moved back out in the response.
//! A panic while processing is caught and reported as a fault; the thread keeps
//! serving its inbox.

use super::protocol::{WorkerEvent, WorkerMessage, WorkerRequest, WorkerResponse};
use crate::imaging::{ApplyContext, Surface, apply_operations};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// The pool's side of one live worker.
pub trait WorkerHandle: Send {
    /// Hand a request to the worker. Fails when the worker is gone.
    fn post(&mut self, request: WorkerRequest) -> Result<(), String>;

    /// Whether buffers are moved into the worker rather than copied.
    fn supports_transfer(&self) -> bool {
        true
    }

    /// Stop the worker. Further posts fail.
    fn terminate(&mut self);
}

/// Creates workers for pool slots.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        slot: usize,
        worker_id: u64,
        events: UnboundedSender<WorkerEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>>;
}

/// Spawns one OS thread per worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl WorkerSpawner for ThreadSpawner {
    fn spawn(
        &self,
        slot: usize,
        worker_id: u64,
        events: UnboundedSender<WorkerEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        let (tx, rx) = mpsc::channel::<WorkerRequest>();
        let join = thread::Builder::new()
            .name(format!("simple-edit-worker-{slot}"))
            .spawn(move || run_worker(slot, worker_id, rx, events))?;
        debug!(slot, worker_id, "worker thread started");
        Ok(Box::new(ThreadWorker {
            inbox: Some(tx),
            join: Some(join),
        }))
    }
}

struct ThreadWorker {
    inbox: Option<mpsc::Sender<WorkerRequest>>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle for ThreadWorker {
    fn post(&mut self, request: WorkerRequest) -> Result<(), String> {
        let inbox = self.inbox.as_ref().ok_or("worker terminated")?;
        inbox
            .send(request)
            .map_err(|_| "worker inbox closed".to_string())
    }

    fn terminate(&mut self) {
        // Closing the inbox ends the thread's receive loop after the current job.
        self.inbox = None;
        self.join = None;
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_worker(
    slot: usize,
    worker_id: u64,
    inbox: mpsc::Receiver<WorkerRequest>,
    events: UnboundedSender<WorkerEvent>,
) {
    let send = |message: WorkerMessage| {
        events
            .send(WorkerEvent {
                slot,
                worker_id,
                message,
            })
            .is_ok()
    };

    while let Ok(request) = inbox.recv() {
        let id = request.id;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| process_request(request, &send)));
        let delivered = match outcome {
            Ok(response) => send(WorkerMessage::Response(response)),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(slot, worker_id, job = id, %reason, "worker panicked");
                send(WorkerMessage::Fault(format!("worker panicked: {reason}")))
            }
        };
        if !delivered {
            // Pool is gone.
            break;
        }
    }
    debug!(slot, worker_id, "worker thread exiting");
}

/// Run one request to a response. Operation failures are skipped the way the
/// calling-task paths skip them; only a malformed buffer fails the job.
pub fn process_request(
    request: WorkerRequest,
    send: &impl Fn(WorkerMessage) -> bool,
) -> WorkerResponse {
    let id = request.id;
    let report = request.options.report_progress;
    let mut surface = match Surface::new(request.data.image_data) {
        Ok(s) => s,
        Err(e) => {
            return WorkerResponse::Failure {
                id,
                error: e.to_string(),
            };
        }
    };
    let summary = apply_operations(
        &mut surface,
        &request.data.operations,
        &ApplyContext::worker(),
        |fraction| {
            if report {
                send(WorkerMessage::Response(WorkerResponse::progress(id, fraction)));
            }
        },
    );
    if !summary.is_clean() {
        debug!(job = id, skipped = summary.failed.len(), "worker skipped operations");
    }
    WorkerResponse::Success {
        id,
        result: surface.into_image_data(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
