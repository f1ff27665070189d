//! Worker wire protocol.
//!
//! Requests and responses are plain serde types so the same messages can be
//! posted to an in-process thread, logged, or sent across a process boundary.
//!
//! ```text
//! request  {"id": 7, "type": "process", "data": {"imageData": {...}, "operations": [...]}, "options": {...}}
//! success  {"id": 7, "result": {"data": [...], "width": 100, "height": 100}}
//! failure  {"id": 7, "error": "worker panicked: ..."}
//! progress {"id": 7, "type": "progress", "result": 0.5}
//! ```

use crate::imaging::{ImageData, Operation};
use serde::{Deserialize, Serialize};

/// Monotonic job identifier. Never reused within a pool.
pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessData {
    pub image_data: ImageData,
    pub operations: Vec<Operation>,
}

/// Per-job options forwarded to the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobOptions {
    /// Send `progress` messages after each operation.
    pub report_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: JobId,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub data: ProcessData,
    #[serde(default)]
    pub options: JobOptions,
}

impl WorkerRequest {
    pub fn process(id: JobId, image: ImageData, operations: Vec<Operation>, options: JobOptions) -> Self {
        Self {
            id,
            kind: RequestKind::Process,
            data: ProcessData {
                image_data: image,
                operations,
            },
            options,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressTag {
    Progress,
}

/// A message from a worker about one job.
///
/// Untagged: variants are told apart by their fields, most specific first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerResponse {
    Progress {
        id: JobId,
        #[serde(rename = "type")]
        tag: ProgressTag,
        result: f32,
    },
    Failure {
        id: JobId,
        error: String,
    },
    Success {
        id: JobId,
        result: ImageData,
    },
}

impl WorkerResponse {
    pub fn progress(id: JobId, fraction: f32) -> Self {
        Self::Progress {
            id,
            tag: ProgressTag::Progress,
            result: fraction,
        }
    }

    pub fn id(&self) -> JobId {
        match self {
            Self::Progress { id, .. } | Self::Failure { id, .. } | Self::Success { id, .. } => *id,
        }
    }
}

/// What a worker thread reports back to the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Response(WorkerResponse),
    /// The worker hit an unrecoverable error; every job on its slot is lost.
    Fault(String),
}

/// A [`WorkerMessage`] stamped with where it came from.
///
/// `worker_id` distinguishes a restarted worker from its predecessor, so late
/// messages from a replaced worker can be ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub slot: usize,
    pub worker_id: u64,
    pub message: WorkerMessage,
}
