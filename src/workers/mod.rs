//! Off-task pixel processing.
//!
//! | Piece | Role |
//! |---|---|
//! | [`protocol`] | serde request/response messages |
//! | [`worker`] | [`WorkerHandle`] / [`WorkerSpawner`] seams and the thread worker |
//! | [`pool`] | [`WorkerPool`]: slot selection, demux, timeouts, restarts |

pub mod pool;
pub mod protocol;
pub mod worker;

pub use pool::{
    DispatchOptions, PoolConfig, PoolError, PoolStats, ProgressFn, SlotInfo, SlotState, WorkerPool,
};
pub use protocol::{JobId, JobOptions, WorkerEvent, WorkerMessage, WorkerRequest, WorkerResponse};
pub use worker::{ThreadSpawner, WorkerHandle, WorkerSpawner, process_request};
