mod client;
mod host;
pub mod protocol;
pub mod shared;

pub use client::{InferenceWorkerClient, SharedCompletion, DISPATCHER_THREAD_NAME};
pub use host::{spawn_worker, InferenceEngine, Outbox, WorkerHost, WORKER_THREAD_NAME};
pub use protocol::{
    BuildEnginePayload, InitializePayload, InitializeStatus, LoadModelPayload, MessageTag,
    Prediction, Request, Response, MODEL_LOAD_FAILURE, MODEL_LOAD_SUCCESS,
};
pub use shared::{ArenaView, Phase, SharedFrameArena};
