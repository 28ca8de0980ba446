//! Main-thread side of the inference worker.
//!
//! Requests go out over one channel. A dispatcher thread reads responses and
//! settles the [`Deferred`] registered for that tag. Callers block on the
//! deferred, so the protocol itself never blocks the dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use image::RgbaImage;
use parking_lot::Mutex;

use super::host::{spawn_worker, InferenceEngine};
use super::protocol::{
    BuildEnginePayload, InitializePayload, InitializeStatus, LoadModelPayload, MessageTag,
    Prediction, Request, Response, MODEL_LOAD_SUCCESS,
};
use super::shared::SharedFrameArena;
use crate::config::{Capabilities, ModelSpec};
use crate::deferred::{Deferred, Unsettled};
use crate::error::WorkerError;

pub const DISPATCHER_THREAD_NAME: &str = "backdrop-worker-events";

/// Signal for a completed shared-memory prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedCompletion {
    /// The RGB channels of the output region hold a blurred copy.
    pub blurred: bool,
}

enum Pending {
    Initialize(Deferred<InitializeStatus, WorkerError>),
    LoadModel(Deferred<(), WorkerError>),
    Predict(Deferred<Prediction, WorkerError>),
    PredictShared(Deferred<SharedCompletion, WorkerError>),
    BuildEngine(Deferred<bool, WorkerError>),
    DestroyAssets(Deferred<(), WorkerError>),
}

impl Pending {
    fn reject(self, error: WorkerError) {
        match self {
            Pending::Initialize(d) => d.reject(error),
            Pending::LoadModel(d) => d.reject(error),
            Pending::Predict(d) => d.reject(error),
            Pending::PredictShared(d) => d.reject(error),
            Pending::BuildEngine(d) => d.reject(error),
            Pending::DestroyAssets(d) => d.reject(error),
        };
    }
}

/// Outstanding requests by tag, at most one each.
#[derive(Default)]
struct PendingTable {
    slots: Mutex<HashMap<MessageTag, Pending>>,
    closed: AtomicBool,
}

impl PendingTable {
    fn register(&self, tag: MessageTag, pending: Pending) -> Result<(), WorkerError> {
        let mut slots = self.slots.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(WorkerError::Disconnected);
        }
        if slots.contains_key(&tag) {
            return Err(WorkerError::RequestOutstanding(tag.as_str()));
        }
        slots.insert(tag, pending);
        Ok(())
    }

    fn take(&self, tag: MessageTag) -> Option<Pending> {
        self.slots.lock().remove(&tag)
    }

    fn reject_all(&self, error: WorkerError) {
        let drained: Vec<Pending> = {
            let mut slots = self.slots.lock();
            self.closed.store(true, Ordering::Release);
            slots.drain().map(|(_, p)| p).collect()
        };
        for pending in drained {
            pending.reject(error.clone());
        }
    }
}

fn dispatch(table: &PendingTable, response: Response) {
    let Some(tag) = response.tag() else {
        if let Response::Unknown { tag } = &response {
            tracing::info!("worker received unknown event msg: {}", tag);
        }
        return;
    };
    let Some(pending) = table.take(tag) else {
        tracing::debug!("dropping {} response with nothing waiting", tag);
        return;
    };

    match (pending, response) {
        (Pending::Initialize(d), Response::Initialize(Some(status))) => {
            d.resolve(status);
        }
        (Pending::Initialize(d), Response::Initialize(None)) => {
            d.reject(WorkerError::ModuleInitialize);
        }
        (Pending::LoadModel(d), Response::LoadModel { status }) => {
            if status == MODEL_LOAD_SUCCESS {
                d.resolve(());
            } else {
                d.reject(WorkerError::ModelLoad(status));
            }
        }
        (Pending::BuildEngine(d), Response::BuildEngine { status, supports_shared_memory }) => {
            if status == MODEL_LOAD_SUCCESS {
                d.resolve(supports_shared_memory);
            } else {
                d.reject(WorkerError::EngineBuild(status));
            }
        }
        (Pending::Predict(d), Response::Predict(Some(prediction))) => {
            d.resolve(prediction);
        }
        (Pending::Predict(d), Response::Predict(None)) => {
            d.reject(WorkerError::Segmentation);
        }
        (Pending::PredictShared(d), Response::PredictSharedMemory { completed, blurred }) => {
            if completed {
                d.resolve(SharedCompletion { blurred });
            } else {
                d.reject(WorkerError::Segmentation);
            }
        }
        (Pending::DestroyAssets(d), Response::DestroyAssets) => {
            d.resolve(());
        }
        (pending, _) => pending.reject(WorkerError::Disconnected),
    }
}

fn spawn_dispatcher(
    table: Arc<PendingTable>,
    responses: Receiver<Response>,
) -> Result<JoinHandle<()>, WorkerError> {
    thread::Builder::new()
        .name(DISPATCHER_THREAD_NAME.to_string())
        .spawn(move || {
            for response in responses.iter() {
                dispatch(&table, response);
            }
            // Worker gone: nothing outstanding will ever be answered.
            table.reject_all(WorkerError::Disconnected);
        })
        .map_err(|e| WorkerError::Spawn(e.to_string()))
}

fn settled<T>(outcome: Result<T, Unsettled<WorkerError>>) -> Result<T, WorkerError> {
    outcome.map_err(|e| match e {
        Unsettled::Rejected(error) => error,
        Unsettled::AlreadyObserved => WorkerError::Disconnected,
    })
}

/// Handle to one inference worker and its dispatcher.
pub struct InferenceWorkerClient {
    requests: Sender<Request>,
    table: Arc<PendingTable>,
    arena: Option<Arc<SharedFrameArena>>,
    shared_memory: AtomicBool,
    worker: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl InferenceWorkerClient {
    /// Start the worker thread around `engine`. A shared region sized for
    /// `model` is created when the capabilities allow it.
    pub fn spawn(
        engine: Box<dyn InferenceEngine>,
        model: &ModelSpec,
        capabilities: &Capabilities,
    ) -> Result<Self, WorkerError> {
        let arena = capabilities.shared_memory.then(|| {
            Arc::new(SharedFrameArena::new(
                (model.input.width, model.input.height),
                (model.output.width, model.output.height),
            ))
        });

        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let (response_tx, response_rx) = crossbeam_channel::unbounded();
        let table = Arc::new(PendingTable::default());

        let worker = spawn_worker(engine, arena.clone(), request_rx, response_tx)?;
        let dispatcher = spawn_dispatcher(Arc::clone(&table), response_rx)?;

        tracing::debug!(
            "inference worker spawned, shared region {}",
            if arena.is_some() { "allocated" } else { "disabled" }
        );

        Ok(Self {
            requests: request_tx,
            table,
            arena,
            shared_memory: AtomicBool::new(false),
            worker: Some(worker),
            dispatcher: Some(dispatcher),
        })
    }

    fn post(&self, tag: MessageTag, pending: Pending, request: Request) -> Result<(), WorkerError> {
        self.table.register(tag, pending)?;
        if self.requests.send(request).is_err() {
            if let Some(pending) = self.table.take(tag) {
                pending.reject(WorkerError::Disconnected);
            }
            return Err(WorkerError::Disconnected);
        }
        Ok(())
    }

    pub fn initialize(&self, payload: InitializePayload) -> Result<InitializeStatus, WorkerError> {
        let deferred = Deferred::new();
        self.post(
            MessageTag::Initialize,
            Pending::Initialize(deferred.clone()),
            Request::Initialize(payload),
        )?;
        let status = settled(deferred.wait())?;
        self.shared_memory
            .store(status.supports_shared_memory, Ordering::Release);
        Ok(status)
    }

    pub fn load_model(&self, payload: LoadModelPayload) -> Result<(), WorkerError> {
        let deferred = Deferred::new();
        self.post(
            MessageTag::LoadModel,
            Pending::LoadModel(deferred.clone()),
            Request::LoadModel(payload),
        )?;
        settled(deferred.wait())
    }

    pub fn build_engine(&self, payload: BuildEnginePayload) -> Result<(), WorkerError> {
        let deferred = Deferred::new();
        self.post(
            MessageTag::BuildEngine,
            Pending::BuildEngine(deferred.clone()),
            Request::BuildEngine(payload),
        )?;
        let supports_shared_memory = settled(deferred.wait())?;
        self.shared_memory
            .store(supports_shared_memory, Ordering::Release);
        Ok(())
    }

    /// Send a frame to the worker. The frame is moved and can not be used
    /// again by the caller.
    pub fn submit_predict(
        &self,
        input: RgbaImage,
    ) -> Result<Deferred<Prediction, WorkerError>, WorkerError> {
        let deferred = Deferred::new();
        self.post(
            MessageTag::Predict,
            Pending::Predict(deferred.clone()),
            Request::Predict(input),
        )?;
        Ok(deferred)
    }

    pub fn predict(&self, input: RgbaImage) -> Result<Prediction, WorkerError> {
        settled(self.submit_predict(input)?.wait())
    }

    /// The shared region, once both sides agreed to use it.
    pub fn shared_region(&self) -> Option<&Arc<SharedFrameArena>> {
        if self.shared_memory.load(Ordering::Acquire) {
            self.arena.as_ref()
        } else {
            None
        }
    }

    /// Hand the pre-populated shared region to the worker.
    pub fn submit_predict_shared(
        &self,
    ) -> Result<Deferred<SharedCompletion, WorkerError>, WorkerError> {
        let arena = self.shared_region().ok_or(WorkerError::Disconnected)?;
        let deferred = Deferred::new();
        self.table.register(
            MessageTag::PredictSharedMemory,
            Pending::PredictShared(deferred.clone()),
        )?;
        let posted = arena
            .submit()
            .and_then(|()| {
                self.requests
                    .send(Request::PredictSharedMemory)
                    .map_err(|_| WorkerError::Disconnected)
            });
        if let Err(e) = posted {
            if let Some(pending) = self.table.take(MessageTag::PredictSharedMemory) {
                pending.reject(e.clone());
            }
            return Err(e);
        }
        Ok(deferred)
    }

    pub fn predict_shared_memory(&self) -> Result<SharedCompletion, WorkerError> {
        settled(self.submit_predict_shared()?.wait())
    }

    /// Release the model. Blocks until the worker acknowledges.
    pub fn destroy_assets(&self) -> Result<(), WorkerError> {
        let deferred = Deferred::new();
        self.post(
            MessageTag::DestroyAssets,
            Pending::DestroyAssets(deferred.clone()),
            Request::DestroyAssets,
        )?;
        settled(deferred.wait())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Tear down: destroy assets, wait for the ack, close the worker and
    /// join both threads. Failures are logged and never returned.
    pub fn terminate(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        if let Err(e) = self.destroy_assets() {
            tracing::warn!("destroyAssets during teardown failed: {}", e);
        }
        if self.requests.send(Request::CloseWorker).is_err() {
            tracing::warn!("inference worker already gone at close");
        }
        if worker.join().is_err() {
            tracing::warn!("inference worker panicked");
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                tracing::warn!("worker event dispatcher panicked");
            }
        }
        self.shared_memory.store(false, Ordering::Release);
        tracing::debug!("inference worker terminated");
    }
}

impl Drop for InferenceWorkerClient {
    fn drop(&mut self) {
        self.terminate();
    }
}
