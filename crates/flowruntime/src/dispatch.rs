//! Fire-and-forget execution through a bounded worker queue

use crate::engine::FlowEngine;
use flowcore::{status, Context, FunctionArguments, Output};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Execution queue is full")]
    QueueFull,

    #[error("Dispatcher is shut down")]
    Closed,
}

impl DispatchError {
    pub fn status_code(&self) -> u16 {
        status::SERVICE_UNAVAILABLE
    }
}

impl From<DispatchError> for Output {
    fn from(e: DispatchError) -> Self {
        Output::error(e.status_code(), e.to_string())
    }
}

/// What a queued job executes
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Flow(String),
    TagGroups(Vec<Vec<String>>),
    Operator { operator: String, function: String },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub ctx: Context,
    pub target: Target,
    pub args: FunctionArguments,
    pub input: Output,
}

impl Job {
    pub fn new(ctx: Context, target: Target) -> Self {
        Self {
            ctx,
            target,
            args: FunctionArguments::new(),
            input: Output::empty(),
        }
    }

    pub fn with_args(mut self, args: FunctionArguments) -> Self {
        self.args = args;
        self
    }

    pub fn with_input(mut self, input: Output) -> Self {
        self.input = input;
        self
    }
}

/// Submitting side of a [`Dispatcher`]; cheap to clone into request
/// handlers
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
    cancel: CancellationToken,
}

impl JobQueue {
    /// Queues a job and returns immediately
    pub fn submit(&self, job: Job) -> Result<(), DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }

    /// Queues a job and answers for the caller: 202 with the context id
    /// of the queued execution, or 503 when the queue cannot take it
    pub fn accept(&self, job: Job) -> Output {
        let request_id = job.ctx.id().to_string();
        match self.submit(job) {
            Ok(()) => Output::json(serde_json::json!({ "requestId": request_id }))
                .with_status(status::ACCEPTED),
            Err(e) => {
                tracing::warn!("Cannot queue execution {}: {}", request_id, e);
                e.into()
            }
        }
    }
}

/// Queue drained by a fixed number of tokio workers
pub struct Dispatcher {
    queue: JobQueue,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Starts `workers` tasks on the current runtime
    pub fn start(engine: Arc<FlowEngine>, workers: usize, capacity: usize, cancel: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..workers.max(1))
            .map(|worker| {
                let engine = Arc::clone(&engine);
                let receiver = Arc::clone(&receiver);
                let cancel = cancel.clone();
                tokio::spawn(run_worker(worker, engine, receiver, cancel))
            })
            .collect();
        Self {
            queue: JobQueue { sender, cancel },
            workers,
        }
    }

    /// Starts with the worker count and queue capacity of the engine's
    /// runtime config
    pub fn from_config(engine: Arc<FlowEngine>, cancel: CancellationToken) -> Self {
        let (workers, capacity) = (engine.config().workers, engine.config().queue_capacity);
        tracing::info!("Starting {} dispatch workers with a queue of {}", workers, capacity);
        Self::start(engine, workers, capacity, cancel)
    }

    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    pub fn submit(&self, job: Job) -> Result<(), DispatchError> {
        self.queue.submit(job)
    }

    pub fn accept(&self, job: Job) -> Output {
        self.queue.accept(job)
    }

    /// Stops accepting jobs and waits for the workers. Without a cancelled
    /// token the workers first drain the queue, which requires every
    /// [`JobQueue`] clone to be dropped.
    pub async fn shutdown(self) {
        drop(self.queue);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!("Dispatch worker failed: {}", e);
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    engine: Arc<FlowEngine>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    cancel: CancellationToken,
) {
    tracing::debug!("Dispatch worker {} started", worker);
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };
        let span = job.ctx.span().clone();
        let output = execute(&engine, job).instrument(span).await;
        if output.is_error() {
            tracing::warn!("Queued execution failed: {}", output);
        }
    }
    tracing::debug!("Dispatch worker {} stopped", worker);
}

async fn execute(engine: &FlowEngine, job: Job) -> Output {
    let Job {
        ctx,
        target,
        args,
        input,
    } = job;
    match target {
        Target::Flow(id) => engine.execute_flow(&ctx, &id, args, input).await,
        Target::TagGroups(groups) => engine.execute_by_tag_groups(&ctx, &groups, args, input).await,
        Target::Operator { operator, function } => {
            engine
                .execute_operator(&ctx, &operator, &function, args, input)
                .await
        }
    }
}
