use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::DeviceApi;
use crate::config::RetryConfig;
use crate::protocol::SetCommand;
use crate::{Error, Result};

const EVENT_CHANNEL_SIZE: usize = 64;

/// Outcome notifications. Every command ends with exactly one of
/// `Executed`, `Error { will_retry: false, .. }` or `MaxRetriesReached`;
/// `Error { will_retry: true, .. }` may precede it once per failed attempt.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Executed {
        id: u64,
        command: SetCommand,
    },
    Error {
        id: u64,
        attempt: u32,
        message: String,
        will_retry: bool,
    },
    MaxRetriesReached {
        id: u64,
        attempts: u32,
        command: SetCommand,
    },
}

impl QueueEvent {
    pub fn id(&self) -> u64 {
        match self {
            QueueEvent::Executed { id, .. }
            | QueueEvent::Error { id, .. }
            | QueueEvent::MaxRetriesReached { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueEvent::Error { will_retry: true, .. })
    }
}

struct Job {
    id: u64,
    command: SetCommand,
    reply: oneshot::Sender<Result<()>>,
}

/// Handle to a submitted command.
pub struct CommandTicket {
    id: u64,
    rx: oneshot::Receiver<Result<()>>,
}

impl CommandTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the command has executed or was abandoned.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(Error::Closed))
    }
}

/// Per-device FIFO of outbound commands. A single worker task executes
/// them one at a time, so two commands never overlap on the wire.
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Job>,
    events: broadcast::Sender<QueueEvent>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    /// Spawns the worker; must be called inside a Tokio runtime.
    pub fn new(device: Arc<dyn DeviceApi>, retry: RetryConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            device,
            retry,
            rx,
            events.clone(),
            cancel.clone(),
        ));

        Self {
            tx,
            events,
            next_id: AtomicU64::new(1),
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Queue a command without waiting for it. Order of `submit` calls is
    /// execution order.
    pub fn submit(&self, command: SetCommand) -> CommandTicket {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Job { id, command, reply }) {
            let _ = job.reply.send(Err(Error::Closed));
        }
        CommandTicket { id, rx }
    }

    pub async fn enqueue_command(&self, command: SetCommand) -> Result<()> {
        self.submit(command).wait().await
    }

    /// Stop the worker. Commands still queued are answered with
    /// [`Error::Closed`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.lock().take() {
            debug!("command queue shutting down");
            drop(worker);
        }
    }
}

async fn run_worker(
    device: Arc<dyn DeviceApi>,
    retry: RetryConfig,
    mut rx: mpsc::UnboundedReceiver<Job>,
    events: broadcast::Sender<QueueEvent>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Closed),
            result = execute(device.as_ref(), retry, &events, &job, &cancel) => result,
        };
        let _ = job.reply.send(result);
    }

    rx.close();
    while let Ok(job) = rx.try_recv() {
        let _ = job.reply.send(Err(Error::Closed));
    }
}

async fn execute(
    device: &dyn DeviceApi,
    retry: RetryConfig,
    events: &broadcast::Sender<QueueEvent>,
    job: &Job,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        debug!(id = job.id, attempt, "executing command");
        match device.send_set_command(&job.command).await {
            Ok(()) => {
                let _ = events.send(QueueEvent::Executed {
                    id: job.id,
                    command: job.command.clone(),
                });
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt <= retry.max_retries => {
                let _ = events.send(QueueEvent::Error {
                    id: job.id,
                    attempt,
                    message: e.to_string(),
                    will_retry: true,
                });
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Closed),
                    () = tokio::time::sleep(retry.delay_for(attempt)) => {}
                }
            }
            Err(e) if e.is_transient() => {
                warn!(id = job.id, attempts = attempt, error = %e, "command retries exhausted");
                let _ = events.send(QueueEvent::MaxRetriesReached {
                    id: job.id,
                    attempts: attempt,
                    command: job.command.clone(),
                });
                return Err(Error::QueueExhausted { attempts: attempt });
            }
            Err(e) => {
                warn!(id = job.id, error = %e, "command failed");
                let _ = events.send(QueueEvent::Error {
                    id: job.id,
                    attempt,
                    message: e.to_string(),
                    will_retry: false,
                });
                return Err(e);
            }
        }
    }
}
