//! Per-session serialized command queue.
//!
//! A single worker task owns the receiving end of an unbounded channel and
//! awaits each operation to completion before taking the next one, so at most
//! one write is in flight per session and writes leave in submission order. A
//! failing operation is logged and reported on its completion receiver; the
//! chain keeps going.

use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};

pub type Operation = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

struct Job {
    label: String,
    op: Operation,
    done: oneshot::Sender<anyhow::Result<()>>,
}

enum QueueCommand {
    Run(Job),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct CommandQueue {
    name: String,
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl CommandQueue {
    /// Spawn the worker. Must be called from within a Tokio runtime.
    pub fn start(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueCommand>();
        let worker_name = name.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    QueueCommand::Run(job) => {
                        log::trace!("queue[{}]: running {}", worker_name, job.label);
                        let result = job.op.await;
                        if let Err(e) = &result {
                            log::warn!("queue[{}]: {} failed: {:#}", worker_name, job.label, e);
                        }
                        let _ = job.done.send(result);
                    }
                    QueueCommand::Shutdown(done) => {
                        let _ = done.send(());
                        break;
                    }
                }
            }
            log::debug!("queue[{}]: worker stopped", worker_name);
        });
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append `op` to the chain. The receiver resolves once `op` settles; it
    /// errors if the worker stopped before running it.
    pub fn enqueue<F>(&self, label: impl Into<String>, op: F) -> oneshot::Receiver<anyhow::Result<()>>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let job = Job {
            label: label.into(),
            op: Box::pin(op),
            done,
        };
        if self.tx.send(QueueCommand::Run(job)).is_err() {
            log::warn!("queue[{}]: worker gone, operation dropped", self.name);
        }
        rx
    }

    /// Stop after the operations already queued have run.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(QueueCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}
