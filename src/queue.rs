use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    error::{Result, RingError},
    protocol::Command,
    transport::Link,
    types::ChannelKey,
};

struct Job {
    command: Command,
    ack: Option<oneshot::Sender<Result<()>>>,
}

/// Handle for submitting commands to a [`CommandQueue`]
#[derive(Clone)]
pub(crate) struct CommandSender {
    tx: mpsc::UnboundedSender<Job>,
}

impl CommandSender {
    /// Enqueue without waiting for the write
    pub(crate) fn dispatch(&self, command: Command) -> Result<()> {
        self.tx
            .send(Job { command, ack: None })
            .map_err(|_| RingError::Cancelled)
    }

    /// Enqueue and wait until the transport acknowledged the write or it
    /// timed out
    pub(crate) async fn submit(&self, command: Command) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Job {
                command,
                ack: Some(ack),
            })
            .map_err(|_| RingError::Cancelled)?;
        done.await.unwrap_or(Err(RingError::Cancelled))
    }
}

/// The only writer on a link.
///
/// Commands run one at a time in submission order. Dropping the queue stops
/// the worker and discards whatever was still waiting; waiters see
/// [`RingError::Cancelled`].
pub(crate) struct CommandQueue {
    sender: CommandSender,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    pub(crate) fn start(link: Arc<dyn Link>, channel: ChannelKey, per_command: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(link, channel, per_command, rx));
        Self {
            sender: CommandSender { tx },
            worker,
        }
    }

    pub(crate) fn sender(&self) -> CommandSender {
        self.sender.clone()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run(
    link: Arc<dyn Link>,
    channel: ChannelKey,
    per_command: Duration,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(Job { command, ack }) = rx.recv().await {
        let bytes = command.to_bytes();
        debug!("Writing {:?}: {:02X?}", command.opcode(), &bytes[..]);

        let result = match timeout(per_command, link.write_command(&channel, &bytes)).await {
            Ok(result) => result,
            Err(_) => Err(RingError::Timeout {
                timeout_ms: u64::try_from(per_command.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match ack {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!("Command {:?} failed: {}", command.opcode(), e);
                }
            }
        }
    }
}
