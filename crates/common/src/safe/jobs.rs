//! Background command queue of a safe
//!
//! Every open safe owns one worker task. Foreground calls hand it work through
//! a [`CommandDispatcher`]; the worker serves one command at a time, in order.

use anyhow::Result;
use tokio::sync::oneshot;

/// Work the background worker can be asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reconnect to the first reachable store URL
    Reconnect,
    /// Write queued asynchronous uploads to the store
    FlushUploads,
    /// Evict the oldest files of the quota group while it is over quota
    EnforceQuota,
    /// Consolidate the ACL objects of a zone into a single fresh epoch
    Compact { zone: String },
    /// Flush pending uploads and stop the worker
    Shutdown,
}

/// A command plus the optional channel signalled once it has been served.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub command: Command,
    pub done: Option<oneshot::Sender<()>>,
}

/// Cloneable handle sending commands to the worker
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    tx: flume::Sender<Envelope>,
}

impl CommandDispatcher {
    /// Create a new dispatcher and receiver pair
    pub fn new() -> (Self, CommandReceiver) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, CommandReceiver { rx })
    }

    /// Queue a command without waiting for it.
    pub fn dispatch(&self, command: Command) -> Result<()> {
        tracing::debug!("dispatching command {:?}", command);
        self.tx
            .send(Envelope {
                command,
                done: None,
            })
            .map_err(|_| anyhow::anyhow!("command receiver has been dropped"))
    }

    /// Queue a command and wait until the worker has served it.
    pub async fn dispatch_and_wait(&self, command: Command) -> Result<()> {
        let (done, wait) = oneshot::channel();
        tracing::debug!("dispatching command {:?} and waiting", command);
        self.tx
            .send_async(Envelope {
                command,
                done: Some(done),
            })
            .await
            .map_err(|_| anyhow::anyhow!("command receiver has been dropped"))?;
        wait.await
            .map_err(|_| anyhow::anyhow!("worker stopped before serving the command"))
    }
}

/// Receiving end, owned by the worker
#[derive(Debug)]
pub struct CommandReceiver {
    rx: flume::Receiver<Envelope>,
}

impl CommandReceiver {
    pub(crate) fn into_async(self) -> flume::r#async::RecvStream<'static, Envelope> {
        self.rx.into_stream()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_dispatch_and_wait() {
        let (dispatcher, receiver) = CommandDispatcher::new();
        let worker = tokio::spawn(async move {
            let mut stream = receiver.into_async();
            let mut served = Vec::new();
            while let Some(envelope) = stream.next().await {
                served.push(envelope.command.clone());
                if let Some(done) = envelope.done {
                    let _ = done.send(());
                }
                if envelope.command == Command::Shutdown {
                    break;
                }
            }
            served
        });

        dispatcher.dispatch(Command::FlushUploads).unwrap();
        dispatcher
            .dispatch_and_wait(Command::Compact {
                zone: "main".to_string(),
            })
            .await
            .unwrap();
        dispatcher.dispatch_and_wait(Command::Shutdown).await.unwrap();

        let served = worker.await.unwrap();
        assert_eq!(
            served,
            vec![
                Command::FlushUploads,
                Command::Compact {
                    zone: "main".to_string()
                },
                Command::Shutdown
            ]
        );
        assert!(dispatcher.dispatch(Command::Reconnect).is_err());
    }
}
