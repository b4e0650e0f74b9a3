use std::sync::Weak;
use std::time::Duration;

use futures::StreamExt;

use super::jobs::{Command, CommandReceiver};
use super::{Safe, SafeInner};

/// Serve commands and periodic refreshes until `Shutdown` or until the safe is dropped.
pub(crate) async fn run_worker(safe: Weak<SafeInner>, receiver: CommandReceiver, tick_secs: u64) {
    let mut commands = receiver.into_async();
    let mut tick = tokio::time::interval(Duration::from_secs(tick_secs.max(1)));
    // the first tick completes immediately, opening already refreshed
    tick.tick().await;

    loop {
        tokio::select! {
            Some(envelope) = commands.next() => {
                let Some(inner) = safe.upgrade() else {
                    break;
                };
                let shutdown = envelope.command == Command::Shutdown;
                Safe(inner).serve(envelope.command).await;
                if let Some(done) = envelope.done {
                    let _ = done.send(());
                }
                if shutdown {
                    break;
                }
            }
            _ = tick.tick() => {
                let Some(inner) = safe.upgrade() else {
                    break;
                };
                Safe(inner).refresh().await;
            }
            else => break,
        }
    }
    tracing::debug!("safe worker stopped");
}

impl Safe {
    async fn serve(&self, command: Command) {
        tracing::debug!("serving {:?} for {}", command, self.name());
        let result = match &command {
            Command::Reconnect => self.reconnect().await,
            Command::FlushUploads | Command::Shutdown => self.flush_uploads().await,
            Command::EnforceQuota => self.enforce_quota().await.map(|_| ()),
            Command::Compact { zone } => self.compact_zone(zone).await,
        };
        if let Err(e) = result {
            tracing::error!("{:?} failed for {}: {}", command, self.name(), e);
        }
    }

    /// Pick up events and new zones, then sync every zone.
    pub(crate) async fn refresh(&self) {
        if let Err(e) = self.process_events().await {
            tracing::warn!("cannot read events of {}: {}", self.identity().public(), e);
        }
        if let Err(e) = self.discover_zones().await {
            tracing::warn!("cannot list zones of {}: {}", self.name(), e);
        }
        self.sync_all().await;
    }
}
