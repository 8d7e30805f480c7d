//! In-process hub that carries observability events to UI collaborators.

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use tintcam_types::{
    events::{EventKind, SystemEvent},
    Result,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

#[async_trait]
pub trait EventHub: Send + Sync {
    async fn publish(&self, event: SystemEvent) -> Result<()>;
    fn subscribe(&self) -> BoxStream<'static, SystemEvent>;
}

/// Hub backed by a broadcast channel. Slow subscribers drop old events
/// rather than stalling the publisher.
#[derive(Clone)]
pub struct LocalHub {
    tx: broadcast::Sender<SystemEvent>,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Subscription limited to one kind of event.
    pub fn subscribe_kind(&self, kind: EventKind) -> BoxStream<'static, SystemEvent> {
        self.subscribe()
            .filter(move |event| futures::future::ready(event.kind == kind))
            .boxed()
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventHub for LocalHub {
    async fn publish(&self, event: SystemEvent) -> Result<()> {
        trace!("Publishing {:?} event", event.kind);
        if self.tx.send(event).is_err() {
            debug!("No hub subscribers; event dropped");
        }
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, SystemEvent> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }
}
