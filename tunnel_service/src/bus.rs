//! Fan-out of tunnel events to subscribed connections.

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use tunnel_ipc::ServiceEvent;

/// Broadcasts every [`ServiceEvent`] to all current subscribers.
///
/// Each subscriber owns a bounded queue. A subscriber that falls further
/// behind than the queue capacity loses the oldest events and is told to
/// resynchronize instead.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<ServiceEvent>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `event` to every subscriber. Never blocks.
    pub fn publish(&self, event: ServiceEvent) {
        match self.sender.send(event) {
            Ok(receivers) => debug!(receivers, "Published service event"),
            Err(broadcast::error::SendError(event)) => {
                debug!(?event, "No subscribers for service event")
            }
        }
    }

    /// Register a new subscriber. Only events published after this call are
    /// delivered to it.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving side of one subscriber.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<ServiceEvent>,
}

impl Subscription {
    /// Next event in publication order.
    ///
    /// An overflowed queue yields [`ServiceEvent::Resync`]; `None` means the
    /// bus is gone.
    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Subscriber fell behind, requesting resync");
                Some(ServiceEvent::Resync)
            }
            Err(RecvError::Closed) => None,
        }
    }
}
