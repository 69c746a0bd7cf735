//! Status-change notifications

use crate::model::{ConnectionStatus, ServerStatus, SiteStatus};
use serverforge_provision::ProvisioningStep;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    StatusChanged {
        server_id: Uuid,
        previous: ServerStatus,
        current: ServerStatus,
    },
    StepChanged {
        server_id: Uuid,
        step: ProvisioningStep,
    },
    ConnectionChecked {
        server_id: Uuid,
        status: ConnectionStatus,
    },
    SiteStatusChanged {
        server_id: Uuid,
        site_id: Uuid,
        domain: String,
        status: SiteStatus,
    },
}

impl ServerEvent {
    pub fn server_id(&self) -> Uuid {
        match self {
            ServerEvent::StatusChanged { server_id, .. }
            | ServerEvent::StepChanged { server_id, .. }
            | ServerEvent::ConnectionChecked { server_id, .. }
            | ServerEvent::SiteStatusChanged { server_id, .. } => *server_id,
        }
    }
}

/// Receives lifecycle notifications. Publishing never fails the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ServerEvent);
}

/// Fans events out to any number of subscribers
pub struct BroadcastEvents {
    sender: broadcast::Sender<ServerEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEvents {
    fn publish(&self, event: ServerEvent) {
        tracing::trace!(?event, "Publishing server event");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}
