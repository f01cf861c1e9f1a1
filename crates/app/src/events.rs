use std::{
    convert::Infallible,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use axum::response::sse::{Event, KeepAlive};
use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, warn};

use cabinet_portal_core::types::{Id, Notification};
use cabinet_portal_core::ProposalStatus;

const BROADCAST_BUFFER: usize = 256;

/// Domain event published inside the process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum PortalEvent {
    #[serde(rename = "notification.created")]
    NotificationCreated { notification: Notification },
    #[serde(rename = "proposal.accepted")]
    ProposalAccepted {
        proposal_id: Id,
        owner_group_id: Option<Id>,
        accepted_by: Option<Id>,
        at: DateTime<Utc>,
    },
    #[serde(rename = "proposal.status")]
    ProposalStatusChanged {
        proposal_id: Id,
        owner_group_id: Option<Id>,
        from: ProposalStatus,
        to: ProposalStatus,
        at: DateTime<Utc>,
    },
    #[serde(rename = "contact.message")]
    ContactMessage {
        thread_id: Id,
        message_id: Id,
        from_admin: bool,
        at: DateTime<Utc>,
    },
}

impl PortalEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::NotificationCreated { .. } => "notification.created",
            Self::ProposalAccepted { .. } => "proposal.accepted",
            Self::ProposalStatusChanged { .. } => "proposal.status",
            Self::ContactMessage { .. } => "contact.message",
        }
    }

    /// User a stream event is addressed to. Only notifications are user specific.
    pub fn recipient(&self) -> Option<Id> {
        match self {
            Self::NotificationCreated { notification } => Some(notification.recipient_user_id),
            _ => None,
        }
    }

    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let mut event = Event::default().event(self.event_name());
        if let Self::NotificationCreated { notification } = &self {
            event = event.id(notification.id.to_string());
        }
        let data = serde_json::to_string(&self)?;
        Ok(event.data(data))
    }
}

/// Fan-out hub for [`PortalEvent`]s.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<PortalEvent>,
    clients: Arc<AtomicUsize>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            sender,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publishing with no subscriber is not an error; the event is dropped.
    pub fn publish(&self, event: PortalEvent) {
        let name = event.event_name();
        if self.sender.send(event).is_err() {
            debug!(stage = "notification", event = name, "no subscribers for portal event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PortalEvent> {
        self.sender.subscribe()
    }

    /// Live stream of notification events for one user.
    pub fn notification_stream(&self, user_id: Id) -> NotificationStream {
        let guard = ClientGuard::new(self.clients.clone());
        let inner = BroadcastStream::new(self.subscribe()).filter_map(move |result| match result {
            Ok(event) if event.recipient() == Some(user_id) => match event.into_sse_event() {
                Ok(event) => Some(Ok(event)),
                Err(err) => {
                    warn!(stage = "notification", error = %err, "failed to encode stream event");
                    None
                }
            },
            Ok(_) => None,
            Err(err) => {
                warn!(stage = "notification", user_id, error = %err, "notification stream lagged");
                None
            }
        });
        NotificationStream {
            inner: Box::pin(inner),
            _guard: guard,
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

pub fn stream_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}

pub struct NotificationStream {
    inner: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>,
    _guard: ClientGuard,
}

impl Stream for NotificationStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

struct ClientGuard {
    clients: Arc<AtomicUsize>,
}

impl ClientGuard {
    fn new(clients: Arc<AtomicUsize>) -> Self {
        let value = clients.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("notification_stream_clients").set(value as f64);
        Self { clients }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let value = self.clients.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("notification_stream_clients").set(value as f64);
    }
}
