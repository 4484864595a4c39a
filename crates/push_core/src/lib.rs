//! Push-notification client.
//!
//! [`PushClient`] sits on top of the Bayeux transport: it subscribes the
//! current user's personal channel, lets consumers opt in and out of group
//! channels, and turns raw channel payloads into typed
//! [`Notification`]s broadcast as [`PushEvent`]s.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{group_channel, user_channel, Conversation, UserId},
    protocol::{Notification, NotificationSource},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod bayeux;

pub use bayeux::{
    BayeuxClient, BayeuxOptions, ConnectionState, PayloadCallback, TransportCounters,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Seam to the REST side of the service. The push client only needs one
/// call: resolving the identity of the authenticated user so their personal
/// channel can be subscribed.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn current_user(&self) -> Result<UserId>;
}

pub struct MissingIdentityResolver;

#[async_trait]
impl IdentityResolver for MissingIdentityResolver {
    async fn current_user(&self) -> Result<UserId> {
        Err(anyhow!("identity resolver is unavailable"))
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("failed to resolve the current user identity: {0}")]
    IdentityResolution(String),
}

#[derive(Debug, Clone)]
pub enum PushEvent {
    NotificationReceived {
        source: NotificationSource,
        notification: Notification,
    },
}

/// Failure counters for consumers that want a health signal. The transport
/// itself never surfaces failures; it reconnects and keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushDiagnostics {
    pub decode_failures: u64,
    pub handshake_failures: u64,
    pub subscribe_failures: u64,
    pub poll_failures: u64,
}

pub struct PushClient {
    transport: Arc<BayeuxClient>,
    identity: Arc<dyn IdentityResolver>,
    events: broadcast::Sender<PushEvent>,
    decode_failures: AtomicU64,
    cancel: CancellationToken,
    connection_task: Mutex<Option<JoinHandle<()>>>,
}

impl PushClient {
    pub fn new(
        options: BayeuxOptions,
        access_token: impl Into<String>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport: BayeuxClient::new(options, access_token, cancel.clone()),
            identity,
            events,
            decode_failures: AtomicU64::new(0),
            cancel,
            connection_task: Mutex::new(None),
        })
    }

    /// Resolves the current user, registers their personal channel, then
    /// starts the transport's connection loop. Identity resolution is the
    /// only failure surfaced to the caller; everything after this point
    /// self-heals via reconnect.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let user_id = self
            .identity
            .current_user()
            .await
            .map_err(|err| PushError::IdentityResolution(err.to_string()))?;

        let source = NotificationSource::CurrentUser { user_id };
        let client = Arc::clone(self);
        self.transport
            .subscribe(
                user_channel(user_id),
                Arc::new(move |payload| client.dispatch(source, &payload)),
            )
            .await;

        let task = self.transport.connect();
        *self.connection_task.lock().await = Some(task);
        Ok(())
    }

    /// Registers for push notifications from a conversation. Only group
    /// conversations have a push channel; other kinds are logged and
    /// ignored.
    pub async fn subscribe(self: &Arc<Self>, conversation: &Conversation) {
        match conversation {
            Conversation::Group { group_id } => {
                let source = NotificationSource::Group {
                    group_id: *group_id,
                };
                let client = Arc::clone(self);
                self.transport
                    .subscribe(
                        group_channel(*group_id),
                        Arc::new(move |payload| client.dispatch(source, &payload)),
                    )
                    .await;
            }
            Conversation::Chat { chat_id } => {
                warn!(
                    chat_id = chat_id.0,
                    "push subscriptions are not supported for direct chats"
                );
            }
        }
    }

    /// Mirrors [`PushClient::subscribe`]. Removal is local only; the server
    /// side of the subscription lapses on the next reconnect.
    pub async fn unsubscribe(&self, conversation: &Conversation) {
        match conversation {
            Conversation::Group { group_id } => {
                self.transport.unsubscribe(&group_channel(*group_id)).await;
            }
            Conversation::Chat { chat_id } => {
                warn!(
                    chat_id = chat_id.0,
                    "push subscriptions are not supported for direct chats"
                );
            }
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    pub fn diagnostics(&self) -> PushDiagnostics {
        let counters = self.transport.counters();
        PushDiagnostics {
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handshake_failures: counters.handshake_failures,
            subscribe_failures: counters.subscribe_failures,
            poll_failures: counters.poll_failures,
        }
    }

    /// Stops the connection loop and waits for it to finish. Prompt even
    /// mid-poll: in-flight requests race the same cancellation token.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = { self.connection_task.lock().await.take() };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn dispatch(&self, source: NotificationSource, payload: &str) {
        let notification = match serde_json::from_str::<Notification>(payload) {
            Ok(notification) => notification,
            Err(err) => {
                // Undecodable payloads are dropped without an event; the
                // counter is the only trace.
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(?source, "discarding undecodable push payload: {err}");
                return;
            }
        };
        debug!(kind = notification.kind(), ?source, "push notification received");
        let _ = self.events.send(PushEvent::NotificationReceived {
            source,
            notification,
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
