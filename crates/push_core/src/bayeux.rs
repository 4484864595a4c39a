//! Bayeux/Faye long-polling transport.
//!
//! [`BayeuxClient`] owns the connection loop: handshake, replay of every
//! registered subscription, then repeated long polls. Every failure mode
//! funnels back into `Disconnected`, which triggers a fresh handshake and a
//! full subscription replay; that reconnect is the only recovery mechanism.
//! The loop runs on one spawned task and is the sole writer of the
//! connection state, session id, and sequence counter.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use shared::protocol::{
    ConnectRequest, EventDelivery, HandshakeRequest, HandshakeResponse, SubscribeRequest,
    SubscribeResponse,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const MAX_CONNECTION_AGE: Duration = Duration::from_secs(30 * 60);
const HANDSHAKING_IDLE_DELAY: Duration = Duration::from_secs(1);

/// Callback invoked with the serialized payload of every event that arrives
/// on a subscribed channel. Runs on the connection loop task; panics are
/// caught there.
pub type PayloadCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    Polling,
}

#[derive(Debug, Clone)]
pub struct BayeuxOptions {
    /// Push endpoint all requests are POSTed to.
    pub endpoint: String,
    /// Timeout for handshake and subscribe requests.
    pub request_timeout: Duration,
    /// Timeout for the held-open connect request.
    pub long_poll_timeout: Duration,
    /// Maximum lifetime of one session before a re-handshake is forced.
    pub max_connection_age: Duration,
}

impl BayeuxOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            long_poll_timeout: LONG_POLL_TIMEOUT,
            max_connection_age: MAX_CONNECTION_AGE,
        }
    }
}

/// Snapshot of transport failure counters. Failures never surface as errors
/// from the loop, so these counters are the only external health signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportCounters {
    pub handshake_failures: u64,
    pub subscribe_failures: u64,
    pub poll_failures: u64,
}

#[derive(Debug, Default)]
struct TransportStats {
    handshake_failures: AtomicU64,
    subscribe_failures: AtomicU64,
    poll_failures: AtomicU64,
}

#[derive(Debug)]
struct ConnectionInfo {
    state: ConnectionState,
    /// Bayeux `clientId`; valid only while connected, cleared on failure.
    client_id: Option<String>,
    connected_at: Option<Instant>,
}

pub struct BayeuxClient {
    options: BayeuxOptions,
    access_token: String,
    http: Client,
    /// Sequence id for outbound messages. Monotonic for the life of the
    /// process, never reset on reconnect.
    seq: AtomicU64,
    conn: Mutex<ConnectionInfo>,
    subscriptions: Mutex<HashMap<String, PayloadCallback>>,
    cancel: CancellationToken,
    stats: TransportStats,
}

impl BayeuxClient {
    pub fn new(
        options: BayeuxOptions,
        access_token: impl Into<String>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            access_token: access_token.into(),
            http: Client::new(),
            seq: AtomicU64::new(1),
            conn: Mutex::new(ConnectionInfo {
                state: ConnectionState::Disconnected,
                client_id: None,
                connected_at: None,
            }),
            subscriptions: Mutex::new(HashMap::new()),
            cancel,
            stats: TransportStats::default(),
        })
    }

    /// Starts the connection loop on a background task. The task runs until
    /// the cancellation token fires.
    pub fn connect(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.connection_loop().await })
    }

    pub async fn state(&self) -> ConnectionState {
        self.conn.lock().await.state
    }

    pub async fn session_id(&self) -> Option<String> {
        self.conn.lock().await.client_id.clone()
    }

    pub fn counters(&self) -> TransportCounters {
        TransportCounters {
            handshake_failures: self.stats.handshake_failures.load(Ordering::Relaxed),
            subscribe_failures: self.stats.subscribe_failures.load(Ordering::Relaxed),
            poll_failures: self.stats.poll_failures.load(Ordering::Relaxed),
        }
    }

    /// Registers a channel callback. Re-registering a channel replaces its
    /// callback. The registry is the source of truth for what should be
    /// subscribed: it is replayed in full on every reconnect, and if the
    /// client is currently polling the channel is also subscribed over the
    /// wire right away, best effort, without blocking the caller.
    pub async fn subscribe(self: &Arc<Self>, channel: impl Into<String>, callback: PayloadCallback) {
        let channel = channel.into();
        self.subscriptions
            .lock()
            .await
            .insert(channel.clone(), callback);

        let polling = { self.conn.lock().await.state == ConnectionState::Polling };
        if polling {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                if !client.subscribe_channel(&channel).await {
                    warn!(
                        channel = %channel,
                        "immediate subscribe failed; the next reconnect replay retries it"
                    );
                }
            });
        }
    }

    /// Removes the local registry entry. No wire-level unsubscribe is sent;
    /// the server-side subscription goes stale until the next re-handshake.
    pub async fn unsubscribe(&self, channel: &str) {
        self.subscriptions.lock().await.remove(channel);
    }

    /// Signals the connection loop to stop at its next phase boundary.
    /// In-flight requests race the same token, so a held-open poll does not
    /// delay shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn connection_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            let state = { self.conn.lock().await.state };
            match state {
                ConnectionState::Disconnected => {
                    {
                        self.conn.lock().await.state = ConnectionState::Handshaking;
                    }
                    if self.handshake().await {
                        let mut conn = self.conn.lock().await;
                        conn.state = ConnectionState::Connected;
                        conn.connected_at = Some(Instant::now());
                    } else {
                        self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                        self.conn.lock().await.state = ConnectionState::Disconnected;
                    }
                }
                ConnectionState::Handshaking => {
                    // Not reachable through this loop's own transitions.
                    tokio::time::sleep(HANDSHAKING_IDLE_DELAY).await;
                }
                ConnectionState::Connected => {
                    let channels: Vec<String> = {
                        self.subscriptions.lock().await.keys().cloned().collect()
                    };
                    for channel in channels {
                        if !self.subscribe_channel(&channel).await {
                            warn!(
                                channel = %channel,
                                "subscribe replay failed; entry kept for the next reconnect"
                            );
                        }
                    }
                    self.conn.lock().await.state = ConnectionState::Polling;
                }
                ConnectionState::Polling => {
                    let healthy = self.long_poll().await;
                    if !healthy {
                        self.stats.poll_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    let mut conn = self.conn.lock().await;
                    let expired = conn
                        .connected_at
                        .is_some_and(|started| started.elapsed() > self.options.max_connection_age);
                    if !healthy || expired {
                        if expired {
                            info!("connection age limit reached; forcing a re-handshake");
                        }
                        conn.state = ConnectionState::Disconnected;
                        conn.client_id = None;
                    }
                }
            }
        }
        debug!("bayeux connection loop stopped");
    }

    /// One handshake round trip. Success is a response whose first element
    /// carries a non-empty `clientId`.
    async fn handshake(&self) -> bool {
        let message = HandshakeRequest::new(self.next_seq());
        let Some(body) = self
            .post_message(&message, self.options.request_timeout)
            .await
        else {
            return false;
        };
        let Ok(responses) = serde_json::from_str::<Vec<HandshakeResponse>>(&body) else {
            debug!("handshake response was not a bayeux message array");
            return false;
        };
        let Some(client_id) = responses
            .into_iter()
            .next()
            .and_then(|response| response.client_id)
            .filter(|client_id| !client_id.is_empty())
        else {
            return false;
        };
        debug!(client_id = %client_id, "bayeux handshake complete");
        self.conn.lock().await.client_id = Some(client_id);
        true
    }

    /// Subscribes a single channel over the wire using the current session.
    async fn subscribe_channel(&self, channel: &str) -> bool {
        let Some(client_id) = self.session_id().await else {
            self.stats.subscribe_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let message = SubscribeRequest::new(
            client_id,
            channel,
            self.next_seq(),
            self.access_token.clone(),
            Utc::now().timestamp(),
        );
        let successful = match self
            .post_message(&message, self.options.request_timeout)
            .await
        {
            Some(body) => serde_json::from_str::<Vec<SubscribeResponse>>(&body)
                .ok()
                .and_then(|responses| responses.into_iter().next())
                .is_some_and(|response| response.successful),
            None => false,
        };
        if successful {
            debug!(channel = %channel, "subscribed");
        } else {
            self.stats.subscribe_failures.fetch_add(1, Ordering::Relaxed);
        }
        successful
    }

    /// One long-poll cycle. Returns whether the session is still healthy;
    /// any malformed envelope counts as a failed cycle.
    async fn long_poll(&self) -> bool {
        let Some(client_id) = self.session_id().await else {
            return false;
        };
        let message = ConnectRequest::new(client_id, self.next_seq());
        let Some(body) = self
            .post_message(&message, self.options.long_poll_timeout)
            .await
        else {
            return false;
        };

        let Ok(elements) = serde_json::from_str::<Vec<serde_json::Value>>(&body) else {
            debug!("long poll response was not a json array");
            return false;
        };
        if elements.len() < 2 {
            return false;
        }
        let Ok(status) = serde_json::from_value::<HandshakeResponse>(elements[0].clone()) else {
            return false;
        };
        let Ok(delivery) = serde_json::from_value::<EventDelivery>(elements[1].clone()) else {
            return false;
        };

        let callback = {
            self.subscriptions
                .lock()
                .await
                .get(&delivery.channel)
                .cloned()
        };
        match callback {
            Some(callback) => {
                let payload = delivery.data.to_string();
                // A panicking callback must not take down the transport loop.
                if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                    warn!(channel = %delivery.channel, "subscription callback panicked");
                }
            }
            None => {
                debug!(channel = %delivery.channel, "event for channel without a local subscription");
            }
        }

        status.successful
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Single time-bounded POST of `message` (wrapped in a one-element
    /// array) to the push endpoint. Network errors, timeouts, cancellation,
    /// and non-success statuses all collapse to `None`.
    async fn post_message<T: Serialize>(&self, message: &T, timeout: Duration) -> Option<String> {
        let request = self
            .http
            .post(&self.options.endpoint)
            .json(&[message])
            .timeout(timeout)
            .send();
        let response = tokio::select! {
            () = self.cancel.cancelled() => return None,
            response = request => response,
        };
        match response {
            Ok(response) if response.status().is_success() => response.text().await.ok(),
            Ok(response) => {
                debug!(status = %response.status(), "push endpoint returned non-success status");
                None
            }
            Err(err) => {
                debug!("push request failed: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/bayeux_tests.rs"]
mod tests;
