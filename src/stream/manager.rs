//! Push-stream lifecycle: connect, subscribe, heartbeat, reconnect,
//! reconcile.
//!
//! The transport is abstract so the daemon logic is independent of the
//! wire library; the default implementation speaks JSON text frames over
//! tokio-tungstenite. On every successful (re)connect the stored
//! subscriptions replay in registration order and a `Reconnected` signal
//! tells the router to reconcile state against REST truth.

use super::health::HealthMonitor;
use crate::api::convert::{WireAccount, WireOrder, WirePosition, WireQuote, WireTrade};
use crate::api::{ApiError, TokenManager};
use crate::config::StreamConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    TokenRefresh,
    PermanentlyDisconnected,
}

/// Subscriptions replay verbatim after every reconnect, in the order they
/// were first registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "method", rename_all_fields = "camelCase")]
pub enum Subscription {
    SubscribeTrades { account_id: i64 },
    SubscribePositions { account_id: i64 },
    SubscribeOrders { account_id: i64 },
    SubscribeContractQuotes { contract_id: String },
}

/// Server push payloads, tagged the way the gateway tags them.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    #[serde(rename = "GatewayUserTrade")]
    UserTrade(WireTrade),
    #[serde(rename = "GatewayUserPosition")]
    UserPosition(WirePosition),
    #[serde(rename = "GatewayUserOrder")]
    UserOrder(WireOrder),
    #[serde(rename = "GatewayUserAccount")]
    UserAccount(WireAccount),
    #[serde(rename = "GatewayQuote")]
    Quote(WireQuote),
}

/// What the router receives from a stream manager.
#[derive(Debug)]
pub enum StreamSignal {
    Event(GatewayEvent),
    /// Connection (re)established and subscriptions replayed.
    Reconnected,
    /// Retry budget exhausted; the stream will not come back on its own.
    PermanentlyDisconnected,
}

#[async_trait]
pub trait StreamConnection: Send {
    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), ApiError>;
    /// `None` means the connection is gone.
    async fn next_event(&mut self) -> Option<GatewayEvent>;
    async fn ping(&mut self) -> Result<Duration, ApiError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        token: &str,
    ) -> Result<Box<dyn StreamConnection>, ApiError>;
}

/// Reconnect pacing: fixed delay ladder saturating at the last entry,
/// bounded by attempt count and total elapsed time.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    delays: Vec<Duration>,
    max_attempts: u32,
    max_elapsed: Duration,
}

impl ReconnectSchedule {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            delays: config
                .retry_delays_secs
                .iter()
                .map(|&s| Duration::from_secs(s))
                .collect(),
            max_attempts: config.max_attempts,
            max_elapsed: Duration::from_secs(config.max_reconnect_secs),
        }
    }

    /// Delay before attempt `n` (0-based), saturating at the tail.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(index).copied().unwrap_or(Duration::ZERO)
    }

    pub fn should_retry(&self, attempt: u32, elapsed: Duration) -> bool {
        attempt < self.max_attempts && elapsed < self.max_elapsed
    }
}

enum Command {
    Subscribe(Subscription),
    Shutdown,
}

pub struct StreamManager {
    name: &'static str,
    url: String,
    config: StreamConfig,
    transport: Arc<dyn StreamTransport>,
    tokens: Arc<TokenManager>,
    subscriptions: Mutex<Vec<Subscription>>,
    state: Mutex<ConnectionState>,
    pub health: Arc<HealthMonitor>,
    cmd_tx: mpsc::Sender<Command>,
}

impl StreamManager {
    /// Spawn the connection worker; `signals` receives events and
    /// lifecycle notifications.
    pub fn spawn(
        name: &'static str,
        url: String,
        config: StreamConfig,
        transport: Arc<dyn StreamTransport>,
        tokens: Arc<TokenManager>,
        signals: mpsc::Sender<StreamSignal>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let health = Arc::new(HealthMonitor::new(Duration::from_secs(
            config.stale_threshold_secs,
        )));
        let manager = Arc::new(Self {
            name,
            url,
            config,
            transport,
            tokens,
            subscriptions: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::Disconnected),
            health,
            cmd_tx,
        });

        let worker = manager.clone();
        tokio::spawn(async move {
            worker.run(cmd_rx, signals).await;
        });
        manager
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(stream = self.name, from = ?*current, to = ?state, "stream state transition");
            *current = state;
        }
    }

    /// Register a subscription; it is replayed on every reconnect. If the
    /// stream is live it is also sent immediately.
    pub fn subscribe(&self, subscription: Subscription) {
        {
            let mut subscriptions = self.subscriptions.lock();
            if subscriptions.contains(&subscription) {
                return;
            }
            subscriptions.push(subscription.clone());
        }
        let _ = self.cmd_tx.try_send(Command::Subscribe(subscription));
    }

    /// Intentional shutdown: no reconnection attempts follow.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    async fn run(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<Command>, signals: mpsc::Sender<StreamSignal>) {
        let schedule = ReconnectSchedule::from_config(&self.config);
        let mut first_cycle = true;

        'reconnect: loop {
            if !first_cycle {
                self.set_state(ConnectionState::Reconnecting);
            }
            let mut connection = match self
                .connect_with_backoff(&schedule, &mut cmd_rx, first_cycle)
                .await
            {
                Some(connection) => connection,
                None => {
                    self.set_state(ConnectionState::PermanentlyDisconnected);
                    error!(stream = self.name, "stream permanently disconnected");
                    let _ = signals.send(StreamSignal::PermanentlyDisconnected).await;
                    return;
                }
            };
            first_cycle = false;

            // Replay subscriptions in registration order; one failure does
            // not abort the replay. `sent` absorbs queued Subscribe
            // commands that raced the replay.
            let mut sent: std::collections::HashSet<Subscription> = std::collections::HashSet::new();
            let to_replay = self.subscriptions.lock().clone();
            for subscription in &to_replay {
                sent.insert(subscription.clone());
                if let Err(err) = connection.subscribe(subscription).await {
                    warn!(
                        stream = self.name,
                        ?subscription,
                        error = %err,
                        "subscription replay failed"
                    );
                }
            }
            self.set_state(ConnectionState::Connected);
            self.health.reset();
            info!(
                stream = self.name,
                subscriptions = to_replay.len(),
                "stream connected, subscriptions replayed"
            );
            let _ = signals.send(StreamSignal::Reconnected).await;

            let mut ping_timer =
                tokio::time::interval(Duration::from_secs(self.config.ping_interval_secs));
            ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ping_timer.reset();

            loop {
                tokio::select! {
                    _ = ping_timer.tick() => {
                        let timeout = Duration::from_secs(self.config.ping_timeout_secs);
                        match tokio::time::timeout(timeout, connection.ping()).await {
                            Ok(Ok(latency)) => self.health.record_ping(true, latency),
                            Ok(Err(err)) => {
                                warn!(stream = self.name, error = %err, "ping failed");
                                self.health.record_ping(false, Duration::ZERO);
                            }
                            Err(_) => {
                                warn!(stream = self.name, "ping timed out");
                                self.health.record_ping(false, timeout);
                            }
                        }
                        if self.health.is_stale() {
                            warn!(stream = self.name, "stream stale, forcing reconnect");
                            connection.close().await;
                            continue 'reconnect;
                        }
                    }
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(Command::Subscribe(subscription)) => {
                                if sent.insert(subscription.clone()) {
                                    if let Err(err) = connection.subscribe(&subscription).await {
                                        warn!(stream = self.name, error = %err, "subscribe failed");
                                    }
                                }
                            }
                            Some(Command::Shutdown) | None => {
                                info!(stream = self.name, "stream shutting down");
                                connection.close().await;
                                self.set_state(ConnectionState::Disconnected);
                                return;
                            }
                        }
                    }
                    event = connection.next_event() => {
                        match event {
                            Some(event) => {
                                self.health.record_event();
                                if signals.send(StreamSignal::Event(event)).await.is_err() {
                                    // Router gone; stop the worker.
                                    connection.close().await;
                                    self.set_state(ConnectionState::Disconnected);
                                    return;
                                }
                            }
                            None => {
                                warn!(stream = self.name, "stream connection lost");
                                continue 'reconnect;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn connect_with_backoff(
        &self,
        schedule: &ReconnectSchedule,
        cmd_rx: &mut mpsc::Receiver<Command>,
        first_cycle: bool,
    ) -> Option<Box<dyn StreamConnection>> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if !first_cycle || attempt > 0 {
                let delay = schedule.delay_for(attempt);
                if !delay.is_zero() {
                    info!(
                        stream = self.name,
                        attempt,
                        delay_s = delay.as_secs(),
                        "waiting before reconnect attempt"
                    );
                    // A shutdown command during the wait must win.
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(Command::Subscribe(_)) => {} // already stored
                                Some(Command::Shutdown) | None => return None,
                            }
                        }
                    }
                }
            }

            self.set_state(if first_cycle && attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            let token = match self.tokens.get_token().await {
                Ok(token) => token,
                Err(err) => {
                    // Pause the reconnect cycle while auth recovers.
                    self.set_state(ConnectionState::TokenRefresh);
                    warn!(stream = self.name, error = %err, "token unavailable for stream connect");
                    attempt += 1;
                    if !schedule.should_retry(attempt, started.elapsed()) {
                        return None;
                    }
                    continue;
                }
            };

            match self.transport.connect(&self.url, &token).await {
                Ok(connection) => return Some(connection),
                Err(err) => {
                    warn!(
                        stream = self.name,
                        attempt,
                        error = %err,
                        "stream connect attempt failed"
                    );
                    attempt += 1;
                    if !schedule.should_retry(attempt, started.elapsed()) {
                        return None;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// tokio-tungstenite transport
// ---------------------------------------------------------------------------

pub struct WebSocketTransport;

struct WebSocketConnection {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
        token: &str,
    ) -> Result<Box<dyn StreamConnection>, ApiError> {
        let url = format!("{url}?access_token={token}");
        let (stream, response) =
            tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ApiError::Transient {
                    status: None,
                    message: format!("websocket connect failed: {e}"),
                })?;
        debug!(status = %response.status(), "websocket connected");
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

#[async_trait]
impl StreamConnection for WebSocketConnection {
    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), ApiError> {
        let payload = serde_json::to_string(subscription).map_err(|e| ApiError::Permanent {
            status: None,
            message: format!("unserializable subscription: {e}"),
        })?;
        self.stream
            .send(Message::Text(payload))
            .await
            .map_err(|e| ApiError::Transient {
                status: None,
                message: format!("subscribe send failed: {e}"),
            })
    }

    async fn next_event(&mut self) -> Option<GatewayEvent> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<GatewayEvent>(&text) {
                    Ok(event) => return Some(event),
                    Err(err) => {
                        debug!(error = %err, "ignoring unparseable stream frame");
                    }
                },
                Ok(Message::Ping(payload)) => {
                    let _ = self.stream.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket close frame");
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "websocket read error");
                    return None;
                }
            }
        }
    }

    async fn ping(&mut self) -> Result<Duration, ApiError> {
        let started = Instant::now();
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| ApiError::Transient {
                status: None,
                message: format!("ping send failed: {e}"),
            })?;
        Ok(started.elapsed())
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
