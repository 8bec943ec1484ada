// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Supervised MQTT bus connection.
//!
//! The reconnect policy lives in [`Supervisor`], a synchronous state machine
//! with a single [`Supervisor::handle`] entry point. [`ConnectionManager`]
//! owns one driver task that performs the actions the supervisor asks for
//! and feeds the outcomes back as events:
//!
//! ```text
//! Disconnected --Start/TimerElapsed--> Connecting --ConnectSucceeded--> Connected
//!      ^                                   |                                |
//!      +------ ConnectFailed (retry) ------+------ ConnectionLost (restart) -+
//! ```
//!
//! Connect failures are retried after `retry_delay`, a lost connection is
//! re-established after `restart_delay`. Both are retried forever until
//! [`ConnectionManager::stop`].

use crate::config::MqttConfig;
use crate::router::TopicRouter;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Request channel capacity of the MQTT client.
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Bound on the driver shutdown in [`ConnectionManager::stop`].
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection manager not running")]
    NotRunning,

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
}

// ============================================================================
// State machine
// ============================================================================

/// Bus connection state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection, possibly waiting for a retry or restart timer.
    #[default]
    Disconnected,

    /// Connect handshake in flight.
    Connecting,

    /// Connected and subscribed.
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };
        write!(f, "{}", s)
    }
}

/// Inputs to the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Explicit start request.
    Start,

    /// A retry or restart timer fired.
    TimerElapsed,

    /// Connect handshake completed.
    ConnectSucceeded,

    /// Connect attempt failed or timed out.
    ConnectFailed,

    /// Transport closed or failed after being connected.
    ConnectionLost,

    /// Explicit stop request.
    Stop,
}

/// What the driver must do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do.
    Idle,

    /// Open a new connection.
    Connect,

    /// Subscribe and start dispatching messages.
    Subscribe,

    /// Wait, then report [`ConnectionEvent::TimerElapsed`].
    RetryAfter(Duration),

    /// Drop the current client, wait, then report
    /// [`ConnectionEvent::TimerElapsed`].
    RestartAfter(Duration),

    /// Drop the current client and stop.
    Disconnect,
}

/// Reconnect policy.
#[derive(Debug, Clone)]
pub struct Supervisor {
    state: ConnectionState,
    /// Set once a connection completed, cleared while a restart is pending
    /// and on stop.
    started: bool,
    stopped: bool,
    retry_delay: Duration,
    restart_delay: Duration,
}

impl Supervisor {
    pub fn new(retry_delay: Duration, restart_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            started: false,
            stopped: false,
            retry_delay,
            restart_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Apply an event and return the next action.
    pub fn handle(&mut self, event: ConnectionEvent) -> Action {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (event, self.state) {
            (E::Start, S::Disconnected) => {
                self.stopped = false;
                self.state = S::Connecting;
                Action::Connect
            }
            (E::Start, _) => {
                tracing::debug!("Already {}, ignoring start", self.state);
                Action::Idle
            }

            (E::TimerElapsed, S::Disconnected) if !self.stopped => {
                self.state = S::Connecting;
                Action::Connect
            }
            (E::TimerElapsed, _) => Action::Idle,

            (E::ConnectSucceeded, S::Connecting) => {
                tracing::info!("MQTT connected");
                self.state = S::Connected;
                self.started = true;
                Action::Subscribe
            }
            (E::ConnectFailed, S::Connecting) => {
                self.state = S::Disconnected;
                if self.stopped {
                    return Action::Idle;
                }
                tracing::warn!(
                    "MQTT connection failed, retrying in {:?}",
                    self.retry_delay
                );
                Action::RetryAfter(self.retry_delay)
            }
            (E::ConnectSucceeded | E::ConnectFailed, _) => Action::Idle,

            (E::ConnectionLost, _) => {
                if !self.started {
                    tracing::warn!("Cannot restart, not yet running");
                    return Action::Idle;
                }
                self.started = false;
                self.state = S::Disconnected;
                tracing::info!("Restarting in {:?}", self.restart_delay);
                Action::RestartAfter(self.restart_delay)
            }

            (E::Stop, previous) => {
                tracing::info!("Stopping");
                self.stopped = true;
                self.started = false;
                self.state = S::Disconnected;
                match previous {
                    S::Disconnected => Action::Idle,
                    S::Connecting | S::Connected => Action::Disconnect,
                }
            }
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Owns the bus connection and feeds inbound messages to the router.
pub struct ConnectionManager {
    config: MqttConfig,
    router: Arc<TopicRouter>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: MqttConfig, router: Arc<TopicRouter>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            router,
            state: Arc::new(state),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Spawn the driver task. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::debug!("Connection manager already running");
            return;
        }

        tracing::info!(
            "Connecting to MQTT broker {}:{}",
            self.config.host,
            self.config.port
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = Driver {
            config: self.config.clone(),
            router: Arc::clone(&self.router),
            state: Arc::clone(&self.state),
        };
        *task = Some(tokio::spawn(driver.run(shutdown_rx)));
        *self.shutdown.lock() = Some(shutdown_tx);
    }

    /// Disconnect and stop the driver task.
    ///
    /// Pending retry or restart timers are cancelled.
    pub async fn stop(&self) -> Result<(), ConnectionError> {
        let shutdown = self.shutdown.lock().take();
        let task = self.task.lock().take();
        let (Some(shutdown), Some(mut task)) = (shutdown, task) else {
            return Err(ConnectionError::NotRunning);
        };

        let _ = shutdown.send(true);
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!("Connection driver did not stop in {:?}, aborting", STOP_TIMEOUT);
            task.abort();
        }
        self.state.send_replace(ConnectionState::Disconnected);
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

struct Driver {
    config: MqttConfig,
    router: Arc<TopicRouter>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Driver {
    fn options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive());
        options.set_inflight(self.config.max_inflight);
        options.set_clean_session(true);
        options.set_manual_acks(true);
        options
    }

    fn publish_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!("MQTT state: {} -> {}", current, state);
            *current = state;
            true
        });
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut supervisor =
            Supervisor::new(self.config.retry_delay(), self.config.restart_delay());
        let mut session: Option<Session> = None;
        let mut action = supervisor.handle(ConnectionEvent::Start);

        loop {
            self.publish_state(supervisor.state());
            let event = match action {
                Action::Connect => {
                    tokio::select! {
                        result = self.connect() => match result {
                            Ok(s) => {
                                session = Some(s);
                                ConnectionEvent::ConnectSucceeded
                            }
                            Err(e) => {
                                tracing::warn!("MQTT connect error: {}", e);
                                ConnectionEvent::ConnectFailed
                            }
                        },
                        _ = stop_requested(&mut shutdown) => ConnectionEvent::Stop,
                    }
                }
                Action::Subscribe => match session.as_mut() {
                    Some(s) => {
                        let event = self.serve(s, &mut shutdown).await;
                        if event == ConnectionEvent::ConnectionLost {
                            // Polling a dead event loop would reconnect it.
                            session = None;
                        }
                        event
                    }
                    None => ConnectionEvent::ConnectionLost,
                },
                Action::RetryAfter(delay) | Action::RestartAfter(delay) => {
                    if let Some(s) = session.take() {
                        disconnect(s).await;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => ConnectionEvent::TimerElapsed,
                        _ = stop_requested(&mut shutdown) => ConnectionEvent::Stop,
                    }
                }
                Action::Disconnect => {
                    if let Some(s) = session.take() {
                        disconnect(s).await;
                    }
                    break;
                }
                Action::Idle => {
                    if supervisor.is_stopped() {
                        break;
                    }
                    stop_requested(&mut shutdown).await;
                    ConnectionEvent::Stop
                }
            };
            action = supervisor.handle(event);
        }

        self.publish_state(ConnectionState::Disconnected);
        tracing::info!("MQTT connection manager stopped");
    }

    /// Open a connection and wait for the broker's CONNACK.
    async fn connect(&self) -> Result<Session, ConnectionError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), CLIENT_CHANNEL_CAPACITY);
        let timeout = self.config.connect_timeout();

        tokio::time::timeout(timeout, wait_connack(&mut eventloop))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;

        Ok(Session { client, eventloop })
    }

    /// Subscribe, then dispatch inbound messages until the connection ends.
    async fn serve(
        &self,
        session: &mut Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ConnectionEvent {
        let filters: Vec<SubscribeFilter> = self
            .router
            .subscriptions()
            .into_iter()
            .map(|f| SubscribeFilter::new(f.to_string(), QoS::AtMostOnce))
            .collect();
        if filters.is_empty() {
            tracing::warn!("No enabled router entry, nothing to subscribe");
        } else {
            tracing::info!("Subscribing to {} filter(s)", filters.len());
            if let Err(e) = session.client.subscribe_many(filters).await {
                tracing::warn!("MQTT subscribe failed: {}", e);
                return ConnectionEvent::ConnectionLost;
            }
        }
        tracing::info!("MQTT ready");

        loop {
            tokio::select! {
                polled = session.eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        tracing::debug!("Got msg on {}", publish.topic);
                        self.router.dispatch(&publish.topic, &publish.payload);
                        // Acknowledged whatever the dispatch outcome.
                        if let Err(e) = session.client.try_ack(&publish) {
                            tracing::debug!("Could not ack {}: {}", publish.topic, e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        tracing::info!("MQTT closed by broker, restart");
                        return ConnectionEvent::ConnectionLost;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("MQTT connection error: {}", e);
                        return ConnectionEvent::ConnectionLost;
                    }
                },
                _ = stop_requested(shutdown) => return ConnectionEvent::Stop,
            }
        }
    }
}

async fn wait_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// Resolve once a stop is requested or the manager is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn disconnect(mut session: Session) {
    if session.client.try_disconnect().is_ok() {
        // Flush the DISCONNECT packet; the error that follows is expected.
        let _ = tokio::time::timeout(Duration::from_secs(1), session.eventloop.poll()).await;
    }
}
