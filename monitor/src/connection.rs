//! Live-data Connection Manager
//!
//! Owns the single logical link to the live-data source: connect,
//! heartbeat, latency measurement, automatic reconnect with exponential
//! backoff, and status/error notification.

use crate::backoff::Backoff;
use crate::{ConnectionStatus, DataQuality, LinkPhase, MonitorError};
use chrono::Utc;
use fallwatch_link::{Connector, InboundFrame, Link, LinkError, OutboundFrame};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Status change callback
pub type StatusHandler = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// Error channel callback
pub type ErrorHandler = Arc<dyn Fn(&MonitorError) + Send + Sync>;

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// User the link identifies as
    pub user_id: String,
    /// Client type sent in `client_identification`
    pub client_type: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub reconnect: Backoff,
    /// Decoded frames buffered between the link reader and the consumer
    pub inbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user_id: "default".to_string(),
            client_type: "fallwatch_monitor".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect: Backoff::default(),
            inbound_capacity: 1024,
        }
    }
}

/// Connection manager.
///
/// Cheap to clone; all clones drive the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<LinkState>,
    session: Mutex<Session>,
    // Serializes connect attempts; never held together with `session`
    connect_lock: tokio::sync::Mutex<()>,
    status_handlers: RwLock<Vec<StatusHandler>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    frames_tx: mpsc::Sender<InboundFrame>,
    nonce: AtomicU64,
}

struct LinkState {
    status: ConnectionStatus,
    last_pong_at: Option<Instant>,
    pending_ping: Option<(u64, Instant)>,
}

/// Tasks and sender of the current link. `id` changes on every
/// successful connect and on every disconnect, so tasks holding an old
/// id know they are stale.
#[derive(Default)]
struct Session {
    id: u64,
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    /// Reconnect loop and the session id it replaces
    reconnect: Option<(u64, JoinHandle<()>)>,
}

impl ConnectionManager {
    /// Create a manager plus the receiver of decoded inbound frames.
    ///
    /// Heartbeat replies are consumed here; every other frame is forwarded.
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> (Self, mpsc::Receiver<InboundFrame>) {
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));

        let inner = Inner {
            config,
            connector,
            state: Mutex::new(LinkState {
                status: ConnectionStatus::default(),
                last_pong_at: None,
                pending_ping: None,
            }),
            session: Mutex::new(Session::default()),
            connect_lock: tokio::sync::Mutex::new(()),
            status_handlers: RwLock::new(Vec::new()),
            error_handlers: RwLock::new(Vec::new()),
            frames_tx: tx,
            nonce: AtomicU64::new(0),
        };

        (Self { inner: Arc::new(inner) }, rx)
    }

    /// Establish the link.
    ///
    /// Returns `true` when connected, including when already connected.
    /// On failure the error goes to the error channel, reconnect is
    /// scheduled and `false` is returned.
    pub async fn connect(&self) -> bool {
        let _guard = self.inner.connect_lock.lock().await;

        if self.inner.is_connected() {
            return true;
        }

        let id = self.inner.session_id();
        match self.inner.establish().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Connect to {} failed: {}", self.inner.connector.endpoint(), e);
                self.inner.report(MonitorError::Transport(e));
                self.inner.schedule_reconnect(id);
                false
            }
        }
    }

    /// Tear down the link and stop heartbeat and reconnect timers.
    ///
    /// Subscriptions and calibration live elsewhere and are not touched.
    pub fn disconnect(&self) {
        {
            let mut session = self.inner.session.lock().unwrap_or_else(PoisonError::into_inner);
            session.id += 1;
            session.outbound = None;
            let reconnect = session.reconnect.take().map(|(_, task)| task);
            for task in [session.reader.take(), session.heartbeat.take(), reconnect]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
        }

        self.inner.update(|s| {
            s.status.connected = false;
            s.status.phase = LinkPhase::Disconnected;
            s.status.reconnect_attempts = 0;
            s.last_pong_at = None;
            s.pending_ping = None;
        });

        tracing::info!("Disconnected from {}", self.inner.connector.endpoint());
    }

    /// Queue a frame for the source without waiting
    pub fn send(&self, frame: OutboundFrame) -> Result<(), LinkError> {
        self.inner.send(frame)
    }

    /// Current status snapshot
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner).status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn endpoint(&self) -> &str {
        self.inner.connector.endpoint()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Register a status callback, invoked after every status change
    pub fn on_status_change(&self, handler: impl Fn(&ConnectionStatus) + Send + Sync + 'static) {
        self.inner
            .status_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Register an error callback, invoked once per reported failure
    pub fn on_error(&self, handler: impl Fn(&MonitorError) + Send + Sync + 'static) {
        self.inner
            .error_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Publish an error on the error channel
    pub fn report_error(&self, error: MonitorError) {
        self.inner.report(error);
    }
}

impl Inner {
    fn is_connected(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).status.connected
    }

    fn session_id(&self) -> u64 {
        self.session.lock().unwrap_or_else(PoisonError::into_inner).id
    }

    fn send(&self, frame: OutboundFrame) -> Result<(), LinkError> {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outbound = session.outbound.as_ref().ok_or(LinkError::Closed)?;

        outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => LinkError::Closed,
        })
    }

    /// Mutate link state, refresh data quality and notify on change
    fn update(&self, f: impl FnOnce(&mut LinkState)) {
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let before = state.status.clone();

            f(&mut state);

            state.status.data_quality = DataQuality::assess(
                state.status.connected,
                state.status.latency_ms,
                state.last_pong_at.map(|t| t.elapsed()),
                self.config.heartbeat_interval,
            );

            (state.status != before).then(|| state.status.clone())
        };

        if let Some(status) = changed {
            let handlers = self.status_handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
            for handler in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(&status))).is_err() {
                    tracing::error!("Connection status handler panicked");
                }
            }
        }
    }

    fn report(&self, error: MonitorError) {
        tracing::debug!("Reporting error: {}", error);

        let handlers = self.error_handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&error))).is_err() {
                tracing::error!("Error handler panicked");
            }
        }
    }

    /// Open a link and start its reader and heartbeat tasks.
    /// Callers hold `connect_lock`.
    async fn establish(self: &Arc<Self>) -> Result<(), LinkError> {
        let expected_id = self.session_id();
        self.update(|s| {
            if s.status.phase != LinkPhase::Reconnecting {
                s.status.phase = LinkPhase::Connecting;
            }
        });

        let link = match tokio::time::timeout(self.config.connect_timeout, self.connector.connect()).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                self.mark_down();
                return Err(e);
            }
            Err(_) => {
                self.mark_down();
                return Err(LinkError::Timeout);
            }
        };

        let Link { outbound, inbound } = link;

        outbound
            .try_send(OutboundFrame::ClientIdentification {
                client_type: self.config.client_type.clone(),
                user_id: self.config.user_id.clone(),
            })
            .map_err(|_| LinkError::Closed)?;

        {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            if session.id != expected_id {
                // disconnect() ran while the connector was busy
                return Err(LinkError::Closed);
            }

            session.id += 1;
            let id = session.id;
            session.outbound = Some(outbound);

            for task in [session.reader.take(), session.heartbeat.take()].into_iter().flatten() {
                task.abort();
            }
            session.reader = Some(tokio::spawn(self.clone().read_loop(inbound, id)));
            session.heartbeat = Some(tokio::spawn(self.clone().heartbeat_loop(id)));
        }

        self.update(|s| {
            s.status.connected = true;
            s.status.phase = LinkPhase::Connected;
            s.status.reconnect_attempts = 0;
            s.status.last_heartbeat = Some(Utc::now());
            s.status.latency_ms = 0.0;
            s.last_pong_at = Some(Instant::now());
            s.pending_ping = None;
        });

        tracing::info!("Connected to {}", self.connector.endpoint());
        Ok(())
    }

    fn mark_down(&self) {
        self.update(|s| {
            s.status.connected = false;
            if s.status.phase == LinkPhase::Connecting {
                s.status.phase = LinkPhase::Disconnected;
            }
        });
    }

    async fn read_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<Result<InboundFrame, LinkError>>, id: u64) {
        while let Some(item) = inbound.recv().await {
            match item {
                Ok(InboundFrame::Pong { nonce }) => self.handle_pong(nonce),
                Ok(frame) => self.forward(frame),
                Err(e) => {
                    tracing::warn!("Dropping inbound frame: {}", e);
                    self.report(MonitorError::Transport(e));
                }
            }
        }

        self.link_lost(id);
    }

    fn forward(&self, frame: InboundFrame) {
        match self.frames_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!("Inbound backlog full, dropping {} frame", frame.kind());
                self.report(MonitorError::Backpressure(frame.kind()));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("No consumer for inbound frames");
            }
        }
    }

    fn handle_pong(&self, nonce: u64) {
        self.update(|s| {
            let now = Instant::now();
            if let Some((expected, sent_at)) = s.pending_ping {
                if expected == nonce {
                    s.status.latency_ms = now.duration_since(sent_at).as_secs_f64() * 1000.0;
                    s.pending_ping = None;
                }
            }
            s.last_pong_at = Some(now);
            s.status.last_heartbeat = Some(Utc::now());
        });
    }

    async fn heartbeat_loop(self: Arc<Self>, id: u64) {
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if self.session_id() != id {
                break;
            }

            let nonce = self.nonce.fetch_add(1, Ordering::Relaxed) + 1;
            self.update(|s| s.pending_ping = Some((nonce, Instant::now())));

            if let Err(e) = self.send(OutboundFrame::Ping { nonce }) {
                tracing::warn!("Heartbeat ping failed: {}", e);
            }
        }
    }

    /// Reader saw the link close. Stale readers (after disconnect or a
    /// newer link) do nothing.
    fn link_lost(self: &Arc<Self>, id: u64) {
        {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            if session.id != id {
                return;
            }
            session.outbound = None;
            session.reader = None;
            if let Some(heartbeat) = session.heartbeat.take() {
                heartbeat.abort();
            }
        }

        tracing::warn!("Link to {} lost", self.connector.endpoint());
        self.update(|s| {
            s.status.connected = false;
            s.status.phase = LinkPhase::Reconnecting;
            s.last_pong_at = None;
            s.pending_ping = None;
        });
        self.report(MonitorError::Transport(LinkError::Closed));
        self.schedule_reconnect(id);
    }

    fn schedule_reconnect(self: &Arc<Self>, id: u64) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.id != id {
            return;
        }
        if let Some((running_for, task)) = &session.reconnect {
            if *running_for == id && !task.is_finished() {
                return;
            }
        }

        session.reconnect = Some((id, tokio::spawn(self.clone().reconnect_loop(id))));
    }

    async fn reconnect_loop(self: Arc<Self>, id: u64) {
        let backoff = self.config.reconnect;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if !backoff.allows(attempt) {
                let attempts = attempt - 1;
                tracing::error!("Giving up on {} after {} reconnect attempts", self.connector.endpoint(), attempts);
                self.update(|s| s.status.phase = LinkPhase::Disconnected);
                self.report(MonitorError::ReconnectExhausted(attempts));
                break;
            }

            self.update(|s| {
                s.status.phase = LinkPhase::Reconnecting;
                s.status.reconnect_attempts = attempt;
            });

            let delay = backoff.delay(attempt);
            tracing::warn!("Reconnect attempt {} in {:?}", attempt, delay);
            tokio::time::sleep(delay).await;

            let _guard = self.connect_lock.lock().await;

            // Superseded by disconnect() or a manual connect()
            if self.session_id() != id || self.is_connected() {
                break;
            }

            match self.establish().await {
                Ok(()) => {
                    tracing::info!("Reconnected after {} attempts", attempt);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    self.report(MonitorError::Transport(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fallwatch_link::memory::{MemoryConnector, MemoryRemote};
    use tokio::time::sleep;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            user_id: "user-1".to_string(),
            reconnect: Backoff::new(Duration::from_secs(1), Duration::from_secs(30), Some(3)),
            ..Default::default()
        }
    }

    fn manager(config: ConnectionConfig) -> (ConnectionManager, mpsc::Receiver<InboundFrame>, MemoryRemote) {
        let (connector, remote) = MemoryConnector::new();
        let (manager, frames) = ConnectionManager::new(config, Arc::new(connector));
        (manager, frames, remote)
    }

    fn collect_errors(manager: &ConnectionManager) -> Arc<Mutex<Vec<String>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        manager.on_error(move |e| sink.lock().unwrap().push(e.to_string()));
        errors
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_and_identifies_client() {
        let (manager, _frames, remote) = manager(config());

        assert!(manager.connect().await);
        assert!(manager.connect().await);

        assert_eq!(remote.connect_count(), 1);
        let status = manager.status();
        assert!(status.connected);
        assert_eq!(status.phase, LinkPhase::Connected);
        assert_eq!(status.data_quality, DataQuality::Excellent);

        sleep(Duration::from_millis(1)).await;
        match remote.sent().first() {
            Some(OutboundFrame::ClientIdentification { user_id, client_type }) => {
                assert_eq!(user_id, "user-1");
                assert_eq!(client_type, "fallwatch_monitor");
            }
            other => panic!("expected identification first, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_records_round_trip() {
        let (manager, _frames, remote) = manager(config());
        assert!(manager.connect().await);
        let connected_at = manager.status().last_heartbeat;

        sleep(Duration::from_secs(31)).await;

        assert_eq!(remote.sent_of_kind("ping").len(), 1);
        let status = manager.status();
        assert!(status.last_heartbeat >= connected_at);
        assert!(status.latency_ms >= 0.0);
        assert_eq!(status.data_quality, DataQuality::Excellent);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_heartbeat_replies_degrade_quality() {
        let (manager, _frames, remote) = manager(config());
        remote.set_auto_pong(false);
        assert!(manager.connect().await);

        sleep(Duration::from_secs(91)).await;

        let status = manager.status();
        assert!(status.connected);
        assert_eq!(status.data_quality, DataQuality::Poor);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_transient_drop() {
        let (manager, _frames, remote) = manager(config());
        let history = Arc::new(Mutex::new(Vec::new()));
        let sink = history.clone();
        manager.on_status_change(move |s| sink.lock().unwrap().push((s.connected, s.reconnect_attempts)));
        let errors = collect_errors(&manager);

        assert!(manager.connect().await);
        remote.drop_link();
        sleep(Duration::from_millis(10)).await;

        let status = manager.status();
        assert!(!status.connected);
        assert_eq!(status.phase, LinkPhase::Reconnecting);
        assert_eq!(status.reconnect_attempts, 1);
        assert_eq!(status.data_quality, DataQuality::Offline);

        // First backoff step is 2s
        sleep(Duration::from_secs(3)).await;

        let status = manager.status();
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(remote.connect_count(), 2);
        assert_eq!(remote.sent_of_kind("client_identification").len(), 2);
        assert!(history.lock().unwrap().contains(&(false, 1)));
        assert_eq!(history.lock().unwrap().last().map(|h| h.0), Some(true));
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_max_attempts() {
        let (manager, _frames, remote) = manager(config());
        let errors = collect_errors(&manager);

        assert!(manager.connect().await);
        remote.set_refuse(true);
        remote.drop_link();

        sleep(Duration::from_secs(120)).await;

        assert_eq!(remote.connect_count(), 1 + 3);
        let status = manager.status();
        assert!(!status.connected);
        assert_eq!(status.phase, LinkPhase::Disconnected);
        assert_eq!(status.reconnect_attempts, 3);
        let errors = errors.lock().unwrap();
        assert!(errors.last().unwrap().contains("Reconnect abandoned after 3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_returns_false_and_retries_in_background() {
        let (manager, _frames, remote) = manager(config());
        let errors = collect_errors(&manager);
        remote.fail_next_connects(1);

        assert!(!manager.connect().await);
        assert_eq!(errors.lock().unwrap().len(), 1);

        sleep(Duration::from_secs(3)).await;
        assert!(manager.is_connected());
        assert_eq!(remote.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_timers() {
        let (manager, _frames, remote) = manager(config());
        assert!(manager.connect().await);

        manager.disconnect();
        let status = manager.status();
        assert!(!status.connected);
        assert_eq!(status.data_quality, DataQuality::Offline);

        sleep(Duration::from_secs(300)).await;
        assert!(remote.sent_of_kind("ping").is_empty());
        assert_eq!(remote.connect_count(), 1);
        assert!(manager.send(OutboundFrame::Ping { nonce: 1 }).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_backoff_stops_reconnecting() {
        let (manager, _frames, remote) = manager(config());
        assert!(manager.connect().await);

        remote.drop_link();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.status().phase, LinkPhase::Reconnecting);

        manager.disconnect();
        sleep(Duration::from_secs(60)).await;

        assert_eq!(remote.connect_count(), 1);
        assert_eq!(manager.status().phase, LinkPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_status_handler_does_not_block_others() {
        let (manager, _frames, _remote) = manager(config());
        let seen = Arc::new(AtomicU64::new(0));

        manager.on_status_change(|_| panic!("handler bug"));
        let counter = seen.clone();
        manager.on_status_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(manager.connect().await);
        assert!(seen.load(Ordering::SeqCst) >= 1);
        assert!(manager.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped_without_breaking_the_link() {
        let (manager, mut frames, remote) = manager(config());
        let errors = collect_errors(&manager);
        assert!(manager.connect().await);

        remote.push_raw("{\"type\":\"live_health_update\"").await.unwrap();
        remote
            .push(InboundFrame::EmergencyAck { alert_id: "a-1".to_string() })
            .await
            .unwrap();

        let forwarded = frames.recv().await.unwrap();
        assert_eq!(forwarded, InboundFrame::EmergencyAck { alert_id: "a-1".to_string() });
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(manager.is_connected());
    }
}
