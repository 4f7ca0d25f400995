//! Monitor Service
//!
//! Wires the connection manager, subscription registry, fall detector and
//! alert state machine together and exposes the control API.

use crate::alert::{AlertConfig, AlertEvent, AlertStateError, EmergencyAlertStateMachine, PendingAlert};
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::detection::{CalibrationModel, DetectionConfig, FallDetectionEngine, FallRisk, SampleHistory};
use crate::history::HistorySink;
use crate::notify::{DispatchError, NotificationDispatcher};
use crate::subscription::{RegistryConfig, Subscription, SubscriptionError, SubscriptionRegistry};
use crate::{ConnectionStatus, FallEvent, FallSource, MonitorError, MonitorObserver, Severity};
use fallwatch_link::{
    Connector, EmergencyNotification, InboundFrame, LinkError, LiveMetric, MetricType, MotionSample, OutboundFrame,
    SampleProvider,
};
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Service configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub connection: ConnectionConfig,
    pub registry: RegistryConfig,
    pub detection: DetectionConfig,
    pub alert: AlertConfig,
    /// How long the source has to acknowledge an emergency notification
    pub ack_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            registry: RegistryConfig::default(),
            detection: DetectionConfig::default(),
            alert: AlertConfig::default(),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Sends emergency notifications over the live link and waits for the
/// source's `emergency_ack`
pub struct LinkDispatcher {
    connection: ConnectionManager,
    ack_timeout: Duration,
    waiting: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl LinkDispatcher {
    pub fn new(connection: ConnectionManager, ack_timeout: Duration) -> Self {
        Self {
            connection,
            ack_timeout,
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a waiting dispatch. Returns `false` for unknown or late acks.
    pub fn acknowledge(&self, alert_id: &str) -> bool {
        let waiter = self.waiting.lock().unwrap_or_else(PoisonError::into_inner).remove(alert_id);
        match waiter {
            Some(tx) => tx.send(()).is_ok(),
            None => {
                tracing::debug!("Ignoring ack for unknown alert {}", alert_id);
                false
            }
        }
    }

    fn forget(&self, alert_id: &str) {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner).remove(alert_id);
    }
}

impl NotificationDispatcher for LinkDispatcher {
    fn name(&self) -> &str {
        "link"
    }

    fn dispatch<'a>(
        &'a self,
        alert_id: &'a str,
        notification: &'a EmergencyNotification,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            if !self.connection.is_connected() {
                return Err(DispatchError::Unavailable(format!("{} is not connected", self.connection.endpoint())));
            }

            let (tx, rx) = oneshot::channel();
            self.waiting
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(alert_id.to_string(), tx);

            let frame = OutboundFrame::EmergencyAlert {
                alert_id: alert_id.to_string(),
                data: notification.clone(),
            };
            if let Err(e) = self.connection.send(frame) {
                self.forget(alert_id);
                return Err(DispatchError::Unavailable(e.to_string()));
            }

            match tokio::time::timeout(self.ack_timeout, rx).await {
                Ok(Ok(())) => Ok(()),
                _ => {
                    self.forget(alert_id);
                    Err(DispatchError::Unacknowledged(alert_id.to_string()))
                }
            }
        })
    }
}

/// The monitor: one per wearer, shared as `Arc<MonitorService>`
pub struct MonitorService {
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    detector: FallDetectionEngine,
    alerts: EmergencyAlertStateMachine,
    link_dispatcher: Arc<LinkDispatcher>,
    samples: Mutex<SampleHistory>,
    observers: RwLock<Vec<Arc<dyn MonitorObserver>>>,
    was_connected: AtomicBool,
    /// Motion samples waiting for detection
    sample_tx: mpsc::Sender<MotionSample>,
    /// Metrics waiting for subscriber fan-out
    metric_tx: mpsc::Sender<LiveMetric>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MonitorService {
    /// Build the service and start its inbound pump plus the detection and
    /// fan-out tasks. Must be called inside a Tokio runtime; call
    /// [`MonitorService::connect`] to go live.
    pub fn start(config: MonitorConfig, connector: Arc<dyn Connector>, history: Arc<dyn HistorySink>) -> Arc<Self> {
        let (connection, frames) = ConnectionManager::new(config.connection.clone(), connector);
        let link_dispatcher = Arc::new(LinkDispatcher::new(connection.clone(), config.ack_timeout));
        let alerts = EmergencyAlertStateMachine::new(config.alert.clone(), link_dispatcher.clone(), history);
        let capacity = config.connection.inbound_capacity.max(1);
        let (sample_tx, sample_rx) = mpsc::channel(capacity);
        let (metric_tx, metric_rx) = mpsc::channel(capacity);

        let service = Arc::new_cyclic(|weak: &Weak<MonitorService>| {
            let w = weak.clone();
            connection.on_status_change(move |status| {
                if let Some(service) = w.upgrade() {
                    service.handle_status(status);
                }
            });

            let w = weak.clone();
            connection.on_error(move |error| {
                if let Some(service) = w.upgrade() {
                    service.notify(|o| o.on_error(error));
                }
            });

            let w = weak.clone();
            alerts.on_event(move |event| {
                if let Some(service) = w.upgrade() {
                    service.notify(|o| o.on_alert(event));
                }
            });

            let w = weak.clone();
            alerts.on_error(move |error| {
                if let Some(service) = w.upgrade() {
                    service.notify(|o| o.on_error(error));
                }
            });

            Self {
                connection,
                registry: SubscriptionRegistry::new(config.registry),
                detector: FallDetectionEngine::new(config.detection.clone()),
                alerts,
                link_dispatcher,
                samples: Mutex::new(SampleHistory::new(config.detection.history_limit)),
                observers: RwLock::new(Vec::new()),
                was_connected: AtomicBool::new(false),
                sample_tx,
                metric_tx,
                tasks: Mutex::new(Vec::new()),
            }
        });

        let tasks = [
            tokio::spawn(pump(Arc::downgrade(&service), frames)),
            tokio::spawn(detect(Arc::downgrade(&service), sample_rx)),
            tokio::spawn(fan_out(Arc::downgrade(&service), metric_rx)),
        ];
        service.tasks.lock().unwrap_or_else(PoisonError::into_inner).extend(tasks);

        service
    }

    pub async fn connect(&self) -> bool {
        self.connection.connect().await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Disconnect and stop the background tasks and all providers
    pub fn shutdown(&self) {
        self.connection.disconnect();
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn MonitorObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Register a subscription and announce it if the link is up
    pub fn subscribe(&self, subscription: Subscription) -> Result<String, SubscriptionError> {
        let frame = OutboundFrame::SubscribeHealthUpdates {
            subscription_id: subscription.id.clone(),
            metrics: subscription.sorted_types(),
        };
        let id = self.registry.subscribe(subscription)?;

        if self.connection.is_connected() {
            if let Err(e) = self.connection.send(frame) {
                tracing::warn!("Subscription {} not announced yet: {}", id, e);
            }
        }

        Ok(id)
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.registry.unsubscribe(id);

        if removed && self.connection.is_connected() {
            let frame = OutboundFrame::UnsubscribeHealthUpdates {
                subscription_id: id.to_string(),
            };
            if let Err(e) = self.connection.send(frame) {
                tracing::warn!("Unsubscribe {} not announced: {}", id, e);
            }
        }

        removed
    }

    pub fn calibrate(&self, sample: &MotionSample) -> CalibrationModel {
        self.detector.calibrate(sample)
    }

    /// Raise an alert without a detected fall
    pub fn trigger_emergency(
        &self,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<PendingAlert, AlertStateError> {
        let window = self
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(FallEvent::WINDOW_LIMIT);
        let event = FallEvent::new(Severity::High, FallSource::Manual).with_window(window);

        self.alerts.trigger(event, payload)
    }

    pub fn cancel_pending_emergency(&self) -> Result<FallEvent, AlertStateError> {
        self.alerts.cancel()
    }

    pub fn confirm_pending_emergency(&self) -> Result<FallEvent, AlertStateError> {
        self.alerts.confirm()
    }

    /// Feed one motion sample through detection.
    ///
    /// Returns the fall event when this sample was detected as a fall.
    pub fn ingest_sample(&self, sample: MotionSample) -> Option<FallEvent> {
        let warmup = self.detector.config().warmup_samples;

        let (prior, warm) = {
            let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            let prior = samples.recent(FallEvent::WINDOW_LIMIT - 1);
            samples.push(sample.clone());
            (prior, samples.len() > warmup)
        };

        if !warm {
            return None;
        }

        let detection = self.detector.evaluate(&sample, &prior);
        if !detection.is_fall {
            return None;
        }

        let mut window = prior;
        window.push(sample.clone());
        let event = FallEvent::new(detection.severity, FallSource::Detected).with_window(window);

        tracing::warn!(
            impact = detection.impact_magnitude,
            rotation = detection.rotation_magnitude,
            heart_rate_delta = detection.heart_rate_delta,
            "Fall detected ({}) on {}",
            detection.severity,
            if sample.device_id.is_empty() { "unknown device" } else { &sample.device_id }
        );

        self.notify(|o| o.on_fall_event(&event));

        let mut payload = serde_json::Map::new();
        payload.insert("impactMagnitude".to_string(), detection.impact_magnitude.into());
        payload.insert("rotationMagnitude".to_string(), detection.rotation_magnitude.into());
        payload.insert("heartRateDelta".to_string(), detection.heart_rate_delta.into());
        payload.insert("deviceId".to_string(), sample.device_id.clone().into());

        match self.alerts.trigger(event.clone(), payload) {
            Ok(_) => {}
            Err(AlertStateError::AlreadyPending(id)) => {
                tracing::debug!("Fall {} folded into pending alert {}", event.id, id);
            }
            Err(e) => tracing::debug!("Alert not raised for {}: {}", event.id, e),
        }

        self.queue_metric(LiveMetric::new(
            MetricType::FallEvent,
            event.severity.as_str(),
            &sample.device_id,
            sample.confidence,
        ));

        Some(event)
    }

    /// Fan one metric out to observers and matching subscriptions on the
    /// calling thread. Returns how many subscriptions received it.
    pub fn ingest_metric(&self, metric: LiveMetric) -> usize {
        self.notify(|o| o.on_live_metric(&metric));

        let report = self.registry.dispatch(&metric);
        for failure in report.failures {
            self.connection.report_error(failure);
        }

        report.delivered
    }

    /// Poll `provider` every `interval` and ingest its samples until it runs dry
    pub fn spawn_provider(self: &Arc<Self>, mut provider: Box<dyn SampleProvider>, interval: Duration) {
        let weak = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            tracing::info!("Sample provider {} started", provider.name());

            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };

                match provider.next_sample() {
                    Ok(Some(sample)) => {
                        service.ingest_sample(sample);
                    }
                    Ok(None) => {
                        tracing::info!("Sample provider {} exhausted", provider.name());
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Sample provider {} failed: {}", provider.name(), e);
                        service.connection.report_error(MonitorError::Transport(e));
                    }
                }
            }
        });

        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(task);
    }

    pub fn assess_risk(&self) -> FallRisk {
        let recent = self
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(self.detector.config().risk_window);
        self.detector.assess_risk(&recent)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn detector(&self) -> &FallDetectionEngine {
        &self.detector
    }

    pub fn alerts(&self) -> &EmergencyAlertStateMachine {
        &self.alerts
    }

    fn handle_status(&self, status: &ConnectionStatus) {
        let was_connected = self.was_connected.swap(status.connected, Ordering::SeqCst);
        if status.connected && !was_connected {
            self.announce_subscriptions();
        }

        self.notify(|o| o.on_connection_status_change(status));
    }

    fn announce_subscriptions(&self) {
        for subscription in self.registry.snapshot() {
            let frame = OutboundFrame::SubscribeHealthUpdates {
                subscription_id: subscription.id.clone(),
                metrics: subscription.sorted_types(),
            };
            if let Err(e) = self.connection.send(frame) {
                tracing::warn!("Failed to announce subscription {}: {}", subscription.id, e);
            }
        }
    }

    fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::LiveHealthUpdate { data, .. } => {
                self.queue_metric(data);
            }
            InboundFrame::MotionSample { data } => {
                if let Err(e) = self.sample_tx.try_send(data) {
                    self.queue_full("motion_sample", e);
                }
            }
            InboundFrame::EmergencyAck { alert_id } => {
                self.link_dispatcher.acknowledge(&alert_id);
            }
            InboundFrame::ConnectionEstablished { client_id, .. } => {
                tracing::info!("Source assigned client id {}", client_id);
            }
            InboundFrame::Error { message } => {
                tracing::warn!("Source reported error: {}", message);
                self.connection.report_error(MonitorError::Transport(LinkError::Remote(message)));
            }
            InboundFrame::Pong { .. } => {}
        }
    }

    fn queue_metric(&self, metric: LiveMetric) {
        if let Err(e) = self.metric_tx.try_send(metric) {
            self.queue_full("live_health_update", e);
        }
    }

    fn queue_full<T>(&self, kind: &'static str, error: mpsc::error::TrySendError<T>) {
        match error {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!("{} queue full, dropping item", kind);
                self.connection.report_error(MonitorError::Backpressure(kind));
            }
            mpsc::error::TrySendError::Closed(_) => {
                tracing::debug!("{} queue closed", kind);
            }
        }
    }

    fn notify(&self, f: impl Fn(&dyn MonitorObserver)) {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                tracing::error!("Monitor observer panicked");
            }
        }
    }
}

async fn pump(service: Weak<MonitorService>, mut frames: mpsc::Receiver<InboundFrame>) {
    while let Some(frame) = frames.recv().await {
        let Some(service) = service.upgrade() else {
            break;
        };
        service.handle_frame(frame);
    }
    tracing::debug!("Inbound pump stopped");
}

async fn detect(service: Weak<MonitorService>, mut samples: mpsc::Receiver<MotionSample>) {
    while let Some(sample) = samples.recv().await {
        let Some(service) = service.upgrade() else {
            break;
        };
        service.ingest_sample(sample);
    }
    tracing::debug!("Detection task stopped");
}

async fn fan_out(service: Weak<MonitorService>, mut metrics: mpsc::Receiver<LiveMetric>) {
    while let Some(metric) = metrics.recv().await {
        let Some(service) = service.upgrade() else {
            break;
        };

        // Subscriber callbacks are synchronous and may block
        let delivery = tokio::task::spawn_blocking(move || {
            service.ingest_metric(metric);
        });
        if let Err(e) = delivery.await {
            tracing::error!("Metric fan-out failed: {}", e);
        }
    }
    tracing::debug!("Fan-out task stopped");
}

/// Observer forwarding alert lifecycle events to a channel
pub struct AlertChannel {
    tx: mpsc::UnboundedSender<AlertEvent>,
}

impl AlertChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MonitorObserver for AlertChannel {
    fn on_alert(&self, event: &AlertEvent) {
        let _ = self.tx.send(event.clone());
    }
}
