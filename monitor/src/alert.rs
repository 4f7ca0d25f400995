//! Emergency Alert State Machine
//!
//! `Idle -> Pending -> {Confirmed | Cancelled} -> Idle`. A pending alert
//! owns one countdown task; whichever of cancel, confirm or expiry takes
//! the slot first decides the outcome.

use crate::backoff::Backoff;
use crate::history::HistorySink;
use crate::notify::{DispatchError, NotificationDispatcher};
use crate::{FallEvent, MonitorError};
use chrono::{DateTime, Utc};
use fallwatch_link::{EmergencyNotification, Location};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type AlertHandler = Arc<dyn Fn(&AlertEvent) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&MonitorError) + Send + Sync>;

/// Alert configuration
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Time the user has to cancel before contacts are notified
    pub countdown: Duration,
    /// Retry policy for notification dispatch
    pub retry: Backoff,
    pub recipients: Vec<String>,
    pub location: Option<Location>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(30),
            retry: Backoff::new(Duration::from_secs(2), Duration::from_secs(30), Some(3)),
            recipients: Vec::new(),
            location: None,
        }
    }
}

/// The single outstanding alert
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAlert {
    pub id: String,
    pub expires_at: Instant,
    /// Wall-clock equivalent of `expires_at`
    pub deadline: DateTime<Utc>,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub source_event: FallEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Idle,
    Pending,
}

/// Alert lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    Pending {
        alert_id: String,
        event: FallEvent,
        countdown: Duration,
    },
    Cancelled {
        alert_id: String,
        event: FallEvent,
    },
    Confirmed {
        alert_id: String,
        event: FallEvent,
        by_timeout: bool,
    },
    Dispatched {
        alert_id: String,
        attempts: u32,
    },
    DispatchFailed {
        alert_id: String,
        error: DispatchError,
    },
}

impl AlertEvent {
    pub fn alert_id(&self) -> &str {
        match self {
            AlertEvent::Pending { alert_id, .. }
            | AlertEvent::Cancelled { alert_id, .. }
            | AlertEvent::Confirmed { alert_id, .. }
            | AlertEvent::Dispatched { alert_id, .. }
            | AlertEvent::DispatchFailed { alert_id, .. } => alert_id,
        }
    }
}

impl fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertEvent::Pending { alert_id, event, countdown } => write!(
                f,
                "alert {} pending ({}), notifying in {}s",
                alert_id,
                event.severity,
                countdown.as_secs()
            ),
            AlertEvent::Cancelled { alert_id, .. } => write!(f, "alert {} cancelled as false alarm", alert_id),
            AlertEvent::Confirmed { alert_id, by_timeout, .. } => {
                if *by_timeout {
                    write!(f, "alert {} confirmed (countdown expired)", alert_id)
                } else {
                    write!(f, "alert {} confirmed", alert_id)
                }
            }
            AlertEvent::Dispatched { alert_id, attempts } => {
                write!(f, "alert {} dispatched after {} attempt(s)", alert_id, attempts)
            }
            AlertEvent::DispatchFailed { alert_id, error } => write!(f, "alert {} not delivered: {}", alert_id, error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlertStateError {
    #[error("Emergency alert {0} is already pending")]
    AlreadyPending(String),

    #[error("No emergency alert is pending")]
    NotPending,
}

/// Notification that could not be delivered
#[derive(Debug, Clone)]
pub struct UnresolvedDispatch {
    pub alert_id: String,
    pub event_id: String,
    pub notification: EmergencyNotification,
    pub error: DispatchError,
    pub failed_at: DateTime<Utc>,
}

struct Slot {
    alert: PendingAlert,
    started: Instant,
    timer: JoinHandle<()>,
}

/// Emergency alert state machine.
///
/// Cheap to clone; clones share the same slot.
#[derive(Clone)]
pub struct EmergencyAlertStateMachine {
    inner: Arc<Inner>,
}

struct Inner {
    config: AlertConfig,
    slot: Mutex<Option<Slot>>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    history: Arc<dyn HistorySink>,
    handlers: RwLock<Vec<AlertHandler>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    unresolved: Mutex<Vec<UnresolvedDispatch>>,
}

impl EmergencyAlertStateMachine {
    pub fn new(config: AlertConfig, dispatcher: Arc<dyn NotificationDispatcher>, history: Arc<dyn HistorySink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                slot: Mutex::new(None),
                dispatcher,
                history,
                handlers: RwLock::new(Vec::new()),
                error_handlers: RwLock::new(Vec::new()),
                unresolved: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.inner.config
    }

    /// Start the countdown for `event`. Must be called inside a Tokio runtime.
    pub fn trigger(
        &self,
        event: FallEvent,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<PendingAlert, AlertStateError> {
        self.trigger_with_countdown(event, payload, self.inner.config.countdown)
    }

    pub fn trigger_with_countdown(
        &self,
        event: FallEvent,
        payload: serde_json::Map<String, serde_json::Value>,
        countdown: Duration,
    ) -> Result<PendingAlert, AlertStateError> {
        let alert = {
            let mut slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = slot.as_ref() {
                return Err(AlertStateError::AlreadyPending(current.alert.id.clone()));
            }

            let started = Instant::now();
            let alert = PendingAlert {
                id: uuid::Uuid::new_v4().to_string(),
                expires_at: started + countdown,
                deadline: Utc::now() + chrono::Duration::from_std(countdown).unwrap_or_else(|_| chrono::Duration::zero()),
                payload,
                source_event: event,
            };

            let timer = tokio::spawn(self.inner.clone().expire_at(alert.id.clone(), alert.expires_at));
            *slot = Some(Slot {
                alert: alert.clone(),
                started,
                timer,
            });
            alert
        };

        tracing::warn!(
            severity = %alert.source_event.severity,
            source = ?alert.source_event.source,
            "Emergency alert {} pending, notifying in {:?} unless cancelled",
            alert.id,
            countdown
        );
        self.inner.emit(&AlertEvent::Pending {
            alert_id: alert.id.clone(),
            event: alert.source_event.clone(),
            countdown,
        });

        Ok(alert)
    }

    /// Cancel the pending alert as a false alarm
    pub fn cancel(&self) -> Result<FallEvent, AlertStateError> {
        let slot = self.inner.take(None).ok_or(AlertStateError::NotPending)?;
        slot.timer.abort();

        let alert_id = slot.alert.id.clone();
        let mut event = slot.alert.source_event;
        event.false_alarm = true;
        event.response_time_ms = Some(slot.started.elapsed().as_millis() as u64);

        tracing::info!("Emergency alert {} cancelled after {:?}", alert_id, slot.started.elapsed());
        self.inner.record(&event);
        self.inner.emit(&AlertEvent::Cancelled {
            alert_id,
            event: event.clone(),
        });

        Ok(event)
    }

    /// Confirm the pending alert now and dispatch in the background
    pub fn confirm(&self) -> Result<FallEvent, AlertStateError> {
        let slot = self.inner.take(None).ok_or(AlertStateError::NotPending)?;
        slot.timer.abort();

        let (event, delivery) = self.inner.confirmed(slot, false);
        tokio::spawn(self.inner.clone().deliver(delivery));

        Ok(event)
    }

    pub fn state(&self) -> AlertState {
        match self.pending() {
            Some(_) => AlertState::Pending,
            None => AlertState::Idle,
        }
    }

    pub fn pending(&self) -> Option<PendingAlert> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.alert.clone())
    }

    /// Register a lifecycle observer
    pub fn on_event(&self, handler: impl Fn(&AlertEvent) + Send + Sync + 'static) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Register an observer for dispatch and history failures
    pub fn on_error(&self, handler: impl Fn(&MonitorError) + Send + Sync + 'static) {
        self.inner
            .error_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Notifications that exhausted their retries
    pub fn unresolved(&self) -> Vec<UnresolvedDispatch> {
        self.inner.unresolved.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct Delivery {
    alert_id: String,
    event_id: String,
    notification: EmergencyNotification,
}

impl Inner {
    /// Take the pending slot, only if it holds `alert_id` when given
    fn take(&self, alert_id: Option<&str>) -> Option<Slot> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(current) if alert_id.map(|id| id == current.alert.id).unwrap_or(true) => slot.take(),
            _ => None,
        }
    }

    async fn expire_at(self: Arc<Self>, alert_id: String, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;

        // Lost the race to cancel() or confirm()
        let Some(slot) = self.take(Some(&alert_id)) else {
            return;
        };

        let (_, delivery) = self.confirmed(slot, true);
        self.deliver(delivery).await;
    }

    fn confirmed(&self, slot: Slot, by_timeout: bool) -> (FallEvent, Delivery) {
        let alert = slot.alert;
        let mut event = alert.source_event;
        event.confirmed = true;
        event.response_time_ms = Some(slot.started.elapsed().as_millis() as u64);

        let mut payload = alert.payload;
        payload.insert("eventId".to_string(), serde_json::Value::from(event.id.clone()));
        payload.insert("source".to_string(), serde_json::to_value(event.source).unwrap_or_default());

        let notification = EmergencyNotification {
            recipients: self.config.recipients.clone(),
            location: self.config.location.clone(),
            severity: event.severity.as_str().to_string(),
            timestamp: Utc::now(),
            payload,
        };

        tracing::warn!(
            severity = %event.severity,
            by_timeout,
            "Emergency alert {} confirmed, notifying {} recipient(s)",
            alert.id,
            notification.recipients.len()
        );
        self.record(&event);
        self.emit(&AlertEvent::Confirmed {
            alert_id: alert.id.clone(),
            event: event.clone(),
            by_timeout,
        });

        let delivery = Delivery {
            alert_id: alert.id,
            event_id: event.id.clone(),
            notification,
        };
        (event, delivery)
    }

    async fn deliver(self: Arc<Self>, delivery: Delivery) {
        let retry = self.config.retry;
        let mut attempt = 0u32;

        let last_error = loop {
            attempt += 1;

            match self.dispatcher.dispatch(&delivery.alert_id, &delivery.notification).await {
                Ok(()) => {
                    tracing::info!("Alert {} delivered via {} (attempt {})", delivery.alert_id, self.dispatcher.name(), attempt);
                    self.emit(&AlertEvent::Dispatched {
                        alert_id: delivery.alert_id,
                        attempts: attempt,
                    });
                    return;
                }
                Err(e) => {
                    tracing::warn!("Dispatch attempt {} for alert {} failed: {}", attempt, delivery.alert_id, e);
                    if !retry.allows(attempt + 1) {
                        break e;
                    }
                    tokio::time::sleep(retry.delay(attempt)).await;
                }
            }
        };

        let error = DispatchError::Exhausted {
            alert_id: delivery.alert_id.clone(),
            attempts: attempt,
            reason: last_error.to_string(),
        };
        tracing::error!("{}", error);

        self.unresolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(UnresolvedDispatch {
                alert_id: delivery.alert_id.clone(),
                event_id: delivery.event_id,
                notification: delivery.notification,
                error: error.clone(),
                failed_at: Utc::now(),
            });

        self.emit(&AlertEvent::DispatchFailed {
            alert_id: delivery.alert_id,
            error: error.clone(),
        });
        self.report(MonitorError::Dispatch(error));
    }

    fn record(&self, event: &FallEvent) {
        if let Err(e) = self.history.append(event) {
            tracing::error!("Failed to record fall event {}: {}", event.id, e);
            self.report(e);
        }
    }

    fn emit(&self, event: &AlertEvent) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!("Alert handler panicked on {}", event);
            }
        }
    }

    fn report(&self, error: MonitorError) {
        let handlers = self.error_handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&error))).is_err() {
                tracing::error!("Alert error handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use crate::{FallSource, Severity};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::{advance, sleep};

    /// Fails the first `failures` calls, then succeeds
    struct ScriptedDispatcher {
        failures: u32,
        calls: AtomicU32,
    }

    impl ScriptedDispatcher {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl NotificationDispatcher for ScriptedDispatcher {
        fn name(&self) -> &str {
            "scripted"
        }

        fn dispatch<'a>(
            &'a self,
            alert_id: &'a str,
            _notification: &'a EmergencyNotification,
        ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= self.failures {
                    Err(DispatchError::Unacknowledged(alert_id.to_string()))
                } else {
                    Ok(())
                }
            })
        }
    }

    struct Harness {
        machine: EmergencyAlertStateMachine,
        dispatcher: Arc<ScriptedDispatcher>,
        history: Arc<MemoryHistory>,
        events: Arc<Mutex<Vec<AlertEvent>>>,
        errors: Arc<Mutex<Vec<String>>>,
    }

    fn harness(failures: u32) -> Harness {
        let dispatcher = ScriptedDispatcher::new(failures);
        let history = Arc::new(MemoryHistory::new());
        let config = AlertConfig {
            recipients: vec!["care-team".to_string()],
            ..Default::default()
        };
        let machine = EmergencyAlertStateMachine::new(config, dispatcher.clone(), history.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        machine.on_event(move |e| sink.lock().unwrap().push(e.clone()));

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        machine.on_error(move |e| sink.lock().unwrap().push(e.to_string()));

        Harness {
            machine,
            dispatcher,
            history,
            events,
            errors,
        }
    }

    fn fall() -> FallEvent {
        FallEvent::new(Severity::High, FallSource::Detected)
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_deadline_is_a_false_alarm() {
        let h = harness(0);
        h.machine.trigger(fall(), Default::default()).unwrap();
        assert_eq!(h.machine.state(), AlertState::Pending);

        advance(Duration::from_millis(29_999)).await;
        let event = h.machine.cancel().unwrap();
        assert!(event.false_alarm);
        assert!(!event.confirmed);
        assert_eq!(event.response_time_ms, Some(29_999));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.dispatcher.calls(), 0);
        assert_eq!(h.machine.state(), AlertState::Idle);

        let stored = h.history.events();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].false_alarm);
        assert!(matches!(h.events.lock().unwrap().last(), Some(AlertEvent::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_confirms_and_dispatches_once() {
        let h = harness(0);
        let pending = h.machine.trigger(fall(), Default::default()).unwrap();

        sleep(Duration::from_secs(31)).await;

        assert_eq!(h.dispatcher.calls(), 1);
        assert_eq!(h.machine.state(), AlertState::Idle);
        assert_eq!(h.machine.cancel(), Err(AlertStateError::NotPending));

        let stored = h.history.events();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].confirmed && !stored[0].false_alarm);
        assert_eq!(stored[0].response_time_ms, Some(30_000));

        let events = h.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, AlertEvent::Confirmed { by_timeout: true, .. })));
        assert!(events
            .iter()
            .any(|e| *e == AlertEvent::Dispatched { alert_id: pending.id.clone(), attempts: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_trigger_leaves_deadline_alone() {
        let h = harness(0);
        let first = h.machine.trigger(fall(), Default::default()).unwrap();

        advance(Duration::from_secs(10)).await;
        let err = h.machine.trigger(fall(), Default::default()).unwrap_err();

        assert_eq!(err, AlertStateError::AlreadyPending(first.id.clone()));
        assert_eq!(h.machine.pending().unwrap().expires_at, first.expires_at);

        sleep(Duration::from_secs(21)).await;
        assert_eq!(h.dispatcher.calls(), 1);
        assert_eq!(h.history.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_at_the_deadline_has_exactly_one_winner() {
        let h = harness(0);
        h.machine.trigger(fall(), Default::default()).unwrap();

        advance(Duration::from_secs(30)).await;
        let cancelled = h.machine.cancel().is_ok();
        sleep(Duration::from_secs(1)).await;

        let stored = h.history.events();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].false_alarm, cancelled);
        assert_eq!(stored[0].confirmed, !cancelled);
        assert_eq!(h.dispatcher.calls(), u32::from(!cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_confirm_stops_the_countdown() {
        let h = harness(0);
        h.machine.trigger(fall(), Default::default()).unwrap();

        advance(Duration::from_secs(5)).await;
        let event = h.machine.confirm().unwrap();
        assert!(event.confirmed);
        assert_eq!(h.machine.confirm(), Err(AlertStateError::NotPending));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.dispatcher.calls(), 1);
        assert_eq!(h.history.events().len(), 1);
        assert!(h
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, AlertEvent::Confirmed { by_timeout: false, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_retries_then_recovers() {
        let h = harness(2);
        let pending = h.machine.trigger(fall(), Default::default()).unwrap();
        h.machine.confirm().unwrap();

        sleep(Duration::from_secs(60)).await;

        assert_eq!(h.dispatcher.calls(), 3);
        assert!(h.machine.unresolved().is_empty());
        assert!(h
            .events
            .lock()
            .unwrap()
            .contains(&AlertEvent::Dispatched { alert_id: pending.id, attempts: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_dispatch_is_recorded_and_reported() {
        let h = harness(u32::MAX);
        let pending = h.machine.trigger(fall(), Default::default()).unwrap();
        h.machine.confirm().unwrap();

        sleep(Duration::from_secs(120)).await;

        assert_eq!(h.dispatcher.calls(), 3);
        let unresolved = h.machine.unresolved();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].alert_id, pending.id);
        assert_eq!(unresolved[0].notification.recipients, vec!["care-team".to_string()]);

        assert!(h.events.lock().unwrap().iter().any(|e| matches!(
            e,
            AlertEvent::DispatchFailed { error: DispatchError::Exhausted { attempts: 3, .. }, .. }
        )));
        assert_eq!(h.errors.lock().unwrap().len(), 1);
        // The user was still told the alert went out
        assert!(h.history.events()[0].confirmed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cancel_and_expiry_never_double_resolve() {
        let h = harness(0);
        let rounds = 40;

        for round in 0..rounds {
            h.machine
                .trigger_with_countdown(fall(), Default::default(), Duration::from_millis(2))
                .unwrap();

            let machine = h.machine.clone();
            let canceller = tokio::spawn(async move {
                if round % 2 == 0 {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                machine.cancel().is_ok()
            });
            canceller.await.unwrap();

            while h.machine.state() == AlertState::Pending {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        let stored = h.history.events();
        assert_eq!(stored.len(), rounds);
        assert!(stored.iter().all(|e| e.confirmed != e.false_alarm));

        let confirmed = stored.iter().filter(|e| e.confirmed).count() as u32;
        assert_eq!(h.dispatcher.calls(), confirmed);
    }
}
