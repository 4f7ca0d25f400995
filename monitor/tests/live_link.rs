//! End-to-end behavior of the monitor over an in-memory link

use fallwatch_link::memory::{MemoryConnector, MemoryRemote};
use fallwatch_link::{InboundFrame, LiveMetric, MetricType, MotionSample, OutboundFrame};
use fallwatch_monitor::{
    AlertEvent, ConnectionStatus, DispatchError, FallEvent, LinkPhase, MemoryHistory, MonitorConfig, MonitorError,
    MonitorObserver, MonitorService, Subscription,
};
use nalgebra::Vector3;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Recorder {
    statuses: Mutex<Vec<ConnectionStatus>>,
    metrics: Mutex<Vec<LiveMetric>>,
    errors: Mutex<Vec<String>>,
    falls: Mutex<Vec<FallEvent>>,
    alerts: Mutex<Vec<AlertEvent>>,
}

impl MonitorObserver for Recorder {
    fn on_connection_status_change(&self, status: &ConnectionStatus) {
        self.statuses.lock().unwrap().push(status.clone());
    }

    fn on_live_metric(&self, metric: &LiveMetric) {
        self.metrics.lock().unwrap().push(metric.clone());
    }

    fn on_error(&self, error: &MonitorError) {
        self.errors.lock().unwrap().push(error.to_string());
    }

    fn on_fall_event(&self, event: &FallEvent) {
        self.falls.lock().unwrap().push(event.clone());
    }

    fn on_alert(&self, event: &AlertEvent) {
        self.alerts.lock().unwrap().push(event.clone());
    }
}

struct Rig {
    service: Arc<MonitorService>,
    remote: MemoryRemote,
    history: Arc<MemoryHistory>,
    recorder: Arc<Recorder>,
}

fn rig() -> Rig {
    init_tracing();

    let (connector, remote) = MemoryConnector::new();
    let history = Arc::new(MemoryHistory::new());
    let service = MonitorService::start(MonitorConfig::default(), Arc::new(connector), history.clone());

    let recorder = Arc::new(Recorder::default());
    service.add_observer(recorder.clone());

    Rig {
        service,
        remote,
        history,
        recorder,
    }
}

fn resting() -> MotionSample {
    MotionSample::new(Vector3::new(0.0, 0.0, -9.8), Vector3::zeros(), 0.95)
        .with_heart_rate(70.0)
        .with_device("watch-1")
}

fn impact() -> MotionSample {
    MotionSample::new(Vector3::new(10.0, 10.0, -15.0), Vector3::new(5.0, 5.0, 5.0), 0.9)
        .with_heart_rate(74.0)
        .with_device("watch-1")
}

async fn stream_fall(rig: &Rig) {
    rig.service.calibrate(&resting());
    for _ in 0..10 {
        rig.remote.push(InboundFrame::MotionSample { data: resting() }).await.unwrap();
    }
    rig.remote.push(InboundFrame::MotionSample { data: impact() }).await.unwrap();
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_keeps_subscriptions_without_duplicate_delivery() {
    let rig = rig();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();

    rig.service
        .subscribe(Subscription::new("dashboard", [MetricType::HeartRate], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

    assert!(rig.service.connect().await);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(rig.remote.sent_of_kind("subscribe_health_updates").len(), 1);

    rig.remote.drop_link();
    sleep(Duration::from_secs(3)).await;

    let status = rig.service.status();
    assert!(status.connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(rig.remote.sent_of_kind("client_identification").len(), 2);
    assert_eq!(rig.remote.sent_of_kind("subscribe_health_updates").len(), 2);

    rig.remote
        .push(InboundFrame::LiveHealthUpdate {
            data: LiveMetric::new(MetricType::HeartRate, 72.0, "watch-1", 0.93).with_unit("bpm"),
            timestamp: None,
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(rig.service.registry().len(), 1);

    let statuses = rig.recorder.statuses.lock().unwrap();
    assert!(statuses.iter().any(|s| s.phase == LinkPhase::Reconnecting && !s.connected));
    assert!(statuses.last().unwrap().connected);
}

#[tokio::test(start_paused = true)]
async fn detected_fall_is_dispatched_over_the_link_after_countdown() {
    let rig = rig();
    rig.remote.set_auto_ack(true);

    let fall_metrics = Arc::new(AtomicUsize::new(0));
    let counter = fall_metrics.clone();
    rig.service
        .subscribe(Subscription::new("falls", [MetricType::FallEvent], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

    assert!(rig.service.connect().await);
    stream_fall(&rig).await;

    assert_eq!(rig.recorder.falls.lock().unwrap().len(), 1);
    assert_eq!(fall_metrics.load(Ordering::SeqCst), 1);
    let pending = rig.service.alerts().pending().expect("alert should be pending");
    assert_eq!(pending.source_event.sample_window.len(), FallEvent::WINDOW_LIMIT);

    sleep(Duration::from_secs(31)).await;

    let alerts = rig.remote.sent_of_kind("emergency_alert");
    assert_eq!(alerts.len(), 1);
    match &alerts[0] {
        OutboundFrame::EmergencyAlert { alert_id, data } => {
            assert_eq!(alert_id, &pending.id);
            assert_eq!(data.severity, "high");
            assert_eq!(data.payload["deviceId"], "watch-1");
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    let events = rig.history.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].confirmed);
    assert!(rig
        .recorder
        .alerts
        .lock()
        .unwrap()
        .contains(&AlertEvent::Dispatched { alert_id: pending.id, attempts: 1 }));
}

#[tokio::test(start_paused = true)]
async fn cancelled_fall_never_reaches_contacts() {
    let rig = rig();
    rig.remote.set_auto_ack(true);
    assert!(rig.service.connect().await);
    stream_fall(&rig).await;

    sleep(Duration::from_secs(5)).await;
    let event = rig.service.cancel_pending_emergency().unwrap();
    assert!(event.false_alarm);

    sleep(Duration::from_secs(120)).await;

    assert!(rig.remote.sent_of_kind("emergency_alert").is_empty());
    assert_eq!(rig.history.events(), vec![event]);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_alert_is_retried_then_escalated() {
    let rig = rig();
    assert!(rig.service.connect().await);
    stream_fall(&rig).await;

    sleep(Duration::from_secs(120)).await;

    assert_eq!(rig.remote.sent_of_kind("emergency_alert").len(), 3);
    assert_eq!(rig.service.alerts().unresolved().len(), 1);
    assert!(rig.recorder.alerts.lock().unwrap().iter().any(|e| matches!(
        e,
        AlertEvent::DispatchFailed { error: DispatchError::Exhausted { attempts: 3, .. }, .. }
    )));
    assert!(rig
        .recorder
        .errors
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.contains("failed after 3 attempts")));
    assert!(rig.history.events()[0].confirmed);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_reported_and_the_stream_continues() {
    let rig = rig();
    assert!(rig.service.connect().await);

    rig.remote.push_raw("{\"type\":\"live_health_update\",\"data\":").await.unwrap();
    rig.remote
        .push_raw(r#"{"type":"live_health_update","data":{"metricType":"steps","value":1200,"timestamp":"2024-05-01T10:00:00Z","confidence":0.99,"deviceId":"phone"}}"#)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    assert!(rig.service.status().connected);
    assert_eq!(rig.recorder.errors.lock().unwrap().len(), 1);
    let metrics = rig.recorder.metrics.lock().unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].metric_type, MetricType::Steps);
}

#[tokio::test(start_paused = true)]
async fn failing_subscriber_is_reported_on_the_error_channel() {
    let rig = rig();
    let healthy = Arc::new(AtomicUsize::new(0));
    let counter = healthy.clone();

    rig.service
        .subscribe(Subscription::new("crm", [MetricType::Activity], |_| anyhow::bail!("crm offline")))
        .unwrap();
    rig.service
        .subscribe(Subscription::new("analytics", [MetricType::Activity], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

    let delivered = rig
        .service
        .ingest_metric(LiveMetric::new(MetricType::Activity, "walking", "phone", 0.8));

    assert_eq!(delivered, 1);
    assert_eq!(healthy.load(Ordering::SeqCst), 1);
    let errors = rig.recorder.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("crm offline"));
}

#[tokio::test(start_paused = true)]
async fn link_loss_during_countdown_keeps_the_deadline() {
    let rig = rig();
    rig.remote.set_auto_ack(true);
    assert!(rig.service.connect().await);

    let start = Instant::now();
    let pending = rig.service.trigger_emergency(serde_json::Map::new()).unwrap();
    assert_eq!(pending.expires_at, start + Duration::from_secs(30));

    sleep(Duration::from_secs(10)).await;
    rig.remote.drop_link();
    sleep(Duration::from_secs(5)).await;

    assert!(rig.service.status().connected);
    assert_eq!(rig.remote.sent_of_kind("client_identification").len(), 2);
    let still_pending = rig.service.alerts().pending().expect("countdown should survive the reconnect");
    assert_eq!(still_pending.id, pending.id);
    assert_eq!(still_pending.expires_at, pending.expires_at);

    sleep_until(start + Duration::from_millis(29_999)).await;
    assert!(rig.service.alerts().pending().is_some());
    assert!(rig.remote.sent_of_kind("emergency_alert").is_empty());

    sleep_until(start + Duration::from_millis(30_001)).await;
    assert!(rig.service.alerts().pending().is_none());

    let events = rig.history.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].confirmed);
    assert_eq!(events[0].response_time_ms, Some(30_000));

    sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.remote.sent_of_kind("emergency_alert").len(), 1);

    let alerts = rig.recorder.alerts.lock().unwrap();
    assert!(alerts
        .iter()
        .any(|e| matches!(e, AlertEvent::Confirmed { alert_id, by_timeout: true, .. } if *alert_id == pending.id)));
    assert!(alerts.contains(&AlertEvent::Dispatched { alert_id: pending.id.clone(), attempts: 1 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_subscriber_does_not_hold_up_fall_detection() {
    let rig = rig();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);

    rig.service
        .subscribe(Subscription::new("dashboard", [MetricType::HeartRate], move |_| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(10));
            Ok(())
        }))
        .unwrap();

    assert!(rig.service.connect().await);
    rig.remote
        .push(InboundFrame::LiveHealthUpdate {
            data: LiveMetric::new(MetricType::HeartRate, 72.0, "watch-1", 0.93),
            timestamp: None,
        })
        .await
        .unwrap();
    stream_fall(&rig).await;

    let raised = tokio::time::timeout(Duration::from_secs(2), async {
        while rig.service.alerts().pending().is_none() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    let _ = release_tx.send(());

    assert!(raised.is_ok(), "fall detection waited on the dashboard callback");
    assert_eq!(rig.recorder.falls.lock().unwrap().len(), 1);

    rig.service.cancel_pending_emergency().unwrap();
    rig.service.shutdown();
}
