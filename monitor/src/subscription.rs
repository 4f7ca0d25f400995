//! Subscription Fan-out
//!
//! Consumers register a filter plus a callback and keep only the id.
//! Every decoded metric is offered to each matching subscription once.

use crate::MonitorError;
use fallwatch_link::{LiveMetric, MetricType};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Metric callback. Errors are collected, never propagated to the transport.
pub type MetricCallback = Arc<dyn Fn(&LiveMetric) -> anyhow::Result<()> + Send + Sync>;

/// Registered interest in a set of metric types
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub metric_types: HashSet<MetricType>,
    /// Metrics below this confidence are not delivered
    pub min_confidence: Option<f64>,
    /// Only metrics from this device are delivered
    pub device_id: Option<String>,
    callback: MetricCallback,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        metric_types: impl IntoIterator<Item = MetricType>,
        callback: impl Fn(&LiveMetric) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            metric_types: metric_types.into_iter().collect(),
            min_confidence: None,
            device_id: None,
            callback: Arc::new(callback),
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = Some(min_confidence);
        self
    }

    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Whether `metric` passes this subscription's filters
    pub fn matches(&self, metric: &LiveMetric) -> bool {
        self.metric_types.contains(&metric.metric_type)
            && self.min_confidence.map(|min| metric.confidence >= min).unwrap_or(true)
            && self.device_id.as_ref().map(|d| *d == metric.device_id).unwrap_or(true)
    }

    /// Metric types in a stable order, for announcing to the source
    pub fn sorted_types(&self) -> Vec<MetricType> {
        let mut types: Vec<MetricType> = self.metric_types.iter().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("metric_types", &self.metric_types)
            .field("min_confidence", &self.min_confidence)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Subscription id already registered: {0}")]
    DuplicateId(String),
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Callbacks running longer than this are reported. `None` disables the check.
    pub slow_callback_budget: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            slow_callback_budget: Some(Duration::from_millis(250)),
        }
    }
}

/// Outcome of one fan-out
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Callbacks that completed without error
    pub delivered: usize,
    pub failures: Vec<MonitorError>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Subscription registry
pub struct SubscriptionRegistry {
    config: RegistryConfig,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscription. A duplicate id leaves the existing one in place.
    pub fn subscribe(&self, subscription: Subscription) -> Result<String, SubscriptionError> {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);

        if subscriptions.contains_key(&subscription.id) {
            return Err(SubscriptionError::DuplicateId(subscription.id));
        }

        let id = subscription.id.clone();
        tracing::debug!("Subscribed {} to {:?}", id, subscription.sorted_types());
        subscriptions.insert(id.clone(), Arc::new(subscription));

        Ok(id)
    }

    /// Remove a subscription, returning whether it existed
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();

        if removed {
            tracing::debug!("Unsubscribed {}", id);
        }
        removed
    }

    /// Offer `metric` to every matching subscription.
    ///
    /// Callbacks run on a snapshot after the lock is released; a failing or
    /// panicking callback is reported and does not affect the others.
    pub fn dispatch(&self, metric: &LiveMetric) -> DispatchReport {
        let targets: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.matches(metric))
            .cloned()
            .collect();

        let mut report = DispatchReport::default();

        for subscription in targets {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscription.callback)(metric)));
            let elapsed = started.elapsed();

            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => report.failures.push(MonitorError::Subscriber {
                    id: subscription.id.clone(),
                    reason: format!("{:#}", e),
                }),
                Err(panic) => report.failures.push(MonitorError::Subscriber {
                    id: subscription.id.clone(),
                    reason: format!("callback panicked: {}", panic_message(panic.as_ref())),
                }),
            }

            if let Some(budget) = self.config.slow_callback_budget {
                if elapsed > budget {
                    tracing::warn!("Subscriber {} took {:?} for {}", subscription.id, elapsed, metric.metric_type);
                    report.failures.push(MonitorError::SlowSubscriber {
                        id: subscription.id.clone(),
                        elapsed_ms: elapsed.as_millis() as u64,
                    });
                }
            }
        }

        report
    }

    /// Snapshot of all subscriptions
    pub fn snapshot(&self) -> Vec<Arc<Subscription>> {
        let mut all: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner).contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
