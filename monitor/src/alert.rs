//! Alerts and alert callbacks

use concordia_core::Timestamp;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    HighLatency,
    LowThroughput,
    HighErrorRate,
    LowHealthScore,
    RouteDown,
    ByzantineAnomaly,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighLatency => "HIGH_LATENCY",
            AlertType::LowThroughput => "LOW_THROUGHPUT",
            AlertType::HighErrorRate => "HIGH_ERROR_RATE",
            AlertType::LowHealthScore => "LOW_HEALTH_SCORE",
            AlertType::RouteDown => "ROUTE_DOWN",
            AlertType::ByzantineAnomaly => "BYZANTINE_ANOMALY",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("WARNING"),
            Severity::Critical => f.write_str("CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    /// Route or chain the alert is about
    pub subject: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    /// Route endpoints, metric name and other context for callbacks
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created: Timestamp,
    pub acknowledged: bool,
    pub resolved: bool,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: Severity,
        subject: impl Into<String>,
        message: impl Into<String>,
        value: f64,
        threshold: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_type,
            severity,
            subject: subject.into(),
            message: message.into(),
            value,
            threshold,
            metadata: HashMap::new(),
            created: Timestamp::now(),
            acknowledged: false,
            resolved: false,
        }
    }
    
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

/// Called with the alert id and the alert
pub type AlertCallback = Arc<dyn Fn(&str, &Alert) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct AlertPolicy {
    pub max_alerts: usize,
    pub expiry_ms: u64,
    /// Suppress a new alert while an unresolved one of the same type and
    /// subject exists
    pub dedupe: bool,
}

/// Alert store plus callback registry
pub struct AlertManager {
    policy: AlertPolicy,
    alerts: RwLock<VecDeque<Alert>>,
    callbacks: RwLock<HashMap<AlertType, Vec<AlertCallback>>>,
}

impl AlertManager {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            policy,
            alerts: RwLock::new(VecDeque::new()),
            callbacks: RwLock::new(HashMap::new()),
        }
    }
    
    /// Register a callback for one alert type. Several may be registered.
    pub fn register_callback<F>(&self, alert_type: AlertType, callback: F)
    where
        F: Fn(&str, &Alert) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .entry(alert_type)
            .or_default()
            .push(Arc::new(callback));
    }
    
    /// Store an alert and run its callbacks. Returns `None` when deduplicated.
    pub fn raise(&self, alert: Alert) -> Option<Alert> {
        {
            let mut alerts = self.alerts.write();
            if self.policy.dedupe
                && alerts.iter().any(|a| {
                    !a.resolved && a.alert_type == alert.alert_type && a.subject == alert.subject
                })
            {
                return None;
            }
            alerts.push_back(alert.clone());
            while alerts.len() > self.policy.max_alerts.max(1) {
                alerts.pop_front();
            }
        }
        
        match alert.severity {
            Severity::Critical => error!("[{}] {} on {}: {}", alert.severity, alert.alert_type, alert.subject, alert.message),
            Severity::Warning => warn!("[{}] {} on {}: {}", alert.severity, alert.alert_type, alert.subject, alert.message),
        }
        
        let callbacks = self
            .callbacks
            .read()
            .get(&alert.alert_type)
            .cloned()
            .unwrap_or_default();
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&alert.id, &alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Alert callback for {} failed: {}", alert.alert_type, e),
                Err(_) => warn!("Alert callback for {} panicked", alert.alert_type),
            }
        }
        Some(alert)
    }
    
    pub fn acknowledge(&self, id: &str) -> bool {
        self.update(id, |a| a.acknowledged = true)
    }
    
    pub fn resolve(&self, id: &str) -> bool {
        self.update(id, |a| a.resolved = true)
    }
    
    /// Resolve every open alert of one type on one subject
    pub fn resolve_matching(&self, alert_type: AlertType, subject: &str) -> usize {
        let mut resolved = 0;
        for alert in self.alerts.write().iter_mut() {
            if !alert.resolved && alert.alert_type == alert_type && alert.subject == subject {
                alert.resolved = true;
                resolved += 1;
            }
        }
        resolved
    }
    
    fn update(&self, id: &str, f: impl FnOnce(&mut Alert)) -> bool {
        match self.alerts.write().iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                f(alert);
                true
            }
            None => false,
        }
    }
    
    /// Drop alerts older than the expiry
    pub fn expire(&self) -> usize {
        let now = Timestamp::now().as_millis();
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|a| now.saturating_sub(a.created.as_millis()) < self.policy.expiry_ms);
        before - alerts.len()
    }
    
    pub fn get(&self, id: &str) -> Option<Alert> {
        self.alerts.read().iter().find(|a| a.id == id).cloned()
    }
    
    /// Unresolved alerts, oldest first
    pub fn active(&self) -> Vec<Alert> {
        self.alerts.read().iter().filter(|a| !a.resolved).cloned().collect()
    }
    
    pub fn of_type(&self, alert_type: AlertType) -> Vec<Alert> {
        self.alerts
            .read()
            .iter()
            .filter(|a| a.alert_type == alert_type)
            .cloned()
            .collect()
    }
    
    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }
    
    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }
}
