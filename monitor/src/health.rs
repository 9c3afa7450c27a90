//! Bridge health monitor
//!
//! Owns one tracker per route and two background loops: a health-check
//! loop probing the adapters on each route, and an alert-check loop
//! comparing the latest metrics against the configured thresholds.

use crate::alert::{Alert, AlertManager, AlertPolicy, AlertType, Severity};
use crate::metrics::{RouteId, RouteMetrics, RouteStatus, RouteTracker};
use concordia_core::{
    AlertThresholds, ChainId, ConcordiaError, ConcordiaResult, MonitorConfig, SharedAdapterRegistry, Timestamp,
};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Point-in-time health of every route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub routes: Vec<RouteMetrics>,
    /// Mean route health, 1.0 with no routes
    pub overall_health: f64,
    pub down_chains: Vec<ChainId>,
    pub active_alerts: usize,
    pub generated: Timestamp,
}

pub struct BridgeHealthMonitor {
    config: MonitorConfig,
    adapters: SharedAdapterRegistry,
    routes: DashMap<RouteId, RouteTracker>,
    chain_up: DashMap<ChainId, bool>,
    byzantine_hints: DashMap<ChainId, u64>,
    alerts: AlertManager,
}

impl BridgeHealthMonitor {
    pub fn new(config: MonitorConfig, adapters: SharedAdapterRegistry) -> Self {
        let alerts = AlertManager::new(AlertPolicy {
            max_alerts: config.max_alerts,
            expiry_ms: config.alert_expiry_ms,
            dedupe: config.dedupe_alerts,
        });
        Self {
            config,
            adapters,
            routes: DashMap::new(),
            chain_up: DashMap::new(),
            byzantine_hints: DashMap::new(),
            alerts,
        }
    }
    
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
    
    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }
    
    pub fn register_callback<F>(&self, alert_type: AlertType, callback: F)
    where
        F: Fn(&str, &Alert) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.alerts.register_callback(alert_type, callback);
    }
    
    /// Start tracking a route; an existing route keeps its samples
    pub fn add_route(&self, source: ChainId, target: ChainId) -> RouteId {
        let route = RouteId::new(source, target);
        self.routes.entry(route.clone()).or_insert_with(|| {
            info!("Monitoring route {}", route);
            RouteTracker::new(
                route.clone(),
                Duration::from_millis(self.config.window_ms),
                self.config.max_acceptable_latency_ms,
            )
        });
        route
    }
    
    pub fn remove_route(&self, route: &RouteId) -> bool {
        self.routes.remove(route).is_some()
    }
    
    /// Tracked routes in a stable order
    pub fn routes(&self) -> Vec<RouteId> {
        let mut routes: Vec<RouteId> = self.routes.iter().map(|r| r.key().clone()).collect();
        routes.sort();
        routes
    }
    
    pub fn record_transfer(&self, route: &RouteId, latency: Duration, success: bool) -> ConcordiaResult<RouteMetrics> {
        let mut tracker = self
            .routes
            .get_mut(route)
            .ok_or_else(|| ConcordiaError::Validation(format!("unknown route {}", route)))?;
        Ok(tracker.record_transfer(latency, success))
    }
    
    /// Current metrics of a route over its window
    pub fn route_metrics(&self, route: &RouteId) -> Option<RouteMetrics> {
        self.routes.get(route).map(|t| t.metrics())
    }
    
    /// Whether the last probe found the chain unreachable
    pub fn is_chain_down(&self, chain: &ChainId) -> bool {
        self.chain_up.get(chain).map_or(false, |up| !*up)
    }
    
    /// Probe every chain on a tracked route and mark routes up or down.
    /// A route goes down when either end is unhealthy.
    pub async fn run_health_checks(&self) {
        let chains: BTreeSet<ChainId> = self
            .routes
            .iter()
            .flat_map(|r| [r.key().source.clone(), r.key().target.clone()])
            .collect();
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        
        let probes = chains.into_iter().map(|chain| async move {
            let up = match self.adapters.get(&chain) {
                Some(adapter) => match timeout(probe_timeout, adapter.is_healthy()).await {
                    Ok(healthy) => healthy && adapter.is_connected(),
                    Err(_) => {
                        warn!("Health probe for {} timed out", chain);
                        false
                    }
                },
                None => false,
            };
            (chain, up)
        });
        for (chain, up) in join_all(probes).await {
            debug!("Chain {} probe: {}", chain, if up { "up" } else { "down" });
            self.chain_up.insert(chain, up);
        }
        
        let mut went_down = Vec::new();
        for mut tracker in self.routes.iter_mut() {
            let route = tracker.key().clone();
            let up = !self.is_chain_down(&route.source) && !self.is_chain_down(&route.target);
            let previous = tracker.record_probe(up);
            match (previous, up) {
                (RouteStatus::Active, false) => went_down.push(route),
                (RouteStatus::Down, true) => {
                    info!("Route {} is back up", route);
                    self.alerts.resolve_matching(AlertType::RouteDown, &route.to_string());
                }
                _ => {}
            }
        }
        for route in went_down {
            let alert = Alert::new(
                AlertType::RouteDown,
                Severity::Critical,
                route.to_string(),
                "route failed its health probe",
                0.0,
                1.0,
            )
            .with_metadata("source", &route.source)
            .with_metadata("target", &route.target)
            .with_metadata("source_up", !self.is_chain_down(&route.source))
            .with_metadata("target_up", !self.is_chain_down(&route.target));
            self.alerts.raise(alert);
        }
    }
    
    /// Compare every route's metrics with the thresholds, raising one alert
    /// per breached metric. Returns the alerts raised this cycle.
    pub fn run_alert_checks(&self) -> Vec<Alert> {
        let expired = self.alerts.expire();
        if expired > 0 {
            debug!("Expired {} alerts", expired);
        }
        
        let snapshots: Vec<RouteMetrics> = self.routes.iter().map(|t| t.metrics()).collect();
        
        snapshots
            .iter()
            .flat_map(|m| breaches(m, &self.config.thresholds))
            .filter_map(|alert| self.alerts.raise(alert))
            .collect()
    }
    
    /// Record outlier chains reported by a consensus round
    pub fn report_byzantine_anomaly(&self, chains: &[ChainId], context: &str) -> Option<Alert> {
        if chains.is_empty() {
            return None;
        }
        for chain in chains {
            *self.byzantine_hints.entry(chain.clone()).or_insert(0) += 1;
        }
        let subject = chains.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(",");
        let alert = Alert::new(
            AlertType::ByzantineAnomaly,
            Severity::Warning,
            subject.clone(),
            format!("confidence outliers in {}", context),
            chains.len() as f64,
            0.0,
        )
        .with_metadata("chains", subject)
        .with_metadata("context", context);
        self.alerts.raise(alert)
    }
    
    pub fn byzantine_hints(&self, chain: &ChainId) -> u64 {
        self.byzantine_hints.get(chain).map_or(0, |c| *c)
    }
    
    pub fn health_report(&self) -> HealthReport {
        let routes: Vec<RouteMetrics> = self
            .routes()
            .iter()
            .filter_map(|r| self.route_metrics(r))
            .collect();
        let overall_health = if routes.is_empty() {
            1.0
        } else {
            routes.iter().map(|m| m.health_score).sum::<f64>() / routes.len() as f64
        };
        let mut down_chains: Vec<ChainId> = self
            .chain_up
            .iter()
            .filter(|c| !*c.value())
            .map(|c| c.key().clone())
            .collect();
        down_chains.sort();
        
        HealthReport {
            routes,
            overall_health,
            down_chains,
            active_alerts: self.alerts.active().len(),
            generated: Timestamp::now(),
        }
    }
    
    /// Spawn both loops. They run until the handle is stopped.
    pub fn start(self: Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(
            "Starting health monitor (health every {}ms, alerts every {}ms)",
            self.config.health_check_interval_ms, self.config.alert_check_interval_ms
        );
        
        let health = {
            let monitor = self.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_millis(monitor.config.health_check_interval_ms.max(1)));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => monitor.run_health_checks().await,
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("Health-check loop stopped");
            })
        };
        
        let alerts = {
            let monitor = self;
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_millis(monitor.config.alert_check_interval_ms.max(1)));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            monitor.run_alert_checks();
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("Alert-check loop stopped");
            })
        };
        
        MonitorHandle {
            shutdown: shutdown_tx,
            tasks: vec![health, alerts],
        }
    }
}

/// Alerts for every threshold a snapshot breaches. Latency and throughput
/// are only judged when the window holds samples.
fn breaches(m: &RouteMetrics, t: &AlertThresholds) -> Vec<Alert> {
    let subject = m.route.to_string();
    let mut out = Vec::new();
    let mut check = |alert_type: AlertType, value: f64, warning: f64, critical: f64, above: bool, what: &str| {
        let breached = |limit: f64| if above { value > limit } else { value < limit };
        let (severity, limit) = if breached(critical) {
            (Severity::Critical, critical)
        } else if breached(warning) {
            (Severity::Warning, warning)
        } else {
            return;
        };
        out.push(
            Alert::new(
                alert_type,
                severity,
                subject.clone(),
                format!("{} {:.3} breaches {:.3}", what, value, limit),
                value,
                limit,
            )
            .with_metadata("route", &subject)
            .with_metadata("source", &m.route.source)
            .with_metadata("target", &m.route.target)
            .with_metadata("metric", what)
            .with_metadata("sample_count", m.sample_count)
            .with_metadata("window_health", format!("{:.3}", m.health_score)),
        );
    };
    
    if m.sample_count > 0 {
        check(AlertType::HighLatency, m.average_latency_ms, t.latency_warning_ms, t.latency_critical_ms, true, "average latency (ms)");
        check(AlertType::LowThroughput, m.throughput, t.throughput_warning, t.throughput_critical, false, "throughput (/s)");
    }
    check(AlertType::HighErrorRate, m.error_rate, t.error_rate_warning, t.error_rate_critical, true, "error rate");
    check(AlertType::LowHealthScore, m.health_score, t.health_warning, t.health_critical, false, "health score");
    out
}

/// Handle to the running monitor loops
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signal both loops and wait for them to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Monitor task ended abnormally: {}", e);
            }
        }
        info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use concordia_core::{
        AdapterRegistry, ChainAdapter, ChainVerificationResult, ProcessId, VerificationData, VerificationStatus, VoteData,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    
    struct ProbeAdapter {
        chain: ChainId,
        healthy: AtomicBool,
    }
    
    #[async_trait]
    impl ChainAdapter for ProbeAdapter {
        fn chain_id(&self) -> &ChainId {
            &self.chain
        }
        
        async fn verify(&self, _agent_id: &str, _data: &VerificationData) -> ConcordiaResult<ChainVerificationResult> {
            Ok(ChainVerificationResult::new(self.chain.clone(), VerificationStatus::Verified, 1.0))
        }
        
        async fn submit_vote(&self, _process_id: &ProcessId, _vote: &VoteData) -> ConcordiaResult<String> {
            Ok(String::new())
        }
        
        fn consensus_weight(&self) -> f64 {
            1.0
        }
        
        async fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
        
        fn is_connected(&self) -> bool {
            true
        }
    }
    
    fn setup() -> (Arc<BridgeHealthMonitor>, Arc<ProbeAdapter>, RouteId) {
        let registry = Arc::new(AdapterRegistry::new());
        let eth = Arc::new(ProbeAdapter {
            chain: ChainId::from("ethereum"),
            healthy: AtomicBool::new(true),
        });
        registry.add(eth.clone());
        registry.add(Arc::new(ProbeAdapter {
            chain: ChainId::from("solana"),
            healthy: AtomicBool::new(true),
        }));
        let monitor = Arc::new(BridgeHealthMonitor::new(MonitorConfig::default(), registry));
        let route = monitor.add_route(ChainId::from("ethereum"), ChainId::from("solana"));
        (monitor, eth, route)
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_failing_route_alerts_every_cycle() {
        let (monitor, _, route) = setup();
        for _ in 0..10 {
            monitor.record_transfer(&route, Duration::from_millis(200), false).unwrap();
        }
        let m = monitor.route_metrics(&route).unwrap();
        assert_eq!(m.error_rate, 1.0);
        assert_eq!(m.health_score, 0.0);
        
        for _ in 0..3 {
            let raised = monitor.run_alert_checks();
            let error_alerts: Vec<&Alert> = raised
                .iter()
                .filter(|a| a.alert_type == AlertType::HighErrorRate)
                .collect();
            assert_eq!(error_alerts.len(), 1);
            assert_eq!(error_alerts[0].severity, Severity::Critical);
            let metadata = &error_alerts[0].metadata;
            assert_eq!(metadata.get("route").map(String::as_str), Some("ethereum->solana"));
            assert_eq!(metadata.get("source").map(String::as_str), Some("ethereum"));
            assert_eq!(metadata.get("metric").map(String::as_str), Some("error rate"));
            assert_eq!(metadata.get("sample_count").map(String::as_str), Some("10"));
        }
        assert_eq!(monitor.alerts().of_type(AlertType::HighErrorRate).len(), 3);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_healthy_route_raises_nothing() {
        let (monitor, _, route) = setup();
        for _ in 0..60 {
            monitor.record_transfer(&route, Duration::from_millis(50), true).unwrap();
        }
        assert!(monitor.run_alert_checks().is_empty());
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_adapter_takes_route_down() {
        let (monitor, eth, route) = setup();
        monitor.run_health_checks().await;
        assert!(!monitor.is_chain_down(&ChainId::from("ethereum")));
        
        eth.healthy.store(false, Ordering::SeqCst);
        monitor.run_health_checks().await;
        monitor.run_health_checks().await;
        
        assert!(monitor.is_chain_down(&ChainId::from("ethereum")));
        let m = monitor.route_metrics(&route).unwrap();
        assert_eq!(m.status, RouteStatus::Down);
        assert_eq!(m.health_score, 0.0);
        // Raised on the transition only
        let down = monitor.alerts().of_type(AlertType::RouteDown);
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].metadata.get("source_up").map(String::as_str), Some("false"));
        assert_eq!(down[0].metadata.get("target_up").map(String::as_str), Some("true"));
        
        eth.healthy.store(true, Ordering::SeqCst);
        monitor.run_health_checks().await;
        assert!(monitor.alerts().of_type(AlertType::RouteDown).iter().all(|a| a.resolved));
        assert_eq!(monitor.health_report().down_chains.len(), 0);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_missing_adapter_counts_as_down() {
        let (monitor, _, _) = setup();
        let orphan = monitor.add_route(ChainId::from("solana"), ChainId::from("cosmos"));
        monitor.run_health_checks().await;
        
        assert_eq!(monitor.route_metrics(&orphan).unwrap().status, RouteStatus::Down);
        assert_eq!(monitor.health_report().down_chains, vec![ChainId::from("cosmos")]);
    }
    
    #[test]
    fn test_byzantine_hints_counted() {
        let (monitor, _, _) = setup();
        let chains = vec![ChainId::from("solana")];
        let alert = monitor.report_byzantine_anomaly(&chains, "request r1").unwrap();
        assert_eq!(alert.metadata.get("context").map(String::as_str), Some("request r1"));
        monitor.report_byzantine_anomaly(&chains, "request r2");
        assert!(monitor.report_byzantine_anomaly(&[], "request r3").is_none());
        
        assert_eq!(monitor.byzantine_hints(&ChainId::from("solana")), 2);
        assert_eq!(monitor.byzantine_hints(&ChainId::from("ethereum")), 0);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_loops_run_until_stopped() {
        let (monitor, _, route) = setup();
        for _ in 0..10 {
            monitor.record_transfer(&route, Duration::from_millis(200), false).unwrap();
        }
        let handle = monitor.clone().start();
        
        tokio::time::sleep(Duration::from_millis(25_000)).await;
        handle.stop().await;
        
        // Alert loop ticks at 0s, 10s, 20s
        let fired = monitor.alerts().of_type(AlertType::HighErrorRate).len();
        assert_eq!(fired, 3);
        
        tokio::time::sleep(Duration::from_millis(30_000)).await;
        assert_eq!(monitor.alerts().of_type(AlertType::HighErrorRate).len(), fired);
    }
}
