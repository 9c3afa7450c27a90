//! Rolling route metrics

use concordia_core::{ChainId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Directed bridge route between two chains
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteId {
    pub source: ChainId,
    pub target: ChainId,
}

impl RouteId {
    pub fn new(source: ChainId, target: ChainId) -> Self {
        Self { source, target }
    }
    
    pub fn touches(&self, chain: &ChainId) -> bool {
        &self.source == chain || &self.target == chain
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

impl fmt::Debug for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouteId({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteStatus {
    Active,
    Down,
}

#[derive(Debug, Clone, Copy)]
struct TransferSample {
    at: Instant,
    latency_ms: f64,
    success: bool,
}

/// Snapshot of a route's metrics over the rolling window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteMetrics {
    pub route: RouteId,
    pub status: RouteStatus,
    pub sample_count: usize,
    pub average_latency_ms: f64,
    /// Successful transfers per second
    pub throughput: f64,
    pub error_rate: f64,
    /// Fraction of health probes in the window that found the route up
    pub uptime: f64,
    pub health_score: f64,
    pub updated: Timestamp,
}

/// Per-route sample window. Metrics are computed on read from the samples
/// still inside the window.
#[derive(Debug)]
pub struct RouteTracker {
    route: RouteId,
    window: Duration,
    max_acceptable_latency_ms: f64,
    status: RouteStatus,
    samples: VecDeque<TransferSample>,
    probes: VecDeque<(Instant, bool)>,
}

impl RouteTracker {
    pub fn new(route: RouteId, window: Duration, max_acceptable_latency_ms: f64) -> Self {
        Self {
            route,
            window,
            max_acceptable_latency_ms,
            status: RouteStatus::Active,
            samples: VecDeque::new(),
            probes: VecDeque::new(),
        }
    }
    
    pub fn route(&self) -> &RouteId {
        &self.route
    }
    
    pub fn status(&self) -> RouteStatus {
        self.status
    }
    
    /// Record one completed transfer
    pub fn record_transfer(&mut self, latency: Duration, success: bool) -> RouteMetrics {
        let now = Instant::now();
        self.prune(now);
        self.samples.push_back(TransferSample {
            at: now,
            latency_ms: latency.as_secs_f64() * 1000.0,
            success,
        });
        self.metrics_at(now)
    }
    
    /// Record a health probe; returns the previous status
    pub fn record_probe(&mut self, up: bool) -> RouteStatus {
        let now = Instant::now();
        self.prune(now);
        let previous = self.status;
        self.status = if up { RouteStatus::Active } else { RouteStatus::Down };
        self.probes.push_back((now, up));
        previous
    }
    
    /// Metrics over the samples inside the window as of now
    pub fn metrics(&self) -> RouteMetrics {
        self.metrics_at(Instant::now())
    }
    
    fn in_window(&self, now: Instant, at: Instant) -> bool {
        now.duration_since(at) <= self.window
    }
    
    fn prune(&mut self, now: Instant) {
        let window = self.window;
        while self.samples.front().map_or(false, |s| now.duration_since(s.at) > window) {
            self.samples.pop_front();
        }
        while self.probes.front().map_or(false, |(at, _)| now.duration_since(*at) > window) {
            self.probes.pop_front();
        }
    }
    
    fn metrics_at(&self, now: Instant) -> RouteMetrics {
        let (count, latency_sum, successes) = self
            .samples
            .iter()
            .filter(|s| self.in_window(now, s.at))
            .fold((0usize, 0.0, 0usize), |(n, sum, ok), s| (n + 1, sum + s.latency_ms, ok + s.success as usize));
        let average_latency_ms = if count > 0 { latency_sum / count as f64 } else { 0.0 };
        let error_rate = if count > 0 {
            (count - successes) as f64 / count as f64
        } else {
            0.0
        };
        let throughput = successes as f64 / self.window.as_secs_f64().max(f64::EPSILON);
        let (probes, ups) = self
            .probes
            .iter()
            .filter(|(at, _)| self.in_window(now, *at))
            .fold((0usize, 0usize), |(n, ups), (_, up)| (n + 1, ups + *up as usize));
        let uptime = if probes == 0 { 1.0 } else { ups as f64 / probes as f64 };
        
        let latency_factor = if self.max_acceptable_latency_ms > 0.0 {
            (1.0 - average_latency_ms / self.max_acceptable_latency_ms).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let active = if self.status == RouteStatus::Active { 1.0 } else { 0.0 };
        let health_score = (latency_factor * (1.0 - error_rate) * uptime * active).clamp(0.0, 1.0);
        
        RouteMetrics {
            route: self.route.clone(),
            status: self.status,
            sample_count: count,
            average_latency_ms,
            throughput,
            error_rate,
            uptime,
            health_score,
            updated: Timestamp::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    fn tracker() -> RouteTracker {
        RouteTracker::new(
            RouteId::new(ChainId::from("ethereum"), ChainId::from("solana")),
            Duration::from_secs(60),
            1000.0,
        )
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_all_failures_zero_health() {
        let mut t = tracker();
        for _ in 0..10 {
            t.record_transfer(Duration::from_millis(100), false);
        }
        let m = t.metrics();
        assert_eq!(m.error_rate, 1.0);
        assert_eq!(m.health_score, 0.0);
        assert_eq!(m.throughput, 0.0);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_health_score_composition() {
        let mut t = tracker();
        t.record_transfer(Duration::from_millis(500), true);
        t.record_transfer(Duration::from_millis(500), false);
        t.record_probe(true);
        t.record_probe(false);
        t.record_probe(true);
        
        let m = t.metrics();
        assert!((m.average_latency_ms - 500.0).abs() < 1e-9);
        assert!((m.error_rate - 0.5).abs() < 1e-9);
        assert!((m.uptime - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.health_score - 0.5 * 0.5 * (2.0 / 3.0)).abs() < 1e-9);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_down_route_scores_zero() {
        let mut t = tracker();
        for _ in 0..50 {
            t.record_transfer(Duration::from_millis(1), true);
        }
        assert!(t.metrics().health_score > 0.9);
        
        assert_eq!(t.record_probe(false), RouteStatus::Active);
        assert_eq!(t.metrics().health_score, 0.0);
        assert_eq!(t.status(), RouteStatus::Down);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_samples_leave_window() {
        let mut t = tracker();
        for _ in 0..5 {
            t.record_transfer(Duration::from_millis(10), false);
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        t.record_transfer(Duration::from_millis(10), true);
        
        let m = t.metrics();
        assert_eq!(m.sample_count, 1);
        assert_eq!(m.error_rate, 0.0);
        
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(t.metrics().sample_count, 0);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_metrics_age_without_new_samples() {
        let mut t = tracker();
        t.record_transfer(Duration::from_millis(10), false);
        t.record_probe(false);
        t.record_probe(true);
        assert_eq!(t.metrics().error_rate, 1.0);
        assert!((t.metrics().uptime - 0.5).abs() < 1e-9);
        
        // Nothing is recorded while the window slides past the samples
        tokio::time::advance(Duration::from_secs(61)).await;
        let m = t.metrics();
        assert_eq!(m.sample_count, 0);
        assert_eq!(m.error_rate, 0.0);
        assert_eq!(m.uptime, 1.0);
        assert_eq!(m.health_score, 1.0);
    }
}
