//! Configuration types for Concordia

use crate::types::{AlgorithmKind, ConsensusMode};
use serde::{Deserialize, Serialize};

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name for logging
    pub name: String,
    
    /// Logging filter (e.g. `info`, `concordia_bridge=debug`)
    pub log_level: String,
    
    /// Low-level algorithm engine configuration
    pub engine: EngineConfig,
    
    /// Bridge voting configuration
    pub bridge: BridgeConfig,
    
    /// Orchestrator configuration
    pub orchestrator: OrchestratorConfig,
    
    /// Health monitor configuration
    pub monitor: MonitorConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "concordia-node".to_string(),
            log_level: "info".to_string(),
            engine: EngineConfig::default(),
            bridge: BridgeConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parse a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
    
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Configuration of the advanced (algorithm-level) engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of decision latencies kept per algorithm
    pub stats_window: usize,
    
    /// Latency budget handed to algorithm selection, in milliseconds
    pub latency_budget_ms: u64,
    
    /// Assumed fraction of Byzantine participants for algorithm selection
    pub assumed_byzantine_fraction: f64,
    
    /// Upper bound on messages delivered while driving one local instance
    pub max_messages_per_instance: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stats_window: 100,
            latency_budget_ms: 5_000,
            assumed_byzantine_fraction: 0.2,
            max_messages_per_instance: 10_000,
        }
    }
}

/// Bridge-level voting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Mode used when a process config does not name one
    pub default_mode: ConsensusMode,
    
    /// Accumulated weight fraction required in weighted mode
    pub weighted_threshold: f64,
    
    /// Accumulated weight fraction required in BFT mode
    pub bft_threshold: f64,
    
    /// Process timeout in milliseconds
    pub timeout_ms: u64,
    
    /// Number of completed results retained
    pub max_history: usize,
    
    /// Byzantine detector settings
    pub detector: DetectorConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_mode: ConsensusMode::Bft,
            weighted_threshold: 0.67,
            bft_threshold: 0.67,
            timeout_ms: 120_000,
            max_history: 1000,
            detector: DetectorConfig::default(),
        }
    }
}

/// Confidence-outlier detector settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Distance from the mean, in standard deviations, that marks an outlier
    pub sigma: f64,
    
    /// Outlier fraction above which a round is flagged Byzantine-suspect
    pub max_outlier_fraction: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sigma: 2.0,
            max_outlier_fraction: 1.0 / 3.0,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Minimum healthy participants required to start a request
    pub min_participants: usize,
    
    /// Shared deadline for the verification fan-out, in milliseconds
    pub verification_timeout_ms: u64,
    
    /// Consensus score at or above which a claim is VERIFIED
    pub consensus_threshold: f64,
    
    /// Consensus score below which a claim is REJECTED
    pub rejection_threshold: f64,
    
    /// Bridge voting mode when not using the advanced engine
    pub voting_mode: ConsensusMode,
    
    /// Drive the vote through the algorithm engine instead of bridge voting
    pub advanced_mode: bool,
    
    /// Force an algorithm in advanced mode instead of selecting one
    pub algorithm: Option<AlgorithmKind>,
    
    /// Finalize advanced decisions with a threshold signature
    pub threshold_signatures: bool,
    
    /// How long shutdown waits for in-flight requests, in milliseconds
    pub drain_timeout_ms: u64,
    
    /// Number of finished requests retained
    pub max_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_participants: 3,
            verification_timeout_ms: 30_000,
            consensus_threshold: 0.67,
            rejection_threshold: 0.3,
            voting_mode: ConsensusMode::Weighted,
            advanced_mode: false,
            algorithm: None,
            threshold_signatures: true,
            drain_timeout_ms: 10_000,
            max_history: 1000,
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Health-check loop interval in milliseconds
    pub health_check_interval_ms: u64,
    
    /// Alert-check loop interval in milliseconds
    pub alert_check_interval_ms: u64,
    
    /// Rolling metrics window in milliseconds
    pub window_ms: u64,
    
    /// Latency at which the latency factor of the health score reaches zero
    pub max_acceptable_latency_ms: f64,
    
    /// Timeout for a single adapter health probe in milliseconds
    pub probe_timeout_ms: u64,
    
    /// Age after which alerts expire, in milliseconds
    pub alert_expiry_ms: u64,
    
    /// Maximum number of alerts retained
    pub max_alerts: usize,
    
    /// Suppress a new alert while an unresolved one of the same kind exists
    pub dedupe_alerts: bool,
    
    /// Two-tier alert thresholds
    pub thresholds: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30_000,
            alert_check_interval_ms: 10_000,
            window_ms: 60_000,
            max_acceptable_latency_ms: 30_000.0,
            probe_timeout_ms: 5_000,
            alert_expiry_ms: 24 * 60 * 60 * 1000,
            max_alerts: 1000,
            dedupe_alerts: false,
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Warning/critical thresholds for route metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Average latency (ms) above which to warn
    pub latency_warning_ms: f64,
    pub latency_critical_ms: f64,
    
    /// Throughput (transfers/s) below which to warn
    pub throughput_warning: f64,
    pub throughput_critical: f64,
    
    /// Error rate above which to warn
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    
    /// Health score below which to warn
    pub health_warning: f64,
    pub health_critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            latency_warning_ms: 5_000.0,
            latency_critical_ms: 15_000.0,
            throughput_warning: 0.1,
            throughput_critical: 0.01,
            error_rate_warning: 0.05,
            error_rate_critical: 0.2,
            health_warning: 0.7,
            health_critical: 0.4,
        }
    }
}
