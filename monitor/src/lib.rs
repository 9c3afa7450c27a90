//! Concordia Bridge Health Monitor
//!
//! Rolling per-route metrics, two-tier alerting with callbacks, and the
//! health-check and alert-check loops.

pub mod alert;
pub mod health;
pub mod metrics;

pub use alert::*;
pub use health::*;
pub use metrics::*;
