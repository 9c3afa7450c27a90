//! Concordia Multi-Chain Orchestrator
//!
//! Drives a verification request through INIT, VERIFY, VOTE, AGGREGATE and
//! FINALIZE across every participating chain adapter.

pub mod engine;
pub mod request;

pub use engine::*;
pub use request::*;
