//! Concordia Bridge Voting
//! 
//! One vote process per cross-chain message, independent of the
//! algorithm that backs it:
//! - Simple-majority, weighted and BFT evaluation
//! - Absolute deadlines with forced timeout results
//! - Advisory confidence-outlier detection
//! - Signed wire envelope for bridge traffic

pub mod detector;
pub mod engine;
pub mod envelope;
pub mod process;
pub mod vote;

pub use detector::*;
pub use engine::*;
pub use envelope::*;
pub use process::*;
pub use vote::*;
