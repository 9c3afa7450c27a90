//! Concordia Consensus Algorithms
//! 
//! Low-level Byzantine agreement between chain participants:
//! - PBFT-style three-phase agreement with view change
//! - HotStuff-style agreement with quorum certificates
//! - Weighted Byzantine voting with reputation
//! - An engine that owns instances and selects algorithms

pub mod algorithm;
pub mod cluster;
pub mod engine;
pub mod hotstuff;
pub mod message;
pub mod pbft;
pub mod state;
pub mod weighted;

pub use algorithm::*;
pub use cluster::*;
pub use engine::*;
pub use hotstuff::*;
pub use message::*;
pub use pbft::*;
pub use state::*;
pub use weighted::*;
