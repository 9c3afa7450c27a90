//! Concordia Node
//!
//! Combines the components behind one configuration:
//! - Chain adapter registry
//! - Bridge vote engine and its deadline sweeper
//! - Multi-chain orchestrator
//! - Health monitor loops

mod node;
mod runtime;

pub use node::*;
pub use runtime::*;
