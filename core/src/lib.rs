//! Concordia Core Library
//! 
//! Core types, traits, and abstractions shared by every Concordia crate:
//! identifiers, verification results, the error taxonomy, configuration and
//! the chain-adapter capability interface.

pub mod types;
pub mod traits;
pub mod error;
pub mod config;

pub use types::*;
pub use traits::*;
pub use error::*;
pub use config::*;
