//! Claude Code usage collector - domain model, storage and queries

pub mod append;
pub mod background;
pub mod block;
pub mod cache;
pub mod config;
pub mod models;
pub mod period;
pub mod pricing;
pub mod stats;
pub mod telemetry;

#[cfg(test)]
mod testutil;

pub use append::*;
pub use background::*;
pub use block::*;
pub use cache::*;
pub use config::*;
pub use models::*;
pub use period::*;
pub use pricing::*;
pub use stats::*;
