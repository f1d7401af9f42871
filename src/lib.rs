//! Hybrid realtime / polling acquisition of live vote tallies.
//!
//! An [`engine::EngineHandle`] keeps a vote's items current by subscribing to
//! a push change-feed when the connection is healthy, falling back to
//! periodic polling when it is not, and freezing into static mode when even
//! polling keeps failing.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod highlight;
pub mod models;
pub mod notify;
pub mod polling;
pub mod quality;
pub mod signals;
pub mod transport;
pub mod voting;

pub use config::EngineConfig;
pub use engine::{AcquisitionMode, EngineBuilder, EngineHandle, EngineSnapshot, ResourceCounts};
pub use models::{ChangeEvent, EntityId, VoteTallyItem};
pub use voting::RankedItem;
