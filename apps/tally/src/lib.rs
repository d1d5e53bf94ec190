//! Peer-mesh synchronization for collaborative story-point estimation.
//!
//! Peers find each other through a signaling rendezvous (`tally-road`),
//! negotiate direct links, and keep a replicated [`model::SessionState`]
//! eventually consistent without any central authority.

pub mod config;
pub mod error;
pub mod health;
pub mod mesh;
pub mod model;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use error::SyncError;
pub use protocol::PeerId;
