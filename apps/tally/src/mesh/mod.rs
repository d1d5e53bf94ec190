pub mod broadcast;
pub mod manager;

pub use broadcast::{Broadcaster, Inbound};
pub use manager::{ConnectionState, MeshInput, MeshSettings, PeerEvent, PeerManager};
