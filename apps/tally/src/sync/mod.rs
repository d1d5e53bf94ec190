pub mod bootstrap;
pub mod reconciler;
pub mod session;

pub use bootstrap::{Bootstrap, JoinMode};
pub use reconciler::{Reconciled, Reconciler, SideEffect, reconcile};
pub use session::{LocalChange, LocalIdentity, MeshHandle, MeshSession, SessionOptions, SyncEvent};
