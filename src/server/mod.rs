//! Child game-server processes: control protocol, per-process records, and
//! the registry/factory that owns their lifecycle.

pub mod control;
pub mod instance;
pub mod manager;
pub mod preset;

pub use control::{ClusterEvent, ControlCodec, ServerEvent};
pub use instance::{GameServer, ServerStatus, TrackedGame};
pub use manager::{ServerManager, ServerNotice};
pub use preset::PresetCatalog;
