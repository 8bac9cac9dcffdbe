pub mod manager;

pub use manager::{DeviceManager, DeviceManagerBuilder};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discovery deadline for [`DeviceManager::request`] on an unknown identity.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity-space notifications.
///
/// `New` fires the first time an identity is ever seen by this process;
/// later sightings of the same identity fire `Connect`, wherever the device
/// is plugged in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeviceEvent {
    New { id: String },
    Connect { id: String },
    Disconnect { id: String },
}

/// Snapshot of one currently-connected device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub port_path: String,
    pub last_seen: DateTime<Utc>,
}

/// Monotonic record of every identity this process has observed, shared
/// between device managers that coexist in one process so "new" keeps
/// meaning first-ever sighting.
pub type SeenRegistry = Arc<tokio::sync::Mutex<HashSet<String>>>;
