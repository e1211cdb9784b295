use std::sync::Arc;

use super::auth::AccessGuard;
use super::config::{StorageBackend, WatchConfig};
use super::hub::NotificationHub;
use super::releases::{GrayReleaseEngine, ReleaseTracker};
use super::store::ConfigStore;
use super::versions::VersionStore;

/// Shared application state for the HTTP server.
///
/// Every service shares one store and one hub, so a write through any of
/// them wakes watchers registered through the others.
pub struct AppState {
    /// Persistent storage backend.
    pub store: Arc<dyn ConfigStore>,
    /// Fan-out of change events to long polls.
    pub hub: Arc<NotificationHub>,
    pub versions: VersionStore,
    pub releases: ReleaseTracker,
    pub gray: GrayReleaseEngine,
    pub guard: AccessGuard,
    pub watch: WatchConfig,
    pub storage: StorageBackend,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        storage: StorageBackend,
        watch: WatchConfig,
        allow_unsigned: bool,
        trusted_proxies: Vec<String>,
    ) -> Arc<Self> {
        let hub = Arc::new(NotificationHub::new());
        Arc::new(Self {
            versions: VersionStore::new(Arc::clone(&store), Arc::clone(&hub)),
            releases: ReleaseTracker::new(Arc::clone(&store), Arc::clone(&hub)),
            gray: GrayReleaseEngine::new(Arc::clone(&store), Arc::clone(&hub)),
            guard: AccessGuard::new(Arc::clone(&store), allow_unsigned, trusted_proxies),
            store,
            hub,
            watch,
            storage,
        })
    }
}
