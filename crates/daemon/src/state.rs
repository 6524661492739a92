use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::auth::AccessControl;
use common::crypto::MasterKey;

use crate::ciphertext::{CiphertextCache, Zone};
use crate::database::{ObjectStore, UserRecord};
use crate::events::{ActionResult, EventBus, EventTemplate, GlobalEvent};
use crate::service_config::Config;

/// Bounded cache of user records keyed by DN. Entries expire after ten
/// minutes so group membership changes are picked up without a restart.
#[derive(Clone)]
pub struct UserCache {
    cache: moka::sync::Cache<String, UserRecord>,
}

impl UserCache {
    pub fn new() -> Self {
        UserCache {
            cache: moka::sync::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(600))
                .build(),
        }
    }

    pub fn get(&self, dn: &str) -> Option<UserRecord> {
        self.cache.get(dn)
    }

    pub fn insert(&self, dn: String, record: UserRecord) {
        self.cache.insert(dn, record);
    }
}

impl Default for UserCache {
    fn default() -> Self {
        Self::new()
    }
}

struct StateInner {
    store: Arc<dyn ObjectStore>,
    access: Arc<dyn AccessControl>,
    bus: Arc<dyn EventBus>,
    caches: HashMap<Zone, Arc<CiphertextCache>>,
    default_zone: Zone,
    users: UserCache,
    master: MasterKey,
    config: Config,
}

/// Per-process dependency bundle injected into handlers and workers. All
/// fields are read-only after construction; cloning is cheap.
#[derive(Clone)]
pub struct ServiceState(Arc<StateInner>);

impl ServiceState {
    pub fn new(
        config: Config,
        store: Arc<dyn ObjectStore>,
        access: Arc<dyn AccessControl>,
        bus: Arc<dyn EventBus>,
        cache: Arc<CiphertextCache>,
        master: MasterKey,
    ) -> Self {
        let default_zone = cache.zone().clone();
        let mut caches = HashMap::new();
        caches.insert(default_zone.clone(), cache);
        ServiceState(Arc::new(StateInner {
            store,
            access,
            bus,
            caches,
            default_zone,
            users: UserCache::new(),
            master,
            config,
        }))
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.0.store
    }

    pub fn access(&self) -> &Arc<dyn AccessControl> {
        &self.0.access
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.0.bus
    }

    pub fn cache(&self) -> &Arc<CiphertextCache> {
        self.0
            .caches
            .get(&self.0.default_zone)
            .expect("default zone cache present")
    }

    pub fn cache_for_zone(&self, zone: &Zone) -> Option<&Arc<CiphertextCache>> {
        self.0.caches.get(zone)
    }

    pub fn users(&self) -> &UserCache {
        &self.0.users
    }

    pub fn master(&self) -> &MasterKey {
        &self.0.master
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn peer_signifier(&self) -> &str {
        &self.0.config.peers.signifier
    }

    /// Publish an audit event without blocking the request path. Failures
    /// are logged, never surfaced.
    pub fn publish_event(&self, event: GlobalEvent) {
        let bus = Arc::clone(&self.0.bus);
        tokio::spawn(async move {
            if let Err(e) = bus.publish(&event).await {
                tracing::warn!(
                    action = %event.action,
                    event_id = %event.event_id,
                    error = %e,
                    "unable to publish audit event"
                );
            }
        });
    }

    /// Convenience for the common emit-from-template path
    pub fn audit(
        &self,
        template: &EventTemplate,
        action: &str,
        result: ActionResult,
        target: Option<String>,
        messages: Vec<String>,
    ) {
        let mut event = template.event(action, result);
        event.action_target = target;
        event.action_target_messages = messages;
        self.publish_event(event);
    }
}
