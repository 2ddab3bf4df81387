//! Cached effective configs and the write path that invalidates them.
//!
//! Layers live in a [`LayerSource`] owned by the persistence tier. Reads go
//! through [`ConfigService::effective`], which resolves and caches. Writes go
//! through [`ConfigWriter`], which updates the store and then publishes the
//! matching [`InvalidationEvent`] so every node drops what it cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cascade::{resolve, ConfigLayer, EffectiveConfig, PartialConfig, Tier};
use crate::error::Result;
use crate::events::{EntityKind, InvalidationBus, InvalidationEvent};
use crate::types::personality_key;

/// The triple an effective config is computed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigScope {
    pub user_id: String,
    pub personality_id: String,
    pub channel_id: String,
}

impl ConfigScope {
    /// The personality is stored in its canonical form.
    pub fn new(
        user_id: impl Into<String>,
        personality_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        let personality_id: String = personality_id.into();
        Self {
            user_id: user_id.into(),
            personality_id: personality_key(&personality_id),
            channel_id: channel_id.into(),
        }
    }

    fn touched_by(&self, kind: EntityKind, id: &str) -> bool {
        match kind {
            EntityKind::User => self.user_id == id,
            EntityKind::Personality => self.personality_id == personality_key(id),
            EntityKind::Channel => self.channel_id == id,
        }
    }
}

/// Address of one stored layer row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKey {
    System,
    Personality(String),
    User(String),
    Channel(String),
    UserPersonality { user_id: String, personality_id: String },
}

impl LayerKey {
    pub fn tier(&self) -> Tier {
        match self {
            LayerKey::System => Tier::System,
            LayerKey::Personality(_) => Tier::Personality,
            LayerKey::User(_) => Tier::User,
            LayerKey::Channel(_) => Tier::Channel,
            LayerKey::UserPersonality { .. } => Tier::UserPersonality,
        }
    }

    /// The entity whose cached configs a write to this layer makes stale.
    /// `None` means every cached config.
    pub fn entity(&self) -> Option<(EntityKind, String)> {
        match self {
            LayerKey::System => None,
            LayerKey::Personality(id) => Some((EntityKind::Personality, id.clone())),
            LayerKey::User(id) => Some((EntityKind::User, id.clone())),
            LayerKey::Channel(id) => Some((EntityKind::Channel, id.clone())),
            // Evicts the user's entries across personalities; slightly broad.
            LayerKey::UserPersonality { user_id, .. } => Some((EntityKind::User, user_id.clone())),
        }
    }

    /// The same key with any personality id in canonical form.
    pub fn normalized(self) -> Self {
        match self {
            LayerKey::Personality(id) => LayerKey::Personality(personality_key(&id)),
            LayerKey::UserPersonality {
                user_id,
                personality_id,
            } => LayerKey::UserPersonality {
                user_id,
                personality_id: personality_key(&personality_id),
            },
            other => other,
        }
    }

    /// Keys of every layer that applies to `scope`, most general first.
    pub fn for_scope(scope: &ConfigScope) -> [LayerKey; 5] {
        [
            LayerKey::System,
            LayerKey::Personality(scope.personality_id.clone()),
            LayerKey::User(scope.user_id.clone()),
            LayerKey::Channel(scope.channel_id.clone()),
            LayerKey::UserPersonality {
                user_id: scope.user_id.clone(),
                personality_id: scope.personality_id.clone(),
            },
        ]
    }
}

/// Storage of config layer rows.
#[async_trait]
pub trait LayerSource: Send + Sync {
    async fn load_layers(&self, scope: &ConfigScope) -> Result<Vec<ConfigLayer>>;
    async fn put_layer(&self, key: LayerKey, values: PartialConfig) -> Result<()>;
    async fn delete_layer(&self, key: &LayerKey) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemoryLayers {
    rows: RwLock<HashMap<LayerKey, PartialConfig>>,
}

impl InMemoryLayers {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LayerSource for InMemoryLayers {
    async fn load_layers(&self, scope: &ConfigScope) -> Result<Vec<ConfigLayer>> {
        let rows = self.rows.read();
        Ok(LayerKey::for_scope(scope)
            .into_iter()
            .filter_map(|key| {
                rows.get(&key)
                    .map(|values| ConfigLayer::new(key.tier(), values.clone()))
            })
            .collect())
    }

    async fn put_layer(&self, key: LayerKey, values: PartialConfig) -> Result<()> {
        self.rows.write().insert(key, values);
        Ok(())
    }

    async fn delete_layer(&self, key: &LayerKey) -> Result<bool> {
        Ok(self.rows.write().remove(key).is_some())
    }
}

// ── Cache ──

struct CachedConfig {
    config: EffectiveConfig,
    stored_at: Instant,
}

/// Effective configs keyed by scope. Invalidation events are the primary
/// eviction path; the TTL bounds staleness when an event is missed.
///
/// Every applied event bumps a generation counter. A reader that loaded
/// layers before an event landed must not cache what it loaded, so inserts
/// go through [`ConfigCache::insert_if_current`].
pub struct ConfigCache {
    entries: Mutex<HashMap<ConfigScope, CachedConfig>>,
    generation: AtomicU64,
    ttl: Duration,
}

impl ConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn get(&self, scope: &ConfigScope) -> Option<EffectiveConfig> {
        let mut entries = self.entries.lock();
        match entries.get(scope) {
            Some(cached) if cached.stored_at.elapsed() < self.ttl => Some(cached.config.clone()),
            Some(_) => {
                debug!(?scope, "cached config expired");
                entries.remove(scope);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, scope: ConfigScope, config: EffectiveConfig) {
        self.entries.lock().insert(
            scope,
            CachedConfig {
                config,
                stored_at: Instant::now(),
            },
        );
    }

    /// Insert only if no event was applied since `seen` was read from
    /// [`generation`](Self::generation). Returns whether it was stored.
    pub fn insert_if_current(&self, scope: ConfigScope, config: EffectiveConfig, seen: u64) -> bool {
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::Acquire) != seen {
            debug!(?scope, "config changed during load, not caching");
            return false;
        }
        entries.insert(
            scope,
            CachedConfig {
                config,
                stored_at: Instant::now(),
            },
        );
        true
    }

    /// Drop whatever `event` makes stale. Returns the number of entries removed.
    pub fn apply(&self, event: &InvalidationEvent) -> usize {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let before = entries.len();
        match event {
            InvalidationEvent::All => entries.clear(),
            InvalidationEvent::Entity { kind, id } => {
                entries.retain(|scope, _| !scope.touched_by(*kind, id));
            }
        }
        let removed = before - entries.len();
        if removed > 0 {
            debug!(?event, removed, "config cache invalidated");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Evict on every event published to `bus` until `shutdown` fires.
    pub fn attach(self: &Arc<Self>, bus: &InvalidationBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        bus.spawn_handler(
            move |event| {
                cache.apply(event);
            },
            shutdown,
        )
    }
}

/// Read side: resolve-and-cache.
pub struct ConfigService {
    store: Arc<dyn LayerSource>,
    cache: Arc<ConfigCache>,
}

impl ConfigService {
    pub fn new(store: Arc<dyn LayerSource>, cache: Arc<ConfigCache>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    pub async fn effective(&self, scope: &ConfigScope) -> Result<EffectiveConfig> {
        if let Some(config) = self.cache.get(scope) {
            return Ok(config);
        }
        let seen = self.cache.generation();
        let layers = self.store.load_layers(scope).await?;
        let resolution = resolve(&layers);
        if !resolution.rejected.is_empty() {
            info!(
                ?scope,
                rejected = resolution.rejected.len(),
                "resolved config with rejected layers"
            );
        }
        self.cache
            .insert_if_current(scope.clone(), resolution.config.clone(), seen);
        Ok(resolution.config)
    }
}

/// Write side: update the store, then tell every node.
pub struct ConfigWriter {
    store: Arc<dyn LayerSource>,
    bus: InvalidationBus,
    invalidate_all_threshold: usize,
}

impl ConfigWriter {
    pub fn new(store: Arc<dyn LayerSource>, bus: InvalidationBus, invalidate_all_threshold: usize) -> Self {
        Self {
            store,
            bus,
            invalidate_all_threshold,
        }
    }

    /// Write one layer. System-tier writes invalidate everything.
    pub async fn write(&self, key: LayerKey, values: PartialConfig) -> Result<()> {
        let key = key.normalized();
        let entity = key.entity();
        self.store.put_layer(key, values).await?;
        self.publish_for(entity);
        Ok(())
    }

    pub async fn delete(&self, key: &LayerKey) -> Result<bool> {
        let key = key.clone().normalized();
        let removed = self.store.delete_layer(&key).await?;
        if removed {
            self.publish_for(key.entity());
        }
        Ok(removed)
    }

    /// Write many layers and publish once per distinct entity, or a single
    /// `All` when the write is system-wide or touches too many entities.
    ///
    /// A failed write stops the batch. Layers stored before it are still
    /// invalidated, then the error is returned.
    pub async fn write_bulk(&self, writes: Vec<(LayerKey, PartialConfig)>) -> Result<()> {
        let mut entities = Vec::with_capacity(writes.len());
        let mut system_wide = false;
        let mut outcome = Ok(());
        for (key, values) in writes {
            let key = key.normalized();
            let entity = key.entity();
            if let Err(e) = self.store.put_layer(key, values).await {
                warn!(written = entities.len(), "bulk config write failed: {}", e);
                outcome = Err(e);
                break;
            }
            match entity {
                Some(entity) => entities.push(entity),
                None => system_wide = true,
            }
        }
        if system_wide {
            self.bus.publish(InvalidationEvent::All);
        } else if !entities.is_empty() {
            self.bus.publish_bulk(entities, self.invalidate_all_threshold);
        }
        outcome
    }

    fn publish_for(&self, entity: Option<(EntityKind, String)>) {
        let event = match entity {
            Some((kind, id)) => InvalidationEvent::entity(kind, id),
            None => InvalidationEvent::All,
        };
        self.bus.publish(event);
    }
}
