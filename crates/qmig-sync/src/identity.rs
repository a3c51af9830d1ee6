//! External → internal identifier translation with a per-run cache.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use qmig_core::{EntityType, MappingEntry};
use qmig_storage::{MappingStore, Retried, RetryPolicy, StoreError};
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct CacheState {
    entries: HashMap<EntityType, HashMap<String, Uuid>>,
    /// Entity types whose full mapping slice is cached; misses need no store round trip.
    preloaded: HashSet<EntityType>,
}

/// Cache in front of the durable mapping table.
///
/// With write-through disabled (dry runs) `set` and `set_batch` only touch the cache,
/// so later stages still resolve foreign keys without anything being persisted.
pub struct IdentityMap {
    store: Arc<dyn MappingStore>,
    retry: RetryPolicy,
    write_through: bool,
    cache: RwLock<CacheState>,
}

impl IdentityMap {
    pub fn new(store: Arc<dyn MappingStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            write_through: true,
            cache: RwLock::new(CacheState::default()),
        }
    }

    pub fn cache_only(store: Arc<dyn MappingStore>, retry: RetryPolicy) -> Self {
        Self {
            write_through: false,
            ..Self::new(store, retry)
        }
    }

    pub fn writes_through(&self) -> bool {
        self.write_through
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads every stored mapping for `entity` into the cache. Entries set earlier in this
    /// run win over stored ones.
    pub async fn preload_cache(&self, entity: EntityType) -> Result<usize, Retried<StoreError>> {
        let stored = self
            .retry
            .run(|_| self.store.load_all(entity), StoreError::disposition)
            .await?;
        let mut cache = self.write();
        let slot = cache.entries.entry(entity).or_default();
        for (external_id, internal_id) in stored {
            slot.entry(external_id).or_insert(internal_id);
        }
        let count = slot.len();
        cache.preloaded.insert(entity);
        debug!(%entity, count, "preloaded identity cache");
        Ok(count)
    }

    pub fn is_preloaded(&self, entity: EntityType) -> bool {
        self.read().preloaded.contains(&entity)
    }

    pub fn cached(&self, entity: EntityType, external_id: &str) -> Option<Uuid> {
        self.read()
            .entries
            .get(&entity)
            .and_then(|m| m.get(external_id))
            .copied()
    }

    pub async fn get(
        &self,
        entity: EntityType,
        external_id: &str,
    ) -> Result<Option<Uuid>, Retried<StoreError>> {
        if let Some(id) = self.cached(entity, external_id) {
            return Ok(Some(id));
        }
        if self.is_preloaded(entity) {
            return Ok(None);
        }
        let found = self
            .retry
            .run(|_| self.store.get(entity, external_id), StoreError::disposition)
            .await?;
        if let Some(id) = found {
            self.write()
                .entries
                .entry(entity)
                .or_default()
                .insert(external_id.to_string(), id);
        }
        Ok(found)
    }

    /// Resolves several ids of one type; absent ids are simply missing from the result.
    pub async fn get_batch(
        &self,
        entity: EntityType,
        external_ids: &[String],
    ) -> Result<HashMap<String, Uuid>, Retried<StoreError>> {
        let mut found = HashMap::with_capacity(external_ids.len());
        let mut misses = Vec::new();
        {
            let cache = self.read();
            let slot = cache.entries.get(&entity);
            for external_id in external_ids {
                match slot.and_then(|m| m.get(external_id)) {
                    Some(id) => {
                        found.insert(external_id.clone(), *id);
                    }
                    None => misses.push(external_id.clone()),
                }
            }
            if cache.preloaded.contains(&entity) {
                misses.clear();
            }
        }
        if misses.is_empty() {
            return Ok(found);
        }
        let fetched = self
            .retry
            .run(|_| self.store.get_many(entity, &misses), StoreError::disposition)
            .await?;
        if !fetched.is_empty() {
            let mut cache = self.write();
            let slot = cache.entries.entry(entity).or_default();
            for (external_id, id) in &fetched {
                slot.insert(external_id.clone(), *id);
            }
        }
        found.extend(fetched);
        Ok(found)
    }

    pub async fn is_migrated(
        &self,
        entity: EntityType,
        external_id: &str,
    ) -> Result<bool, Retried<StoreError>> {
        Ok(self.get(entity, external_id).await?.is_some())
    }

    pub async fn set(
        &self,
        entity: EntityType,
        external_id: &str,
        internal_id: Uuid,
    ) -> Result<(), Retried<StoreError>> {
        self.set_batch(&[MappingEntry {
            entity,
            external_id: external_id.to_string(),
            internal_id,
            created_at: Utc::now(),
        }])
        .await
    }

    /// Idempotent upsert of many mappings with one store write.
    pub async fn set_batch(&self, entries: &[MappingEntry]) -> Result<(), Retried<StoreError>> {
        if entries.is_empty() {
            return Ok(());
        }
        if self.write_through {
            self.retry
                .run(|_| self.store.upsert(entries), StoreError::disposition)
                .await?;
        }
        let mut cache = self.write();
        for entry in entries {
            cache
                .entries
                .entry(entry.entity)
                .or_default()
                .insert(entry.external_id.clone(), entry.internal_id);
        }
        Ok(())
    }

    /// Drops the stored and cached slice for `entity`.
    pub async fn clear(&self, entity: EntityType) -> Result<(), Retried<StoreError>> {
        if self.write_through {
            self.retry
                .run(|_| self.store.clear(entity), StoreError::disposition)
                .await?;
        }
        let mut cache = self.write();
        cache.entries.remove(&entity);
        // An emptied slice is fully known.
        cache.preloaded.insert(entity);
        Ok(())
    }

    pub fn cached_len(&self, entity: EntityType) -> usize {
        self.read().entries.get(&entity).map_or(0, HashMap::len)
    }

    /// Ends the run's cache lifetime. The backing store is untouched.
    pub fn discard_cache(&self) {
        *self.write() = CacheState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmig_storage::MemoryMappingStore;

    fn map_with(store: Arc<MemoryMappingStore>) -> IdentityMap {
        IdentityMap::new(store, RetryPolicy::default())
    }

    #[tokio::test]
    async fn get_after_set_returns_value() {
        let store = Arc::new(MemoryMappingStore::new());
        let identity = map_with(store.clone());
        let id = Uuid::new_v4();
        identity.set(EntityType::Company, "c1", id).await.expect("set");
        assert_eq!(identity.get(EntityType::Company, "c1").await.expect("get"), Some(id));
        assert_eq!(store.len(EntityType::Company), 1);
    }

    #[tokio::test]
    async fn preloaded_misses_skip_the_store() {
        let store = Arc::new(MemoryMappingStore::new());
        let identity = map_with(store.clone());
        identity.preload_cache(EntityType::Tag).await.expect("preload");
        assert_eq!(identity.get(EntityType::Tag, "nope").await.expect("get"), None);
        assert_eq!(store.lookups(), 0);
    }

    #[tokio::test]
    async fn batch_lookup_mixes_cache_and_store() {
        let store = Arc::new(MemoryMappingStore::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .upsert(&[MappingEntry {
                entity: EntityType::Choice,
                external_id: "b".into(),
                internal_id: b,
                created_at: Utc::now(),
            }])
            .await
            .expect("seed");
        let identity = map_with(store.clone());
        identity.set(EntityType::Choice, "a", a).await.expect("set");

        let found = identity
            .get_batch(EntityType::Choice, &["a".into(), "b".into(), "c".into()])
            .await
            .expect("batch");
        assert_eq!(found.get("a"), Some(&a));
        assert_eq!(found.get("b"), Some(&b));
        assert!(!found.contains_key("c"));
        assert_eq!(identity.cached(EntityType::Choice, "b"), Some(b));
    }

    #[tokio::test]
    async fn cache_only_map_never_persists() {
        let store = Arc::new(MemoryMappingStore::new());
        let identity = IdentityMap::cache_only(store.clone(), RetryPolicy::default());
        identity
            .set(EntityType::Sheet, "r1", Uuid::new_v4())
            .await
            .expect("set");
        assert!(identity.is_migrated(EntityType::Sheet, "r1").await.expect("check"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn clear_empties_store_and_cache() {
        let store = Arc::new(MemoryMappingStore::new());
        let identity = map_with(store.clone());
        identity.set(EntityType::User, "u1", Uuid::new_v4()).await.expect("set");
        identity.clear(EntityType::User).await.expect("clear");
        assert_eq!(identity.get(EntityType::User, "u1").await.expect("get"), None);
        assert_eq!(store.len(EntityType::User), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_is_retried() {
        let store = Arc::new(MemoryMappingStore::new());
        store.fail_next(2);
        let identity = map_with(store.clone());
        identity
            .set(EntityType::Section, "s1", Uuid::new_v4())
            .await
            .expect("third attempt lands");
        assert_eq!(store.len(EntityType::Section), 1);
    }
}
