use super::ModuleResolver;
use crate::trace::{ImageId, ProfileImage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

const SHARD_COUNT: usize = 64;

/// A resolver is created per image and per kind of code, since managed
/// methods of an image are looked up differently from its native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub image: ImageId,
    pub is_managed: bool,
}

type Slot = Arc<OnceLock<Arc<ModuleResolver>>>;

/// ModuleRegistry hands out one `ModuleResolver` per module. The shard lock
/// is only held to find the module's slot; construction runs in the slot's
/// once-cell, so other modules of the same shard are not blocked by it.
#[derive(Debug)]
pub struct ModuleRegistry {
    shards: Vec<Mutex<HashMap<ModuleKey, Slot>>>,
    constructions: AtomicUsize,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            constructions: AtomicUsize::new(0),
        }
    }

    fn slot(&self, key: ModuleKey) -> Slot {
        let shard = &self.shards[key.image.0 as usize % SHARD_COUNT];
        let mut shard = match shard.lock() {
            Ok(shard) => shard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(shard.entry(key).or_default())
    }

    /// Returns the resolver for `key`, running `create` if nobody has yet.
    /// Concurrent callers for the same key wait for the one running `create`
    /// and all get the same instance.
    pub fn get_or_create(
        &self,
        key: ModuleKey,
        create: impl FnOnce() -> ModuleResolver,
    ) -> Arc<ModuleResolver> {
        let slot = self.slot(key);
        let resolver = slot.get_or_init(|| {
            self.constructions.fetch_add(1, Ordering::Relaxed);
            Arc::new(create())
        });
        Arc::clone(resolver)
    }

    pub fn get(&self, key: ModuleKey) -> Option<Arc<ModuleResolver>> {
        let shard = &self.shards[key.image.0 as usize % SHARD_COUNT];
        let shard = match shard.lock() {
            Ok(shard) => shard,
            Err(poisoned) => poisoned.into_inner(),
        };
        shard.get(&key).and_then(|slot| slot.get().cloned())
    }

    /// Number of resolvers constructed so far.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::Relaxed)
    }

    /// Every constructed resolver, in image id order.
    pub fn resolvers(&self) -> Vec<Arc<ModuleResolver>> {
        let mut resolvers: Vec<Arc<ModuleResolver>> = self
            .shards
            .iter()
            .flat_map(|shard| {
                let shard = match shard.lock() {
                    Ok(shard) => shard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                shard
                    .values()
                    .filter_map(|slot| slot.get().cloned())
                    .collect::<Vec<_>>()
            })
            .collect();
        resolvers.sort_by_key(|r| (r.image().id, r.is_managed()));
        resolvers
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub samples: usize,
    pub memo_hits: usize,
    pub fast_path_hits: usize,
    pub registry_lookups: usize,
    pub unknown_frames: usize,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.samples += other.samples;
        self.memo_hits += other.memo_hits;
        self.fast_path_hits += other.fast_path_hits;
        self.registry_lookups += other.registry_lookups;
        self.unknown_frames += other.unknown_frames;
    }
}

/// State owned by one worker: the last resolver it used and its counters.
#[derive(Debug, Default)]
pub struct WorkerContext {
    last: Option<(ModuleKey, Arc<ModuleResolver>)>,
    pub stats: WorkerStats,
}

impl WorkerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver for `image`, from the single-slot cache when the previous
    /// frame was in the same module.
    pub fn resolver(
        &mut self,
        registry: &ModuleRegistry,
        image: &ProfileImage,
        is_managed: bool,
        create: impl FnOnce() -> ModuleResolver,
    ) -> Arc<ModuleResolver> {
        let key = ModuleKey {
            image: image.id,
            is_managed,
        };
        if let Some((last_key, resolver)) = &self.last {
            if *last_key == key {
                self.stats.fast_path_hits += 1;
                return Arc::clone(resolver);
            }
        }

        self.stats.registry_lookups += 1;
        let resolver = registry.get_or_create(key, create);
        self.last = Some((key, Arc::clone(&resolver)));
        resolver
    }
}
