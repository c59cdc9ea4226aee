//! Lock-free hash table: a fixed power-of-two array of buckets, each an ordered
//! `ConcurrentSList` of entries. Every bucket retires its nodes to the table's hazard manager.

use crate::allocator::{GlobalNodeAllocator, NodeAllocator};
use crate::concurrent_slist::ConcurrentSList;
use crate::error::Result;
use crate::hazard_manager::HazardManager;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

pub const DEFAULT_BUCKET_COUNT: usize = 64;

pub struct ConcurrentHashTable<K, V, A: NodeAllocator = GlobalNodeAllocator> {
    buckets: Box<[ConcurrentSList<(K, V), A>]>,
    hash_builder: RandomState,
    manager: HazardManager,
}

fn key_less<K: Ord, V>(a: &(K, V), b: &(K, V)) -> bool {
    a.0 < b.0
}

impl<K, V> ConcurrentHashTable<K, V>
where
    K: Hash + Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_manager(HazardManager::new(), DEFAULT_BUCKET_COUNT)
    }

    pub fn with_bucket_count(bucket_count: usize) -> Self {
        Self::with_manager(HazardManager::new(), bucket_count)
    }
}

impl<K, V> Default for ConcurrentHashTable<K, V>
where
    K: Hash + Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, A> ConcurrentHashTable<K, V, A>
where
    K: Hash + Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    A: NodeAllocator,
{
    /// `bucket_count` is rounded up to a power of two.
    pub fn with_manager(manager: HazardManager, bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1).next_power_of_two();
        ConcurrentHashTable {
            buckets: (0..bucket_count)
                .map(|_| ConcurrentSList::with_manager(manager.clone()))
                .collect(),
            hash_builder: RandomState::new(),
            manager,
        }
    }

    #[inline]
    pub fn manager(&self) -> &HazardManager {
        &self.manager
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, key: &K) -> &ConcurrentSList<(K, V), A> {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        &self.buckets[hasher.finish() as usize & (self.buckets.len() - 1)]
    }

    /// Insert unless `key` is present. Returns true if inserted.
    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        let inserted = self
            .bucket(&key)
            .insert_unique((key, value), key_less)?;
        Ok(inserted.is_ok())
    }

    pub fn find(&self, key: &K) -> Result<Option<V>> {
        // Buckets are sorted: stop at the first entry not less than `key`.
        let found = self.bucket(key).find_if(|e| !(e.0 < *key))?;
        Ok(match found {
            Some(((k, v), _)) if k == *key => Some(v),
            _ => None,
        })
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Remove `key`. Returns false if it was not present.
    pub fn erase(&self, key: &K) -> Result<bool> {
        self.bucket(key).erase_if(|e| e.0 == *key)
    }

    /// Remove `key` and return its value.
    pub fn pop(&self, key: &K) -> Result<Option<V>> {
        let popped = self.bucket(key).pop_if(|e| e.0 == *key)?;
        Ok(popped.map(|(_, v)| v))
    }

    /// Entry count; exact only without concurrent writers.
    pub fn size(&self) -> Result<usize> {
        let mut size = 0;
        for bucket in self.buckets.iter() {
            size += bucket.size()?;
        }
        Ok(size)
    }

    pub fn empty(&self) -> Result<bool> {
        for bucket in self.buckets.iter() {
            if !bucket.empty()? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
