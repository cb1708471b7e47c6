//! Server-side cache of relocatable compiled bodies shared across clients.
//!
//! Records are addressed by the class chain of the defining class, the
//! method's name and signature, and the optimization level. The server never
//! looks inside a record; clients relocate it against their own shared class
//! cache. A record keeps the assumptions its body was compiled under, and a
//! client validates them against its own hierarchy before installing it.

use crate::protocol::commit_data::CommitData;
use crate::protocol::message::{ClassChain, OptLevel};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AotCacheKey {
    pub class_chain: ClassChain,
    pub method_signature: String,
    pub opt_level: OptLevel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AotRecord {
    pub id: u64,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub commit: CommitData,
}

#[derive(Default)]
pub struct AotCache {
    records: RwLock<HashMap<AotCacheKey, AotRecord>>,
    next_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &AotCacheKey) -> Option<AotRecord> {
        let found = self.records.read().get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store a body unless one is already cached for `key`; returns the record id.
    pub fn store(&self, key: AotCacheKey, code: Vec<u8>, data: Vec<u8>, commit: CommitData) -> u64 {
        let mut records = self.records.write();
        if let Some(existing) = records.get(&key) {
            return existing.id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("stored AOT record {} for {} at {:?}", id, key.method_signature, key.opt_level);
        records.insert(key, AotRecord { id, code, data, commit });
        id
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
