//! In-memory store implementation, for tests and one-off runs

use crate::page::Offer;
use crate::store::traits::{OfferStore, StoreResult};
use std::collections::HashMap;

/// HashMap-backed offer store with the same upsert semantics as the SQLite
/// backend
#[derive(Debug, Default)]
pub struct MemoryStore {
    offers: HashMap<i64, Offer>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

impl OfferStore for MemoryStore {
    fn upsert_by_key(&mut self, key: i64, record: &Offer) -> StoreResult<bool> {
        match self.offers.get(&key) {
            None => {
                self.offers.insert(key, record.clone());
                Ok(true)
            }
            Some(existing) => {
                if existing != record {
                    tracing::warn!(
                        "Offer {} re-observed with different content; overwriting",
                        key
                    );
                    self.offers.insert(key, record.clone());
                }
                Ok(false)
            }
        }
    }

    fn records_by_keys(&self, keys: &[i64]) -> StoreResult<Vec<Offer>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.offers.get(key).cloned())
            .collect())
    }
}
