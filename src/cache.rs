//! Process-lifetime result cache keyed by query signature.

use crate::exec::ResultSet;
use crate::query::QuerySignature;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of a cache lookup. A miss is ordinary control flow.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(Arc<ResultSet>),
    Miss,
}

#[derive(Debug, Default)]
pub struct ResultCache {
    entries: RwLock<HashMap<QuerySignature, Arc<ResultSet>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, signature: &QuerySignature) -> CacheLookup {
        match self.entries.read().get(signature) {
            Some(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Hit(result.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss
            }
        }
    }

    /// Store a result. When two workers race on the same signature the
    /// first stored result wins and is returned to both.
    pub fn insert(&self, signature: QuerySignature, result: ResultSet) -> Arc<ResultSet> {
        let mut entries = self.entries.write();
        let stored = entries
            .entry(signature)
            .or_insert_with(|| Arc::new(result))
            .clone();
        debug!("Result cache holds {} entries", entries.len());
        stored
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryRequest;
    use crate::value::Value;

    #[test]
    fn second_lookup_hits() {
        let cache = ResultCache::new();
        let query = QueryRequest::parse(r#"{"select": [{"COUNT": "*"}]}"#).unwrap();
        let signature = query.signature();

        assert!(matches!(cache.lookup(&signature), CacheLookup::Miss));
        let result = ResultSet::new(vec!["COUNT(*)".into()], vec![vec![Value::Int(3)]]);
        let stored = cache.insert(signature.clone(), result.clone());
        assert_eq!(*stored, result);

        match cache.lookup(&signature) {
            CacheLookup::Hit(hit) => assert_eq!(*hit, result),
            CacheLookup::Miss => panic!("expected a hit"),
        }
        assert_eq!((cache.hits(), cache.misses()), (1, 1));

        let other = ResultSet::new(vec!["COUNT(*)".into()], vec![vec![Value::Int(4)]]);
        assert_eq!(*cache.insert(signature, other), result);
        assert_eq!(cache.len(), 1);
    }
}
