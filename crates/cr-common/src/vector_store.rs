use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::embedding::cosine_similarity;

/// Pre-filter applied before the similarity scan.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub tenant_id: Option<String>,
    pub active_only: bool,
}

/// One k-NN hit: candidate id plus cosine similarity normalized to
/// 0.0..=1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub candidate_id: i64,
    pub similarity: f32,
}

/// Store/query interface over candidate vectors. Candidates without a
/// vector simply do not exist here; they are reachable only through the
/// keyword fallback.
pub trait VectorStore: Send + Sync {
    /// Full replacement keyed by candidate id. Upserting an existing id
    /// overwrites the prior vector.
    fn upsert(&self, candidate_id: i64, tenant_id: &str, vector: Vec<f32>, active: bool);

    fn remove(&self, candidate_id: i64);

    /// Top-k by cosine similarity, descending, candidate id ascending on
    /// ties.
    fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> Vec<VectorHit>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct Entry {
    tenant_id: String,
    vector: Vec<f32>,
    active: bool,
}

/// In-memory cosine-scan store. Hydrated from Postgres at startup and
/// kept current by upserts; read-mostly, a brute-force scan over a
/// bounded candidate population.
#[derive(Default)]
pub struct MemoryVectorStore {
    entries: RwLock<HashMap<i64, Entry>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorStore for MemoryVectorStore {
    fn upsert(&self, candidate_id: i64, tenant_id: &str, vector: Vec<f32>, active: bool) {
        let mut entries = self.entries.write().expect("vector store lock poisoned");
        entries.insert(
            candidate_id,
            Entry {
                tenant_id: tenant_id.to_string(),
                vector,
                active,
            },
        );
    }

    fn remove(&self, candidate_id: i64) {
        let mut entries = self.entries.write().expect("vector store lock poisoned");
        entries.remove(&candidate_id);
    }

    fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> Vec<VectorHit> {
        let entries = self.entries.read().expect("vector store lock poisoned");

        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|(_, entry)| {
                if filter.active_only && !entry.active {
                    return false;
                }
                match &filter.tenant_id {
                    Some(tenant) => entry.tenant_id == *tenant,
                    None => true,
                }
            })
            .map(|(id, entry)| VectorHit {
                candidate_id: *id,
                similarity: cosine_similarity(query, &entry.vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then(a.candidate_id.cmp(&b.candidate_id))
        });
        hits.truncate(k);
        hits
    }

    fn len(&self) -> usize {
        self.entries.read().expect("vector store lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(entries: &[(i64, &str, Vec<f32>, bool)]) -> MemoryVectorStore {
        let store = MemoryVectorStore::new();
        for (id, tenant, vector, active) in entries {
            store.upsert(*id, tenant, vector.clone(), *active);
        }
        store
    }

    #[test]
    fn search_ranks_by_similarity_descending() {
        let store = store_with(&[
            (1, "t1", vec![1.0, 0.0], true),
            (2, "t1", vec![0.0, 1.0], true),
            (3, "t1", vec![0.9, 0.1], true),
        ]);

        let hits = store.search(&[1.0, 0.0], 10, &SearchFilter::default());
        let ids: Vec<i64> = hits.iter().map(|h| h.candidate_id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn ties_break_on_ascending_candidate_id() {
        let store = store_with(&[
            (9, "t1", vec![1.0, 0.0], true),
            (4, "t1", vec![1.0, 0.0], true),
        ]);

        let hits = store.search(&[1.0, 0.0], 10, &SearchFilter::default());
        assert_eq!(hits[0].candidate_id, 4);
        assert_eq!(hits[1].candidate_id, 9);
    }

    #[test]
    fn filters_scope_tenant_and_active() {
        let store = store_with(&[
            (1, "t1", vec![1.0, 0.0], true),
            (2, "t2", vec![1.0, 0.0], true),
            (3, "t1", vec![1.0, 0.0], false),
        ]);

        let hits = store.search(
            &[1.0, 0.0],
            10,
            &SearchFilter {
                tenant_id: Some("t1".into()),
                active_only: true,
            },
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].candidate_id, 1);
    }

    #[test]
    fn upsert_is_a_full_overwrite() {
        let store = store_with(&[(1, "t1", vec![1.0, 0.0], true)]);
        store.upsert(1, "t1", vec![0.0, 1.0], true);

        let hits = store.search(&[0.0, 1.0], 1, &SearchFilter::default());
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn k_bounds_the_result_set() {
        let store = store_with(&[
            (1, "t1", vec![1.0, 0.0], true),
            (2, "t1", vec![0.5, 0.5], true),
            (3, "t1", vec![0.0, 1.0], true),
        ]);
        assert_eq!(store.search(&[1.0, 0.0], 2, &SearchFilter::default()).len(), 2);
    }
}
