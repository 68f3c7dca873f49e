use crate::core::models::ids::EntityId;
use std::collections::{HashMap, HashSet};

pub type Pair = (EntityId, EntityId);

/// Orders a pair so that `(a, b)` and `(b, a)` map to the same key.
#[inline]
pub fn canonical_pair(a: EntityId, b: EntityId) -> Pair {
    if a < b { (a, b) } else { (b, a) }
}

/// Cached scores of the close pairs of one container.
///
/// Pairs are indexed by both members, so the pairs touching an entity are found in time
/// proportional to its degree. The cache also keeps the running sum of its scores.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairCache {
    scores: HashMap<Pair, f64>,
    touching: HashMap<EntityId, HashSet<EntityId>>,
    sum: f64,
}

impl PairCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the score of a pair, returning the previous score.
    pub fn insert(&mut self, a: EntityId, b: EntityId, score: f64) -> Option<f64> {
        let pair = canonical_pair(a, b);
        let previous = self.scores.insert(pair, score);
        match previous {
            Some(old) => self.sum += score - old,
            None => {
                self.sum += score;
                self.touching.entry(pair.0).or_default().insert(pair.1);
                self.touching.entry(pair.1).or_default().insert(pair.0);
            }
        }
        previous
    }

    pub fn remove(&mut self, a: EntityId, b: EntityId) -> Option<f64> {
        let pair = canonical_pair(a, b);
        let score = self.scores.remove(&pair)?;
        self.sum -= score;
        self.unlink(pair.0, pair.1);
        self.unlink(pair.1, pair.0);
        Some(score)
    }

    fn unlink(&mut self, from: EntityId, to: EntityId) {
        if let Some(neighbors) = self.touching.get_mut(&from) {
            neighbors.remove(&to);
            if neighbors.is_empty() {
                self.touching.remove(&from);
            }
        }
    }

    /// Removes every pair involving `entity` and returns them with their scores, sorted.
    pub fn remove_touching(&mut self, entity: EntityId) -> Vec<(Pair, f64)> {
        let Some(neighbors) = self.touching.get(&entity) else {
            return Vec::new();
        };
        let mut others: Vec<EntityId> = neighbors.iter().copied().collect();
        others.sort_unstable();
        others
            .into_iter()
            .filter_map(|other| {
                self.remove(entity, other)
                    .map(|score| (canonical_pair(entity, other), score))
            })
            .collect()
    }

    pub fn contains(&self, a: EntityId, b: EntityId) -> bool {
        self.scores.contains_key(&canonical_pair(a, b))
    }

    pub fn get(&self, a: EntityId, b: EntityId) -> Option<f64> {
        self.scores.get(&canonical_pair(a, b)).copied()
    }

    pub fn degree(&self, entity: EntityId) -> usize {
        self.touching.get(&entity).map_or(0, HashSet::len)
    }

    /// All cached pairs, sorted.
    pub fn pairs(&self) -> Vec<Pair> {
        let mut pairs: Vec<Pair> = self.scores.keys().copied().collect();
        pairs.sort_unstable();
        pairs
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Overwrites the running sum, used to restore an exact earlier value.
    pub(crate) fn set_sum(&mut self, sum: f64) {
        self.sum = sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::store::AttributeStore;
    use nalgebra::Point3;

    fn ids(n: usize) -> Vec<EntityId> {
        let mut store = AttributeStore::new();
        (0..n)
            .map(|i| store.add_point(format!("e{}", i), Point3::origin(), None))
            .collect()
    }

    #[test]
    fn pairs_are_unordered() {
        let e = ids(2);
        let mut cache = PairCache::new();
        cache.insert(e[1], e[0], 2.0);
        assert!(cache.contains(e[0], e[1]));
        assert_eq!(cache.get(e[0], e[1]), Some(2.0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn running_sum_follows_inserts_replacements_and_removals() {
        let e = ids(3);
        let mut cache = PairCache::new();
        cache.insert(e[0], e[1], 1.0);
        cache.insert(e[1], e[2], 2.0);
        assert_eq!(cache.sum(), 3.0);

        assert_eq!(cache.insert(e[0], e[1], 4.0), Some(1.0));
        assert_eq!(cache.sum(), 6.0);

        assert_eq!(cache.remove(e[2], e[1]), Some(2.0));
        assert_eq!(cache.sum(), 4.0);
        assert_eq!(cache.remove(e[2], e[1]), None);
    }

    #[test]
    fn remove_touching_drops_every_pair_of_an_entity() {
        let e = ids(4);
        let mut cache = PairCache::new();
        cache.insert(e[0], e[1], 1.0);
        cache.insert(e[0], e[2], 1.0);
        cache.insert(e[2], e[3], 1.0);
        assert_eq!(cache.degree(e[0]), 2);

        let removed = cache.remove_touching(e[0]);
        assert_eq!(removed.len(), 2);
        assert_eq!(cache.degree(e[0]), 0);
        assert_eq!(cache.degree(e[2]), 1);
        assert_eq!(cache.pairs(), vec![canonical_pair(e[2], e[3])]);
        assert!(cache.remove_touching(e[0]).is_empty());
    }
}
