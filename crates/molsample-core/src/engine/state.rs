use crate::core::models::store::AttributeStore;

/// A scored snapshot of the attribute store.
///
/// Ordered so that lower scores compare greater, which makes a `BinaryHeap<Solution>`
/// pop the best solution first.
#[derive(Debug, Clone)]
pub struct Solution {
    pub score: f64,
    pub store: AttributeStore,
}

impl PartialEq for Solution {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}
impl Eq for Solution {}

impl PartialOrd for Solution {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Solution {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// Where the sampling driver is within one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerPhase {
    #[default]
    Idle,
    Proposing,
    Evaluating,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SamplingStatistics {
    pub steps: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub refinements: u64,
    pub consistency_checks: u64,
}

impl SamplingStatistics {
    pub fn acceptance_rate(&self) -> f64 {
        let decided = self.accepted + self.rejected;
        if decided == 0 {
            0.0
        } else {
            self.accepted as f64 / decided as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn solution(score: f64) -> Solution {
        Solution {
            score,
            store: AttributeStore::new(),
        }
    }

    #[test]
    fn lower_scores_rank_higher() {
        assert!(solution(-1.0) > solution(2.0));
        let mut heap: BinaryHeap<Solution> = [3.0, -2.0, 1.0].into_iter().map(solution).collect();
        assert_eq!(heap.pop().unwrap().score, -2.0);
        assert_eq!(heap.pop().unwrap().score, 1.0);
    }

    #[test]
    fn acceptance_rate_is_zero_before_any_decision() {
        let mut stats = SamplingStatistics::default();
        assert_eq!(stats.acceptance_rate(), 0.0);
        stats.accepted = 1;
        stats.rejected = 3;
        assert_eq!(stats.acceptance_rate(), 0.25);
    }
}
