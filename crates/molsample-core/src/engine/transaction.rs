use super::pair_cache::Pair;
use super::proximity::IndexUpdate;
use crate::core::models::ids::EntityId;
use crate::core::models::store::FloatSnapshot;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("No proposal is open; declare the moved set first")]
    NoActiveProposal,
    #[error("A proposal is already open; commit or roll it back first")]
    ProposalInProgress,
    #[error("The open proposal has not been scored yet")]
    NotEvaluated,
}

/// Where the incremental scoring function is in the propose/score/resolve cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProposalPhase {
    #[default]
    Idle,
    /// A moved set has been declared.
    Declared,
    /// The declared proposal has been scored and awaits commit or rollback.
    Evaluated,
}

#[derive(Debug, Clone)]
pub(crate) enum PairChange {
    Added { container: usize, pair: Pair },
    Removed { container: usize, pair: Pair, score: f64 },
}

/// Everything a proposal overwrote, in order of overwriting.
///
/// Created when the moved set is declared, dropped on commit, and replayed in reverse on
/// rollback.
#[derive(Debug, Clone)]
pub(crate) struct TransactionRecord {
    pub moved: Vec<EntityId>,
    pub total: f64,
    pub term_scores: Vec<(usize, f64)>,
    pub state_outputs: Vec<FloatSnapshot>,
    pub pair_sums: Vec<(usize, f64)>,
    pub index_updates: Vec<(usize, IndexUpdate)>,
    pub pair_changes: Vec<PairChange>,
}

impl TransactionRecord {
    pub fn new(moved: Vec<EntityId>, total: f64) -> Self {
        Self {
            moved,
            total,
            term_scores: Vec::new(),
            state_outputs: Vec::new(),
            pair_sums: Vec::new(),
            index_updates: Vec::new(),
            pair_changes: Vec::new(),
        }
    }
}
