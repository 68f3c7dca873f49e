use super::derivatives::DerivativeAccumulator;
use crate::core::models::ids::EntityId;
use crate::core::models::store::{AttributeStore, StoreError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoringError {
    #[error("Attribute store error: {source}")]
    Store {
        #[from]
        source: StoreError,
    },
    #[error("Restraint '{restraint}' read entity {entity:?}, which is not among its declared inputs")]
    UndeclaredInput { restraint: String, entity: EntityId },
    #[error("Score state '{name}' failed: {reason}")]
    ScoreState { name: String, reason: String },
    #[error("'{source_name}' produced a non-finite score ({value})")]
    NonFinite { source_name: String, value: f64 },
}

/// A scoring unit: a penalty term over a declared set of input entities.
///
/// Implementations must be pure functions of the store for their declared inputs: the
/// incremental scoring machinery only re-evaluates a restraint when one of its inputs has
/// moved, so reading anything else makes cached scores silently stale. A restraint that
/// declares no inputs at all is re-evaluated on every scoring pass.
pub trait Restraint: Send + Sync {
    fn name(&self) -> &str;

    /// Entities whose attributes this restraint may read.
    fn inputs(&self) -> Vec<EntityId>;

    /// Evaluates the unweighted score against the current state.
    ///
    /// When `derivatives` is given, the gradient of the score with respect to every read
    /// float attribute is added to it; the accumulator applies the effective weight.
    fn evaluate(
        &self,
        store: &AttributeStore,
        derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError>;

    /// Splits this restraint into finer independent pieces whose scores sum to its own.
    ///
    /// An empty result means the restraint is already atomic.
    fn decompose(&self) -> Vec<Box<dyn Restraint>> {
        Vec::new()
    }
}
