use super::derivatives::DerivativeAccumulator;
use super::pair_scores::PairScore;
use super::restraint::{Restraint, ScoringError};
use crate::core::models::ids::EntityId;
use crate::core::models::keys::FloatKey;
use crate::core::models::store::AttributeStore;
use itertools::Itertools;
use std::sync::Arc;

/// A pair score applied to one fixed pair of entities.
#[derive(Debug, Clone)]
pub struct PairRestraint {
    name: String,
    score: Arc<dyn PairScore>,
    pair: (EntityId, EntityId),
}

impl PairRestraint {
    pub fn new(name: impl Into<String>, score: Arc<dyn PairScore>, a: EntityId, b: EntityId) -> Self {
        Self {
            name: name.into(),
            score,
            pair: (a, b),
        }
    }

    pub fn pair(&self) -> (EntityId, EntityId) {
        self.pair
    }
}

impl Restraint for PairRestraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<EntityId> {
        vec![self.pair.0, self.pair.1]
    }

    fn evaluate(
        &self,
        store: &AttributeStore,
        derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError> {
        self.score.score(store, self.pair.0, self.pair.1, derivatives)
    }
}

/// A pair score summed over an explicit list of pairs.
///
/// Decomposes into one [`PairRestraint`] per pair, so moving one entity only re-scores the
/// pairs it takes part in.
#[derive(Debug, Clone)]
pub struct PairListRestraint {
    name: String,
    score: Arc<dyn PairScore>,
    pairs: Vec<(EntityId, EntityId)>,
}

impl PairListRestraint {
    pub fn new(
        name: impl Into<String>,
        score: Arc<dyn PairScore>,
        pairs: Vec<(EntityId, EntityId)>,
    ) -> Self {
        Self {
            name: name.into(),
            score,
            pairs,
        }
    }

    /// Builds a restraint over every unordered pair drawn from `entities`.
    pub fn all_pairs(name: impl Into<String>, score: Arc<dyn PairScore>, entities: &[EntityId]) -> Self {
        let pairs = entities
            .iter()
            .copied()
            .tuple_combinations()
            .collect();
        Self::new(name, score, pairs)
    }
}

impl Restraint for PairListRestraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<EntityId> {
        self.pairs
            .iter()
            .flat_map(|&(a, b)| [a, b])
            .unique()
            .collect()
    }

    fn evaluate(
        &self,
        store: &AttributeStore,
        mut derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError> {
        let mut total = 0.0;
        for &(a, b) in &self.pairs {
            total += self.score.score(store, a, b, derivatives.as_deref_mut())?;
        }
        Ok(total)
    }

    fn decompose(&self) -> Vec<Box<dyn Restraint>> {
        self.pairs
            .iter()
            .enumerate()
            .map(|(i, &(a, b))| {
                Box::new(PairRestraint::new(
                    format!("{}[{}]", self.name, i),
                    Arc::clone(&self.score),
                    a,
                    b,
                )) as Box<dyn Restraint>
            })
            .collect()
    }
}

/// Harmonic restraint `0.5 * k * (v - mean)^2` on a single float attribute.
#[derive(Debug, Clone)]
pub struct AttributeRestraint {
    name: String,
    entity: EntityId,
    key: FloatKey,
    mean: f64,
    k: f64,
}

impl AttributeRestraint {
    pub fn new(name: impl Into<String>, entity: EntityId, key: FloatKey, mean: f64, k: f64) -> Self {
        Self {
            name: name.into(),
            entity,
            key,
            mean,
            k,
        }
    }
}

impl Restraint for AttributeRestraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<EntityId> {
        vec![self.entity]
    }

    fn evaluate(
        &self,
        store: &AttributeStore,
        derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError> {
        let diff = store.get_float(self.entity, self.key)? - self.mean;
        if let Some(acc) = derivatives {
            acc.add(self.entity, self.key, self.k * diff);
        }
        Ok(0.5 * self.k * diff * diff)
    }
}

/// A restraint with a fixed value and no inputs.
#[derive(Debug, Clone)]
pub struct ConstantRestraint {
    name: String,
    value: f64,
}

impl ConstantRestraint {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl Restraint for ConstantRestraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<EntityId> {
        Vec::new()
    }

    fn evaluate(
        &self,
        _store: &AttributeStore,
        _derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError> {
        Ok(self.value)
    }
}
