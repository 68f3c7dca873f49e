use super::dependency::score_state_order;
use super::error::EngineError;
use crate::core::models::entity::Decoration;
use crate::core::models::ids::{EntityId, ScoreStateId};
use crate::core::models::keys::KeyRegistry;
use crate::core::models::store::{AttributeStore, StoreError};
use crate::core::scoring::derivatives::{DerivativeAccumulator, DerivativeBuffer};
use crate::core::scoring::registry::{FlatLeaf, RestraintRegistry};
use crate::core::scoring::restraint::{Restraint, ScoringError};
use crate::core::scoring::score_state::{Centroid, ScoreState};
use nalgebra::Point3;
use tracing::{error, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Identifies the structure a derived cache was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StructureVersion {
    pub shape: u64,
    pub registry: u64,
}

/// The top-level modeling problem: keys, entities and everything that scores them.
///
/// The model owns the [`KeyRegistry`], the [`AttributeStore`] and the
/// [`RestraintRegistry`]. Other components hold only handles into it.
pub struct Model {
    keys: KeyRegistry,
    store: AttributeStore,
    restraints: RestraintRegistry,
    check_inputs: bool,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    /// Creates an empty model. Input checking is on in debug builds and off otherwise.
    pub fn new() -> Self {
        Self {
            keys: KeyRegistry::new(),
            store: AttributeStore::new(),
            restraints: RestraintRegistry::new(),
            check_inputs: cfg!(debug_assertions),
        }
    }

    pub fn keys(&self) -> &KeyRegistry {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyRegistry {
        &mut self.keys
    }

    pub fn store(&self) -> &AttributeStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut AttributeStore {
        &mut self.store
    }

    pub fn restraints(&self) -> &RestraintRegistry {
        &self.restraints
    }

    pub fn restraints_mut(&mut self) -> &mut RestraintRegistry {
        &mut self.restraints
    }

    /// Borrows the store mutably alongside the registry.
    pub fn split_mut(&mut self) -> (&mut AttributeStore, &RestraintRegistry) {
        (&mut self.store, &self.restraints)
    }

    pub fn check_inputs(&self) -> bool {
        self.check_inputs
    }

    /// Enables or disables verification that restraints only read their declared inputs.
    pub fn set_check_inputs(&mut self, enabled: bool) {
        self.check_inputs = enabled;
    }

    pub fn structure_version(&self) -> StructureVersion {
        StructureVersion {
            shape: self.store.shape_version(),
            registry: self.restraints.version(),
        }
    }

    /// Adds an entity kept at the centroid of `members` by a new score state.
    pub fn add_centroid(
        &mut self,
        name: &str,
        members: Vec<EntityId>,
    ) -> Result<(EntityId, ScoreStateId), EngineError> {
        let output = self.store.add_entity(name);
        self.store.set_coordinates(output, Point3::origin())?;
        let state = Centroid::new(name, members, output);
        state.update(&mut self.store)?;
        self.store.decorate(output, Decoration::Xyz)?;
        self.store.decorate(output, Decoration::Centroid)?;
        let state_id = self.restraints.add_score_state(state);
        Ok((output, state_id))
    }

    /// Brings every score-state output up to date with its inputs.
    pub fn update_score_states(&mut self) -> Result<Vec<ScoreStateId>, EngineError> {
        let order = score_state_order(&self.restraints)?;
        update_states(&mut self.store, &self.restraints, &order, self.check_inputs)?;
        Ok(order)
    }

    /// Evaluates the total score from scratch.
    ///
    /// Score states are updated first. With `derivatives`, every derivative slot is reset,
    /// the gradient of the total is accumulated into the store, and score states push
    /// derivatives back to their inputs in reverse order.
    #[instrument(level = "debug", skip_all, name = "full_evaluation")]
    pub fn evaluate(&mut self, derivatives: bool) -> Result<f64, EngineError> {
        let order = self.update_score_states()?;
        if derivatives {
            self.store.zero_derivatives();
        }

        let leaves = self.restraints.flatten();
        let mut buffer = derivatives.then(DerivativeBuffer::new);
        let mut total = evaluate_leaves(&mut self.store, &leaves, buffer.as_mut(), self.check_inputs)?;

        for (_, close_pairs) in self.restraints.close_pairs() {
            let value = match buffer.as_mut() {
                Some(buffer) => {
                    let mut acc = DerivativeAccumulator::new(buffer);
                    close_pairs.evaluate_all(&self.store, Some(&mut acc))?
                }
                None => close_pairs.evaluate_all(&self.store, None)?,
            };
            check_finite(&close_pairs.name, value)?;
            total += value;
        }

        if let Some(buffer) = buffer {
            buffer.apply_to(&mut self.store)?;
            for &id in order.iter().rev() {
                if let Some(state) = self.restraints.score_state(id) {
                    state.propagate_derivatives(&mut self.store)?;
                }
            }
        }
        Ok(total)
    }
}

pub(crate) fn check_finite(name: &str, value: f64) -> Result<f64, ScoringError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ScoringError::NonFinite {
            source_name: name.to_string(),
            value,
        })
    }
}

fn undeclared_to_input_error(err: ScoringError, name: &str) -> ScoringError {
    match err {
        ScoringError::Store {
            source: StoreError::UndeclaredRead(entity),
        } => {
            error!(
                restraint = name,
                entity = ?entity,
                "Contract violation: read of an undeclared input."
            );
            ScoringError::UndeclaredInput {
                restraint: name.to_string(),
                entity,
            }
        }
        other => other,
    }
}

/// Evaluates one restraint and returns its weighted score.
///
/// With `check_inputs`, reads outside the declared inputs fail with
/// [`ScoringError::UndeclaredInput`]. Restraints declaring no inputs are not checked.
pub(crate) fn evaluate_restraint(
    store: &mut AttributeStore,
    restraint: &dyn Restraint,
    weight: f64,
    derivatives: Option<&mut DerivativeBuffer>,
    check_inputs: bool,
) -> Result<f64, ScoringError> {
    let guarded = if check_inputs {
        let inputs = restraint.inputs();
        let guard = !inputs.is_empty();
        if guard {
            store.guard_reads(inputs);
        }
        guard
    } else {
        false
    };

    let result = match derivatives {
        Some(buffer) => {
            let mut acc = DerivativeAccumulator::with_weight(buffer, weight);
            restraint.evaluate(store, Some(&mut acc))
        }
        None => restraint.evaluate(store, None),
    };
    if guarded {
        store.clear_read_guard();
    }

    let value = result.map_err(|e| undeclared_to_input_error(e, restraint.name()))?;
    check_finite(restraint.name(), weight * value)
}

/// Runs `update` on the given score states, in order.
pub(crate) fn update_states(
    store: &mut AttributeStore,
    registry: &RestraintRegistry,
    order: &[ScoreStateId],
    check_inputs: bool,
) -> Result<(), ScoringError> {
    for &id in order {
        if let Some(state) = registry.score_state(id) {
            update_state(store, state.as_ref(), check_inputs)?;
        }
    }
    Ok(())
}

pub(crate) fn update_state(
    store: &mut AttributeStore,
    state: &dyn ScoreState,
    check_inputs: bool,
) -> Result<(), ScoringError> {
    if check_inputs {
        store.guard_reads(state.inputs().into_iter().chain(state.outputs()));
    }
    let result = state.update(store);
    if check_inputs {
        store.clear_read_guard();
    }
    result.map_err(|e| undeclared_to_input_error(e, state.name()))
}

fn evaluate_leaves(
    store: &mut AttributeStore,
    leaves: &[FlatLeaf],
    buffer: Option<&mut DerivativeBuffer>,
    check_inputs: bool,
) -> Result<f64, ScoringError> {
    #[cfg(feature = "parallel")]
    if !check_inputs {
        let shared: &AttributeStore = store;
        let with_derivatives = buffer.is_some();
        let results = leaves
            .par_iter()
            .map(|leaf| {
                let mut local = DerivativeBuffer::new();
                let value = if with_derivatives {
                    let mut acc = DerivativeAccumulator::with_weight(&mut local, leaf.weight);
                    leaf.restraint.evaluate(shared, Some(&mut acc))?
                } else {
                    leaf.restraint.evaluate(shared, None)?
                };
                Ok::<_, ScoringError>((leaf.weight * value, local))
            })
            .collect::<Result<Vec<_>, ScoringError>>()?;

        let mut buffer = buffer;
        let mut total = 0.0;
        for ((value, local), leaf) in results.into_iter().zip(leaves) {
            total += check_finite(leaf.restraint.name(), value)?;
            if let Some(buffer) = buffer.as_deref_mut() {
                buffer.merge(local);
            }
        }
        return Ok(total);
    }

    let mut buffer = buffer;
    let mut total = 0.0;
    for leaf in leaves {
        total += evaluate_restraint(
            store,
            leaf.restraint.as_ref(),
            leaf.weight,
            buffer.as_deref_mut(),
            check_inputs,
        )?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::keys::FloatKey;
    use crate::core::scoring::derivatives::DerivativeAccumulator;
    use crate::core::scoring::pair_scores::{HarmonicDistance, LinearLowerBound};
    use crate::core::scoring::restraints::{ConstantRestraint, PairRestraint};
    use std::sync::Arc;

    fn f64_approx_equal(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    /// Declares only `a` but also reads `b`.
    struct Sneaky {
        a: EntityId,
        b: EntityId,
    }

    impl Restraint for Sneaky {
        fn name(&self) -> &str {
            "sneaky"
        }

        fn inputs(&self) -> Vec<EntityId> {
            vec![self.a]
        }

        fn evaluate(
            &self,
            store: &AttributeStore,
            _derivatives: Option<&mut DerivativeAccumulator<'_>>,
        ) -> Result<f64, ScoringError> {
            Ok(store.get_float(self.a, FloatKey::X)? + store.get_float(self.b, FloatKey::X)?)
        }
    }

    #[test]
    fn evaluate_sums_weighted_restraints() {
        let mut model = Model::new();
        let a = model.store_mut().add_point("a", Point3::origin(), None);
        let b = model.store_mut().add_point("b", Point3::new(4.0, 0.0, 0.0), None);
        let score = Arc::new(LinearLowerBound::new(5.0));
        model
            .restraints_mut()
            .add_restraint(PairRestraint::new("ab", score, a, b), 2.0)
            .unwrap();
        model
            .restraints_mut()
            .add_restraint(ConstantRestraint::new("offset", 0.5), 1.0)
            .unwrap();

        assert!(f64_approx_equal(model.evaluate(false).unwrap(), 2.5));
    }

    #[test]
    fn undeclared_reads_are_reported_when_checking_inputs() {
        let mut model = Model::new();
        let a = model.store_mut().add_point("a", Point3::origin(), None);
        let b = model.store_mut().add_point("b", Point3::new(1.0, 0.0, 0.0), None);
        model
            .restraints_mut()
            .add_restraint(Sneaky { a, b }, 1.0)
            .unwrap();

        model.set_check_inputs(true);
        let err = model.evaluate(false).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Scoring {
                source: ScoringError::UndeclaredInput { entity, .. }
            } if entity == b
        ));

        model.set_check_inputs(false);
        assert!(f64_approx_equal(model.evaluate(false).unwrap(), 1.0));
    }

    #[test]
    fn derivatives_are_accumulated_into_the_store() {
        let mut model = Model::new();
        let a = model.store_mut().add_point("a", Point3::origin(), None);
        let b = model.store_mut().add_point("b", Point3::new(3.0, 0.0, 0.0), None);
        model
            .restraints_mut()
            .add_restraint(
                PairRestraint::new("ab", Arc::new(HarmonicDistance::new(1.0, 1.0)), a, b),
                2.0,
            )
            .unwrap();

        let score = model.evaluate(true).unwrap();
        assert!(f64_approx_equal(score, 4.0));
        assert!(f64_approx_equal(model.store().derivative(a, FloatKey::X).unwrap(), -4.0));
        assert!(f64_approx_equal(model.store().derivative(b, FloatKey::X).unwrap(), 4.0));

        // A second pass must not double-count.
        model.evaluate(true).unwrap();
        assert!(f64_approx_equal(model.store().derivative(b, FloatKey::X).unwrap(), 4.0));
    }

    #[test]
    fn centroid_outputs_are_updated_before_restraints_and_propagate_derivatives() {
        let mut model = Model::new();
        let a = model.store_mut().add_point("a", Point3::new(0.0, 0.0, 0.0), None);
        let b = model.store_mut().add_point("b", Point3::new(2.0, 0.0, 0.0), None);
        let anchor = model.store_mut().add_point("anchor", Point3::new(5.0, 0.0, 0.0), None);
        let (center, _) = model.add_centroid("center", vec![a, b]).unwrap();
        assert!(model.store().has_decoration(center, Decoration::Centroid));
        model
            .restraints_mut()
            .add_restraint(
                PairRestraint::new("pull", Arc::new(HarmonicDistance::new(0.0, 1.0)), center, anchor),
                1.0,
            )
            .unwrap();

        model.store_mut().set_coordinates(b, Point3::new(4.0, 0.0, 0.0)).unwrap();
        let score = model.evaluate(true).unwrap();

        // Centroid is at x = 2, distance 3 to the anchor.
        assert!(f64_approx_equal(score, 4.5));
        assert!(f64_approx_equal(model.store().derivative(a, FloatKey::X).unwrap(), -1.5));
        assert!(f64_approx_equal(model.store().derivative(b, FloatKey::X).unwrap(), -1.5));
    }

    #[test]
    fn structure_version_tracks_store_and_registry() {
        let mut model = Model::new();
        let v0 = model.structure_version();
        let a = model.store_mut().add_point("a", Point3::origin(), None);
        let v1 = model.structure_version();
        assert_ne!(v0, v1);

        model.store_mut().set_coordinates(a, Point3::new(1.0, 1.0, 1.0)).unwrap();
        assert_eq!(model.structure_version(), v1);

        model
            .restraints_mut()
            .add_restraint(ConstantRestraint::new("c", 1.0), 1.0)
            .unwrap();
        assert_ne!(model.structure_version(), v1);
    }

    #[test]
    fn non_finite_scores_are_rejected() {
        let mut model = Model::new();
        model
            .restraints_mut()
            .add_restraint(ConstantRestraint::new("bad", f64::INFINITY), 1.0)
            .unwrap();
        assert!(matches!(
            model.evaluate(false),
            Err(EngineError::Scoring {
                source: ScoringError::NonFinite { .. }
            })
        ));
    }
}
