use super::error::EngineError;
use crate::core::models::ids::EntityId;
use crate::core::models::store::AttributeStore;
use crate::core::utils::geometry::random_in_ball;
use nalgebra::Point3;
use rand::{Rng, RngCore};

/// Proposes perturbations of the attribute store.
///
/// A proposal happens in two steps so the moved set is known before anything is
/// written: [`Mover::select`] picks the entities and [`Mover::apply`] perturbs them. The
/// mover must remember enough to undo the proposal in [`Mover::reject`].
pub trait Mover: Send {
    fn name(&self) -> &str;

    /// Picks the entities the next proposal will change. Does not touch the store.
    ///
    /// `probability` is the chance that each entity the mover controls is perturbed.
    fn select(
        &mut self,
        rng: &mut dyn RngCore,
        probability: f64,
    ) -> Result<Vec<EntityId>, EngineError>;

    /// Writes the selected proposal into the store.
    fn apply(
        &mut self,
        store: &mut AttributeStore,
        rng: &mut dyn RngCore,
    ) -> Result<(), EngineError>;

    /// Selects and applies a proposal in one call, returning the moved entities.
    fn propose(
        &mut self,
        store: &mut AttributeStore,
        rng: &mut dyn RngCore,
        probability: f64,
    ) -> Result<Vec<EntityId>, EngineError> {
        let moved = self.select(rng, probability)?;
        self.apply(store, rng)?;
        Ok(moved)
    }

    /// Keeps the last proposal.
    fn accept(&mut self);

    /// Restores the attributes changed by the last proposal.
    fn reject(&mut self, store: &mut AttributeStore) -> Result<(), EngineError>;
}

/// Displaces entities uniformly inside a ball around their current position.
#[derive(Debug, Clone)]
pub struct BallMover {
    name: String,
    entities: Vec<EntityId>,
    radius: f64,
    selected: Vec<EntityId>,
    saved: Vec<(EntityId, Point3<f64>)>,
    pending: bool,
}

impl BallMover {
    pub fn new(name: impl Into<String>, entities: Vec<EntityId>, radius: f64) -> Self {
        Self {
            name: name.into(),
            entities,
            radius,
            selected: Vec::new(),
            saved: Vec::new(),
            pending: false,
        }
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    fn failure(&self, reason: impl Into<String>) -> EngineError {
        EngineError::Mover {
            mover: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl Mover for BallMover {
    fn name(&self) -> &str {
        &self.name
    }

    fn select(
        &mut self,
        rng: &mut dyn RngCore,
        probability: f64,
    ) -> Result<Vec<EntityId>, EngineError> {
        if self.pending {
            return Err(self.failure("previous proposal was neither accepted nor rejected"));
        }
        if !(0.0..=1.0).contains(&probability) {
            return Err(self.failure(format!("move probability {} is outside [0, 1]", probability)));
        }
        self.selected.clear();
        self.saved.clear();
        if self.entities.is_empty() {
            self.pending = true;
            return Ok(Vec::new());
        }

        let mut moved: Vec<EntityId> = self
            .entities
            .iter()
            .copied()
            .filter(|_| rng.gen_bool(probability))
            .collect();
        if moved.is_empty() {
            moved.push(self.entities[rng.gen_range(0..self.entities.len())]);
        }

        self.selected.clone_from(&moved);
        self.pending = true;
        Ok(moved)
    }

    fn apply(
        &mut self,
        store: &mut AttributeStore,
        rng: &mut dyn RngCore,
    ) -> Result<(), EngineError> {
        if !self.pending || !self.saved.is_empty() {
            return Err(self.failure("apply needs a fresh selection"));
        }
        for &entity in &self.selected {
            let old = store.coordinates(entity)?;
            let new = random_in_ball(&old, self.radius, rng);
            self.saved.push((entity, old));
            store.set_coordinates(entity, new)?;
        }
        Ok(())
    }

    fn accept(&mut self) {
        self.selected.clear();
        self.saved.clear();
        self.pending = false;
    }

    fn reject(&mut self, store: &mut AttributeStore) -> Result<(), EngineError> {
        for &(entity, old) in self.saved.iter().rev() {
            store.set_coordinates(entity, old)?;
        }
        self.selected.clear();
        self.saved.clear();
        self.pending = false;
        Ok(())
    }
}
