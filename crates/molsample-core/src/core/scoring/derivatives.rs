use crate::core::models::ids::EntityId;
use crate::core::models::keys::FloatKey;
use crate::core::models::store::{AttributeStore, StoreError};
use nalgebra::Vector3;
use std::collections::HashMap;

/// Derivative contributions collected during an evaluation pass.
///
/// Restraints evaluate against an immutable store, so their derivatives are buffered here
/// and written back with [`DerivativeBuffer::apply_to`] once the pass is over.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivativeBuffer {
    entries: HashMap<(EntityId, FloatKey), f64>,
}

impl DerivativeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, entity: EntityId, key: FloatKey, value: f64) {
        *self.entries.entry((entity, key)).or_insert(0.0) += value;
    }

    pub fn get(&self, entity: EntityId, key: FloatKey) -> f64 {
        self.entries.get(&(entity, key)).copied().unwrap_or(0.0)
    }

    pub fn merge(&mut self, other: DerivativeBuffer) {
        for ((entity, key), value) in other.entries {
            self.add(entity, key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds every buffered contribution to the derivative slots of the store.
    pub fn apply_to(&self, store: &mut AttributeStore) -> Result<(), StoreError> {
        for (&(entity, key), &value) in &self.entries {
            store.add_to_derivative(entity, key, value)?;
        }
        Ok(())
    }
}

/// Write handle into a [`DerivativeBuffer`] that scales contributions by a weight.
///
/// Restraints receive one of these during a derivative-accumulating evaluation; the weight
/// is the product of the restraint's weight and the weights of every enclosing set.
pub struct DerivativeAccumulator<'a> {
    weight: f64,
    buffer: &'a mut DerivativeBuffer,
}

impl<'a> DerivativeAccumulator<'a> {
    pub fn new(buffer: &'a mut DerivativeBuffer) -> Self {
        Self::with_weight(buffer, 1.0)
    }

    pub fn with_weight(buffer: &'a mut DerivativeBuffer, weight: f64) -> Self {
        Self { weight, buffer }
    }

    #[inline]
    pub fn weight(&self) -> f64 {
        self.weight
    }

    #[inline]
    pub fn add(&mut self, entity: EntityId, key: FloatKey, value: f64) {
        self.buffer.add(entity, key, self.weight * value);
    }

    /// Adds a Cartesian gradient to the `x`, `y` and `z` derivatives of an entity.
    pub fn add_vector(&mut self, entity: EntityId, gradient: &Vector3<f64>) {
        for (key, value) in FloatKey::XYZ.iter().zip(gradient.iter()) {
            self.add(entity, *key, *value);
        }
    }

    /// A nested accumulator whose weight is this one's multiplied by `factor`.
    pub fn scaled(&mut self, factor: f64) -> DerivativeAccumulator<'_> {
        DerivativeAccumulator {
            weight: self.weight * factor,
            buffer: &mut *self.buffer,
        }
    }
}
