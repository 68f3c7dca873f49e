use super::entity::{Decoration, Entity};
use super::ids::EntityId;
use super::keys::{FloatKey, IntKey, StringKey};
use nalgebra::Point3;
use slotmap::SlotMap;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Entity with ID {0:?} not found in the attribute store")]
    EntityNotFound(EntityId),
    #[error("Entity {entity:?} has no float attribute {key}")]
    MissingFloat { entity: EntityId, key: FloatKey },
    #[error("Entity {entity:?} has no int attribute {key}")]
    MissingInt { entity: EntityId, key: IntKey },
    #[error("Entity {entity:?} has no string attribute {key}")]
    MissingString { entity: EntityId, key: StringKey },
    #[error("Read of entity {0:?} is outside the declared inputs of the current evaluation")]
    UndeclaredRead(EntityId),
    #[error("Cannot decorate entity {entity:?} as {decoration}: missing float attribute {key}")]
    IncompleteDecoration {
        entity: EntityId,
        decoration: Decoration,
        key: FloatKey,
    },
}

/// Saved values of a set of float attributes, restorable with
/// [`AttributeStore::restore_floats`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FloatSnapshot {
    entries: Vec<(EntityId, FloatKey, f64)>,
}

impl FloatSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|&(_, _, v)| v)
    }
}

/// The single source of truth for the current state of every entity.
///
/// The store owns all entities and their typed attributes. Other components refer to
/// entities only through [`EntityId`] handles and go through the typed accessors here.
///
/// The store also carries a *shape version*: a counter that changes whenever entities are
/// added or removed or change their decorations. Plain attribute writes never touch it, so
/// derived structures (dependency graphs, proximity indexes) can cheaply tell whether they
/// must be rebuilt.
#[derive(Debug, Clone, Default)]
pub struct AttributeStore {
    /// Primary storage for entities using a slot map for stable handles.
    entities: SlotMap<EntityId, Entity>,
    /// Bumped on every structural change.
    shape_version: u64,
    /// When set, reads of entities outside this set fail with `UndeclaredRead`.
    read_guard: Option<HashSet<EntityId>>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new entity with no attributes.
    ///
    /// # Arguments
    ///
    /// * `name` - A label used in logs and error messages; it need not be unique.
    ///
    /// # Return
    ///
    /// The handle of the new entity.
    pub fn add_entity(&mut self, name: impl Into<String>) -> EntityId {
        self.shape_version += 1;
        self.entities.insert(Entity::new(name))
    }

    /// Adds a point entity with optimizable coordinates.
    ///
    /// The entity is decorated as [`Decoration::XyzR`] when a radius is given and as
    /// [`Decoration::Xyz`] otherwise. The radius itself is not optimizable.
    pub fn add_point(
        &mut self,
        name: impl Into<String>,
        position: Point3<f64>,
        radius: Option<f64>,
    ) -> EntityId {
        let mut entity = Entity::new(name);
        for (key, value) in FloatKey::XYZ.iter().zip(position.coords.iter()) {
            entity.set_float(*key, *value);
            entity.set_optimizable(*key, true);
        }
        entity.insert_decoration(Decoration::Xyz);
        if let Some(radius) = radius {
            entity.set_float(FloatKey::RADIUS, radius);
            entity.insert_decoration(Decoration::XyzR);
        }
        self.shape_version += 1;
        self.entities.insert(entity)
    }

    /// Removes an entity and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EntityNotFound`] if the handle is stale.
    pub fn remove_entity(&mut self, id: EntityId) -> Result<Entity, StoreError> {
        let entity = self
            .entities
            .remove(id)
            .ok_or(StoreError::EntityNotFound(id))?;
        self.shape_version += 1;
        Ok(entity)
    }

    #[inline]
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn name(&self, id: EntityId) -> Result<&str, StoreError> {
        Ok(self.entity_ref(id)?.name.as_str())
    }

    #[inline]
    pub fn shape_version(&self) -> u64 {
        self.shape_version
    }

    fn entity_ref(&self, id: EntityId) -> Result<&Entity, StoreError> {
        self.entities.get(id).ok_or(StoreError::EntityNotFound(id))
    }

    fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity, StoreError> {
        self.entities
            .get_mut(id)
            .ok_or(StoreError::EntityNotFound(id))
    }

    #[inline]
    fn check_read(&self, id: EntityId) -> Result<(), StoreError> {
        match &self.read_guard {
            Some(allowed) if !allowed.contains(&id) => Err(StoreError::UndeclaredRead(id)),
            _ => Ok(()),
        }
    }

    /// Reads a float attribute.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::MissingFloat`] if the entity lacks the attribute, and with
    /// [`StoreError::UndeclaredRead`] if input checking is active and the entity is not a
    /// declared input of the evaluation in progress.
    pub fn get_float(&self, id: EntityId, key: FloatKey) -> Result<f64, StoreError> {
        self.check_read(id)?;
        self.entity_ref(id)?
            .float(key)
            .ok_or(StoreError::MissingFloat { entity: id, key })
    }

    pub fn set_float(&mut self, id: EntityId, key: FloatKey, value: f64) -> Result<(), StoreError> {
        self.entity_mut(id)?.set_float(key, value);
        Ok(())
    }

    pub fn has_float(&self, id: EntityId, key: FloatKey) -> bool {
        self.entities.get(id).is_some_and(|e| e.has_float(key))
    }

    /// Removes a float attribute. Any decoration that requires it is removed as well.
    pub fn remove_float(&mut self, id: EntityId, key: FloatKey) -> Result<Option<f64>, StoreError> {
        let entity = self.entity_mut(id)?;
        let old = entity.remove_float(key);
        let dropped: Vec<Decoration> = entity
            .decorations()
            .iter()
            .copied()
            .filter(|d| d.required_floats().contains(&key))
            .collect();
        for decoration in &dropped {
            entity.remove_decoration(*decoration);
        }
        if !dropped.is_empty() {
            self.shape_version += 1;
        }
        Ok(old)
    }

    pub fn is_optimizable(&self, id: EntityId, key: FloatKey) -> Result<bool, StoreError> {
        Ok(self.entity_ref(id)?.is_optimizable(key))
    }

    pub fn set_optimizable(
        &mut self,
        id: EntityId,
        key: FloatKey,
        optimizable: bool,
    ) -> Result<(), StoreError> {
        if self.entity_mut(id)?.set_optimizable(key, optimizable) {
            Ok(())
        } else {
            Err(StoreError::MissingFloat { entity: id, key })
        }
    }

    pub fn derivative(&self, id: EntityId, key: FloatKey) -> Result<f64, StoreError> {
        let entity = self.entity_ref(id)?;
        if !entity.has_float(key) {
            return Err(StoreError::MissingFloat { entity: id, key });
        }
        Ok(entity.derivative(key))
    }

    pub fn add_to_derivative(
        &mut self,
        id: EntityId,
        key: FloatKey,
        value: f64,
    ) -> Result<(), StoreError> {
        if self.entity_mut(id)?.add_to_derivative(key, value) {
            Ok(())
        } else {
            Err(StoreError::MissingFloat { entity: id, key })
        }
    }

    /// Resets every derivative slot of every entity to zero.
    pub fn zero_derivatives(&mut self) {
        for entity in self.entities.values_mut() {
            entity.zero_derivatives();
        }
    }

    pub fn get_int(&self, id: EntityId, key: IntKey) -> Result<i64, StoreError> {
        self.check_read(id)?;
        self.entity_ref(id)?
            .int(key)
            .ok_or(StoreError::MissingInt { entity: id, key })
    }

    pub fn set_int(&mut self, id: EntityId, key: IntKey, value: i64) -> Result<(), StoreError> {
        self.entity_mut(id)?.set_int(key, value);
        Ok(())
    }

    pub fn get_string(&self, id: EntityId, key: StringKey) -> Result<&str, StoreError> {
        self.check_read(id)?;
        self.entity_ref(id)?
            .string(key)
            .ok_or(StoreError::MissingString { entity: id, key })
    }

    pub fn set_string(
        &mut self,
        id: EntityId,
        key: StringKey,
        value: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.entity_mut(id)?.set_string(key, value);
        Ok(())
    }

    /// Reads the Cartesian coordinates of an entity.
    pub fn coordinates(&self, id: EntityId) -> Result<Point3<f64>, StoreError> {
        Ok(Point3::new(
            self.get_float(id, FloatKey::X)?,
            self.get_float(id, FloatKey::Y)?,
            self.get_float(id, FloatKey::Z)?,
        ))
    }

    pub fn set_coordinates(&mut self, id: EntityId, position: Point3<f64>) -> Result<(), StoreError> {
        let entity = self.entity_mut(id)?;
        entity.set_float(FloatKey::X, position.x);
        entity.set_float(FloatKey::Y, position.y);
        entity.set_float(FloatKey::Z, position.z);
        Ok(())
    }

    /// The radius of an entity, or `0.0` for entities without a radius attribute.
    pub fn radius(&self, id: EntityId) -> Result<f64, StoreError> {
        self.check_read(id)?;
        Ok(self.entity_ref(id)?.float(FloatKey::RADIUS).unwrap_or(0.0))
    }

    /// Attaches a decoration. Returns `true` if it was newly added.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::IncompleteDecoration`] if any float attribute the
    /// decoration requires is missing.
    pub fn decorate(&mut self, id: EntityId, decoration: Decoration) -> Result<bool, StoreError> {
        let entity = self.entity_mut(id)?;
        if let Some(&key) = decoration
            .required_floats()
            .iter()
            .find(|&&key| !entity.has_float(key))
        {
            return Err(StoreError::IncompleteDecoration {
                entity: id,
                decoration,
                key,
            });
        }
        let added = entity.insert_decoration(decoration);
        if added {
            self.shape_version += 1;
        }
        Ok(added)
    }

    pub fn undecorate(&mut self, id: EntityId, decoration: Decoration) -> Result<bool, StoreError> {
        let removed = self.entity_mut(id)?.remove_decoration(decoration);
        if removed {
            self.shape_version += 1;
        }
        Ok(removed)
    }

    pub fn has_decoration(&self, id: EntityId, decoration: Decoration) -> bool {
        self.entities
            .get(id)
            .is_some_and(|e| e.has_decoration(decoration))
    }

    /// All entities carrying a decoration, in store order.
    pub fn entities_with(&self, decoration: Decoration) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, e)| e.has_decoration(decoration))
            .map(|(id, _)| id)
            .collect()
    }

    /// Every optimizable float attribute in the store, in store and key order.
    pub fn optimizable_floats(&self) -> Vec<(EntityId, FloatKey)> {
        self.entities
            .iter()
            .flat_map(|(id, entity)| {
                entity
                    .float_keys()
                    .filter(|&key| entity.is_optimizable(key))
                    .map(move |key| (id, key))
            })
            .collect()
    }

    pub fn snapshot_floats(
        &self,
        attributes: &[(EntityId, FloatKey)],
    ) -> Result<FloatSnapshot, StoreError> {
        let entries = attributes
            .iter()
            .map(|&(id, key)| {
                let value = self
                    .entity_ref(id)?
                    .float(key)
                    .ok_or(StoreError::MissingFloat { entity: id, key })?;
                Ok((id, key, value))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(FloatSnapshot { entries })
    }

    pub fn restore_floats(&mut self, snapshot: &FloatSnapshot) -> Result<(), StoreError> {
        for &(id, key, value) in &snapshot.entries {
            self.set_float(id, key, value)?;
        }
        Ok(())
    }

    pub(crate) fn guard_reads(&mut self, allowed: impl IntoIterator<Item = EntityId>) {
        self.read_guard = Some(allowed.into_iter().collect());
    }

    pub(crate) fn clear_read_guard(&mut self) {
        self.read_guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_point_sets_coordinates_and_decorations() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::new(1.0, 2.0, 3.0), None);
        let b = store.add_point("b", Point3::new(0.0, 0.0, 0.0), Some(1.5));

        assert_eq!(store.coordinates(a).unwrap(), Point3::new(1.0, 2.0, 3.0));
        assert!(store.has_decoration(a, Decoration::Xyz));
        assert!(!store.has_decoration(a, Decoration::XyzR));
        assert!(store.has_decoration(b, Decoration::XyzR));
        assert_eq!(store.radius(a).unwrap(), 0.0);
        assert_eq!(store.radius(b).unwrap(), 1.5);
        assert!(store.is_optimizable(a, FloatKey::X).unwrap());
        assert!(!store.is_optimizable(b, FloatKey::RADIUS).unwrap());
    }

    #[test]
    fn missing_float_reports_entity_and_key() {
        let mut store = AttributeStore::new();
        let id = store.add_entity("bare");
        assert_eq!(
            store.get_float(id, FloatKey::X),
            Err(StoreError::MissingFloat {
                entity: id,
                key: FloatKey::X
            })
        );
    }

    #[test]
    fn removed_entity_is_reported_as_not_found() {
        let mut store = AttributeStore::new();
        let id = store.add_entity("gone");
        store.remove_entity(id).unwrap();
        assert_eq!(
            store.get_float(id, FloatKey::X),
            Err(StoreError::EntityNotFound(id))
        );
        assert!(store.remove_entity(id).is_err());
    }

    #[test]
    fn shape_version_changes_on_structure_but_not_on_attribute_writes() {
        let mut store = AttributeStore::new();
        let id = store.add_point("a", Point3::origin(), None);
        let version = store.shape_version();

        store.set_coordinates(id, Point3::new(5.0, 0.0, 0.0)).unwrap();
        store.set_float(id, FloatKey::RADIUS, 1.0).unwrap();
        assert_eq!(store.shape_version(), version);

        assert!(store.decorate(id, Decoration::XyzR).unwrap());
        assert_eq!(store.shape_version(), version + 1);

        assert!(!store.decorate(id, Decoration::XyzR).unwrap());
        assert_eq!(store.shape_version(), version + 1);
    }

    #[test]
    fn decorate_requires_all_float_attributes() {
        let mut store = AttributeStore::new();
        let id = store.add_point("a", Point3::origin(), None);
        let err = store.decorate(id, Decoration::XyzR).unwrap_err();
        assert!(matches!(
            err,
            StoreError::IncompleteDecoration {
                key: FloatKey::RADIUS,
                ..
            }
        ));
    }

    #[test]
    fn removing_a_required_float_drops_the_decoration() {
        let mut store = AttributeStore::new();
        let id = store.add_point("a", Point3::origin(), Some(2.0));
        store.remove_float(id, FloatKey::RADIUS).unwrap();
        assert!(!store.has_decoration(id, Decoration::XyzR));
        assert!(store.has_decoration(id, Decoration::Xyz));
    }

    #[test]
    fn read_guard_rejects_undeclared_entities() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::origin(), None);
        let b = store.add_point("b", Point3::new(1.0, 0.0, 0.0), None);

        store.guard_reads([a]);
        assert!(store.coordinates(a).is_ok());
        assert_eq!(store.coordinates(b), Err(StoreError::UndeclaredRead(b)));

        store.clear_read_guard();
        assert!(store.coordinates(b).is_ok());
    }

    #[test]
    fn snapshot_and_restore_round_trip_selected_floats() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::new(1.0, 1.0, 1.0), None);
        let attributes = store.optimizable_floats();
        assert_eq!(attributes.len(), 3);

        let snapshot = store.snapshot_floats(&attributes).unwrap();
        store.set_coordinates(a, Point3::new(9.0, 9.0, 9.0)).unwrap();
        store.restore_floats(&snapshot).unwrap();

        assert_eq!(store.coordinates(a).unwrap(), Point3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn derivatives_accumulate_and_reset() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::origin(), None);
        store.add_to_derivative(a, FloatKey::X, 1.0).unwrap();
        store.add_to_derivative(a, FloatKey::X, 2.0).unwrap();
        assert_eq!(store.derivative(a, FloatKey::X).unwrap(), 3.0);

        store.zero_derivatives();
        assert_eq!(store.derivative(a, FloatKey::X).unwrap(), 0.0);
        assert!(store.add_to_derivative(a, FloatKey::RADIUS, 1.0).is_err());
    }

    #[test]
    fn int_and_string_attributes_are_typed() {
        let mut store = AttributeStore::new();
        let a = store.add_entity("a");
        let mut keys = crate::core::models::keys::KeyRegistry::new();
        let index = keys.int_key("residue-index");
        let element = keys.string_key("element");

        store.set_int(a, index, 42).unwrap();
        store.set_string(a, element, "C").unwrap();
        assert_eq!(store.get_int(a, index).unwrap(), 42);
        assert_eq!(store.get_string(a, element).unwrap(), "C");

        let missing = keys.int_key("chain");
        assert!(matches!(
            store.get_int(a, missing),
            Err(StoreError::MissingInt { .. })
        ));
    }
}
