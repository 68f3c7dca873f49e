use super::restraint::ScoringError;
use crate::core::models::ids::EntityId;
use crate::core::models::keys::FloatKey;
use crate::core::models::store::AttributeStore;
use crate::core::utils::geometry;

/// A derived-state node: recomputes attributes of its output entities from its inputs.
///
/// Score states run before any restraint is evaluated, in dependency order, so restraints
/// that read an output entity always see values consistent with the inputs. After a
/// derivative pass they may push the derivatives of their outputs back onto their inputs.
pub trait ScoreState: Send + Sync {
    fn name(&self) -> &str;

    fn inputs(&self) -> Vec<EntityId>;

    fn outputs(&self) -> Vec<EntityId>;

    /// Float attributes of the output entities that [`ScoreState::update`] overwrites.
    fn output_keys(&self) -> Vec<FloatKey>;

    fn update(&self, store: &mut AttributeStore) -> Result<(), ScoringError>;

    fn propagate_derivatives(&self, _store: &mut AttributeStore) -> Result<(), ScoringError> {
        Ok(())
    }
}

/// Keeps an entity at the mean position of a set of member entities.
#[derive(Debug, Clone)]
pub struct Centroid {
    name: String,
    members: Vec<EntityId>,
    output: EntityId,
}

impl Centroid {
    pub fn new(name: impl Into<String>, members: Vec<EntityId>, output: EntityId) -> Self {
        Self {
            name: name.into(),
            members,
            output,
        }
    }

    pub fn output(&self) -> EntityId {
        self.output
    }

    pub fn members(&self) -> &[EntityId] {
        &self.members
    }
}

impl ScoreState for Centroid {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<EntityId> {
        self.members.clone()
    }

    fn outputs(&self) -> Vec<EntityId> {
        vec![self.output]
    }

    fn output_keys(&self) -> Vec<FloatKey> {
        FloatKey::XYZ.to_vec()
    }

    fn update(&self, store: &mut AttributeStore) -> Result<(), ScoringError> {
        let positions = self
            .members
            .iter()
            .map(|&id| store.coordinates(id))
            .collect::<Result<Vec<_>, _>>()?;
        let center = geometry::centroid(&positions).ok_or_else(|| ScoringError::ScoreState {
            name: self.name.clone(),
            reason: "centroid has no members".to_string(),
        })?;
        store.set_coordinates(self.output, center)?;
        Ok(())
    }

    /// Spreads the output's coordinate derivatives evenly over the members.
    fn propagate_derivatives(&self, store: &mut AttributeStore) -> Result<(), ScoringError> {
        if self.members.is_empty() {
            return Ok(());
        }
        let share = 1.0 / self.members.len() as f64;
        for key in FloatKey::XYZ {
            let d = store.derivative(self.output, key)? * share;
            if d == 0.0 {
                continue;
            }
            for &member in &self.members {
                store.add_to_derivative(member, key, d)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    #[test]
    fn centroid_update_moves_output_to_member_mean() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::new(0.0, 0.0, 0.0), None);
        let b = store.add_point("b", Point3::new(4.0, 2.0, 0.0), None);
        let c = store.add_point("c", Point3::origin(), None);
        let state = Centroid::new("center", vec![a, b], c);

        state.update(&mut store).unwrap();
        assert_eq!(store.coordinates(c).unwrap(), Point3::new(2.0, 1.0, 0.0));
    }

    #[test]
    fn centroid_without_members_fails() {
        let mut store = AttributeStore::new();
        let c = store.add_point("c", Point3::origin(), None);
        let state = Centroid::new("empty", vec![], c);
        assert!(matches!(
            state.update(&mut store),
            Err(ScoringError::ScoreState { .. })
        ));
    }

    #[test]
    fn centroid_derivatives_are_shared_evenly() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::origin(), None);
        let b = store.add_point("b", Point3::new(2.0, 0.0, 0.0), None);
        let c = store.add_point("c", Point3::origin(), None);
        let state = Centroid::new("center", vec![a, b], c);

        store.add_to_derivative(c, FloatKey::X, 3.0).unwrap();
        state.propagate_derivatives(&mut store).unwrap();

        assert_eq!(store.derivative(a, FloatKey::X).unwrap(), 1.5);
        assert_eq!(store.derivative(b, FloatKey::X).unwrap(), 1.5);
        assert_eq!(store.derivative(a, FloatKey::Y).unwrap(), 0.0);
    }
}
