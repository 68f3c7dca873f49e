use crate::core::models::ids::EntityId;
use crate::core::models::store::{AttributeStore, StoreError};
use crate::core::utils::geometry::surface_distance;
use kiddo::{ImmutableKdTree, SquaredEuclidean};
use nalgebra::Point3;
use std::collections::HashMap;
use tracing::debug;

/// Whether the reference positions still match the current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// No member has moved since the last rebuild.
    Fresh,
    /// Some member has moved, but by no more than half the slack.
    Stale,
}

/// Undo record for one [`ProximityIndex::notify_moved`] call.
#[derive(Debug, Clone)]
pub struct IndexUpdate {
    kind: UpdateKind,
}

#[derive(Debug, Clone)]
enum UpdateKind {
    Noop,
    Moved {
        slot: usize,
        previous: SlotState,
        max_displacement: f64,
        max_radius: f64,
    },
    Rebuilt {
        slot: usize,
        previous: SlotState,
        reference: Vec<Point3<f64>>,
        displacement: Vec<f64>,
        max_displacement: f64,
        max_radius: f64,
    },
}

#[derive(Debug, Clone, Copy)]
struct SlotState {
    position: Point3<f64>,
    radius: f64,
    displacement: f64,
}

impl IndexUpdate {
    /// `true` if the update forced a rebuild of the tree.
    pub fn rebuilt(&self) -> bool {
        matches!(self.kind, UpdateKind::Rebuilt { .. })
    }
}

/// Dynamic spatial index over a fixed set of entities.
///
/// A k-d tree is built over *reference* positions. Moves only update the *current*
/// position and the member's displacement from its reference; the tree is rebuilt once
/// the largest displacement exceeds half the slack. Queries widen their search radius by
/// that displacement and both radii, then filter candidates by exact current surface
/// distance, so answers are exact whether the index is fresh or stale.
///
/// Radii are tracked per member and refreshed on every [`ProximityIndex::notify_moved`].
#[derive(Debug, Clone)]
pub struct ProximityIndex {
    members: Vec<EntityId>,
    slots: HashMap<EntityId, usize>,
    radii: Vec<f64>,
    max_radius: f64,
    cutoff: f64,
    slack: f64,
    reference: Vec<Point3<f64>>,
    current: Vec<Point3<f64>>,
    displacement: Vec<f64>,
    max_displacement: f64,
    tree: Option<ImmutableKdTree<f64, 3>>,
    rebuilds: usize,
}

// The immutable tree tolerates any number of members sharing a coordinate on one axis,
// which the bucketed mutable tree does not.
fn build_tree(points: &[Point3<f64>]) -> Option<ImmutableKdTree<f64, 3>> {
    if points.is_empty() {
        return None;
    }
    let coords: Vec<[f64; 3]> = points.iter().map(|p| [p.x, p.y, p.z]).collect();
    Some(ImmutableKdTree::new_from_slice(&coords))
}

impl ProximityIndex {
    /// Builds an index over `members` at their current positions.
    ///
    /// # Arguments
    ///
    /// * `cutoff` - The interaction cutoff the index serves.
    /// * `slack` - Extra margin tolerated before a rebuild; moves of up to `slack / 2`
    ///   per member are absorbed without touching the tree.
    pub fn new(
        store: &AttributeStore,
        members: &[EntityId],
        cutoff: f64,
        slack: f64,
    ) -> Result<Self, StoreError> {
        let mut unique = Vec::with_capacity(members.len());
        let mut slots = HashMap::with_capacity(members.len());
        for &id in members {
            if !slots.contains_key(&id) {
                slots.insert(id, unique.len());
                unique.push(id);
            }
        }

        let positions = unique
            .iter()
            .map(|&id| store.coordinates(id))
            .collect::<Result<Vec<_>, _>>()?;
        let radii = unique
            .iter()
            .map(|&id| store.radius(id))
            .collect::<Result<Vec<_>, _>>()?;
        let max_radius = radii.iter().copied().fold(0.0, f64::max);

        Ok(Self {
            tree: build_tree(&positions),
            displacement: vec![0.0; unique.len()],
            reference: positions.clone(),
            current: positions,
            members: unique,
            slots,
            radii,
            max_radius,
            cutoff,
            slack: slack.max(0.0),
            max_displacement: 0.0,
            rebuilds: 0,
        })
    }

    pub fn members(&self) -> &[EntityId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[inline]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.slots.contains_key(&entity)
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn slack(&self) -> f64 {
        self.slack
    }

    /// Upper bound on how far any member has moved since the last rebuild.
    pub fn max_displacement(&self) -> f64 {
        self.max_displacement
    }

    pub fn status(&self) -> IndexStatus {
        if self.max_displacement > 0.0 {
            IndexStatus::Stale
        } else {
            IndexStatus::Fresh
        }
    }

    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    pub fn position(&self, entity: EntityId) -> Option<Point3<f64>> {
        self.slots.get(&entity).map(|&slot| self.current[slot])
    }

    pub fn radius(&self, entity: EntityId) -> Option<f64> {
        self.slots.get(&entity).map(|&slot| self.radii[slot])
    }

    /// Records a member's new position and radius, rebuilding the tree if the
    /// displacement bound exceeds half the slack. Non-members are ignored.
    ///
    /// # Return
    ///
    /// An [`IndexUpdate`] that [`ProximityIndex::revert`] can undo.
    pub fn notify_moved(
        &mut self,
        entity: EntityId,
        position: Point3<f64>,
        radius: f64,
    ) -> IndexUpdate {
        let Some(&slot) = self.slots.get(&entity) else {
            return IndexUpdate {
                kind: UpdateKind::Noop,
            };
        };
        let previous = SlotState {
            position: self.current[slot],
            radius: self.radii[slot],
            displacement: self.displacement[slot],
        };
        let max_displacement = self.max_displacement;
        let max_radius = self.max_radius;

        self.radii[slot] = radius;
        if radius > self.max_radius {
            self.max_radius = radius;
        }
        self.current[slot] = position;
        let moved = nalgebra::distance(&self.reference[slot], &position);
        self.displacement[slot] = moved;
        if moved > self.max_displacement {
            self.max_displacement = moved;
        }

        if self.max_displacement > 0.5 * self.slack {
            let reference = std::mem::replace(&mut self.reference, self.current.clone());
            let displacement =
                std::mem::replace(&mut self.displacement, vec![0.0; self.members.len()]);
            self.max_displacement = 0.0;
            self.tree = build_tree(&self.reference);
            self.rebuilds += 1;
            debug!(
                members = self.members.len(),
                rebuilds = self.rebuilds,
                "Proximity index rebuilt."
            );
            return IndexUpdate {
                kind: UpdateKind::Rebuilt {
                    slot,
                    previous,
                    reference,
                    displacement,
                    max_displacement,
                    max_radius,
                },
            };
        }

        IndexUpdate {
            kind: UpdateKind::Moved {
                slot,
                previous,
                max_displacement,
                max_radius,
            },
        }
    }

    /// Undoes a [`ProximityIndex::notify_moved`]. Updates must be reverted in reverse
    /// order of application.
    pub fn revert(&mut self, update: IndexUpdate) {
        match update.kind {
            UpdateKind::Noop => {}
            UpdateKind::Moved {
                slot,
                previous,
                max_displacement,
                max_radius,
            } => {
                self.current[slot] = previous.position;
                self.radii[slot] = previous.radius;
                self.displacement[slot] = previous.displacement;
                self.max_displacement = max_displacement;
                self.max_radius = max_radius;
            }
            UpdateKind::Rebuilt {
                slot,
                previous,
                reference,
                displacement,
                max_displacement,
                max_radius,
            } => {
                self.current[slot] = previous.position;
                self.radii[slot] = previous.radius;
                self.max_radius = max_radius;
                self.reference = reference;
                self.displacement = displacement;
                self.displacement[slot] = previous.displacement;
                self.max_displacement = max_displacement;
                self.tree = build_tree(&self.reference);
                self.rebuilds -= 1;
            }
        }
    }

    /// Members whose surface distance to `entity` is strictly below `distance`.
    ///
    /// Returns an empty list for non-members. Results are in member order.
    pub fn neighbors_within(&self, entity: EntityId, distance: f64) -> Vec<EntityId> {
        let Some(&slot) = self.slots.get(&entity) else {
            return Vec::new();
        };
        let center = self.current[slot];
        let radius = self.radii[slot];
        let search = distance + radius + self.max_radius + self.max_displacement;
        if search < 0.0 {
            return Vec::new();
        }

        let Some(tree) = &self.tree else {
            return Vec::new();
        };
        let mut found: Vec<usize> = tree
            .within_unsorted::<SquaredEuclidean>(&[center.x, center.y, center.z], search * search)
            .into_iter()
            .map(|neighbour| neighbour.item as usize)
            .filter(|&other| {
                other != slot
                    && surface_distance(&center, radius, &self.current[other], self.radii[other])
                        < distance
            })
            .collect();
        found.sort_unstable();
        found.into_iter().map(|other| self.members[other]).collect()
    }

    /// Every unordered member pair with surface distance strictly below `distance`,
    /// canonically ordered and sorted.
    pub fn get_pairs_within(&self, distance: f64) -> Vec<(EntityId, EntityId)> {
        let mut pairs: Vec<(EntityId, EntityId)> = Vec::new();
        for &entity in &self.members {
            for other in self.neighbors_within(entity, distance) {
                if entity < other {
                    pairs.push((entity, other));
                }
            }
        }
        pairs.sort_unstable();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use proptest::prelude::*;

    fn brute_force_pairs(
        store: &AttributeStore,
        members: &[EntityId],
        distance: f64,
    ) -> Vec<(EntityId, EntityId)> {
        let mut pairs: Vec<_> = members
            .iter()
            .copied()
            .tuple_combinations()
            .filter(|&(a, b)| {
                let pa = store.coordinates(a).unwrap();
                let pb = store.coordinates(b).unwrap();
                surface_distance(&pa, store.radius(a).unwrap(), &pb, store.radius(b).unwrap())
                    < distance
            })
            .map(|(a, b)| if a < b { (a, b) } else { (b, a) })
            .collect();
        pairs.sort_unstable();
        pairs
    }

    fn scattered(store: &mut AttributeStore, n: usize) -> Vec<EntityId> {
        (0..n)
            .map(|i| {
                let t = i as f64;
                store.add_point(
                    format!("p{}", i),
                    Point3::new(
                        (t * 1.37).sin() * 6.0 + t * 0.11,
                        (t * 2.11).cos() * 6.0 - t * 0.07,
                        (t * 0.73).sin() * 4.0 + t * 0.05,
                    ),
                    Some(0.2 + 0.05 * (i % 3) as f64),
                )
            })
            .collect()
    }

    #[test]
    fn fresh_index_matches_brute_force() {
        let mut store = AttributeStore::new();
        let members = scattered(&mut store, 25);
        let index = ProximityIndex::new(&store, &members, 3.0, 1.0).unwrap();

        assert_eq!(index.status(), IndexStatus::Fresh);
        assert_eq!(index.get_pairs_within(3.0), brute_force_pairs(&store, &members, 3.0));
    }

    #[test]
    fn cutoff_is_strict() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::origin(), None);
        let b = store.add_point("b", Point3::new(2.0, 0.0, 0.0), None);
        let index = ProximityIndex::new(&store, &[a, b], 2.0, 0.5).unwrap();

        assert!(index.neighbors_within(a, 2.0).is_empty());
        assert_eq!(index.neighbors_within(a, 2.0 + 1e-9), vec![b]);
    }

    #[test]
    fn small_moves_mark_the_index_stale_without_rebuilding() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::origin(), None);
        let b = store.add_point("b", Point3::new(5.0, 0.0, 0.0), None);
        let mut index = ProximityIndex::new(&store, &[a, b], 3.0, 2.0).unwrap();

        let update = index.notify_moved(b, Point3::new(4.5, 0.0, 0.0), 0.0);
        assert!(!update.rebuilt());
        assert_eq!(index.status(), IndexStatus::Stale);
        assert_eq!(index.rebuild_count(), 0);
        assert!((index.max_displacement() - 0.5).abs() < 1e-12);

        // Still within half the slack of its reference; the widened query finds it.
        let update = index.notify_moved(b, Point3::new(4.1, 0.0, 0.0), 0.0);
        assert!(!update.rebuilt());
        assert_eq!(index.rebuild_count(), 0);
        assert_eq!(index.neighbors_within(a, 4.2), vec![b]);
        assert!(index.neighbors_within(a, 4.0).is_empty());
    }

    #[test]
    fn large_moves_trigger_a_rebuild_that_reverts_exactly() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::origin(), None);
        let b = store.add_point("b", Point3::new(5.0, 0.0, 0.0), None);
        let mut index = ProximityIndex::new(&store, &[a, b], 3.0, 1.0).unwrap();

        let first = index.notify_moved(b, Point3::new(4.8, 0.0, 0.0), 0.0);
        let second = index.notify_moved(b, Point3::new(1.0, 0.0, 0.0), 0.0);
        assert!(second.rebuilt());
        assert_eq!(index.status(), IndexStatus::Fresh);
        assert_eq!(index.rebuild_count(), 1);

        index.revert(second);
        index.revert(first);
        assert_eq!(index.rebuild_count(), 0);
        assert_eq!(index.status(), IndexStatus::Fresh);
        assert_eq!(index.position(b), Some(Point3::new(5.0, 0.0, 0.0)));
        assert!(index.neighbors_within(a, 3.0).is_empty());
    }

    #[test]
    fn non_members_are_ignored() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::origin(), None);
        let outsider = store.add_point("x", Point3::new(0.5, 0.0, 0.0), None);
        let mut index = ProximityIndex::new(&store, &[a, a], 3.0, 1.0).unwrap();

        assert_eq!(index.len(), 1);
        let update = index.notify_moved(outsider, Point3::new(0.1, 0.0, 0.0), 0.0);
        assert!(!update.rebuilt());
        assert_eq!(index.status(), IndexStatus::Fresh);
        assert!(index.neighbors_within(outsider, 3.0).is_empty());
    }

    #[test]
    fn empty_index_has_no_pairs() {
        let store = AttributeStore::new();
        let index = ProximityIndex::new(&store, &[], 3.0, 1.0).unwrap();
        assert!(index.is_empty());
        assert!(index.get_pairs_within(3.0).is_empty());
    }

    #[test]
    fn co_linear_members_beyond_one_bucket_are_indexed() {
        let mut store = AttributeStore::new();
        let members: Vec<EntityId> = (0..40)
            .map(|i| {
                let position = Point3::new(0.0, 3.8 * i as f64, 0.0);
                store.add_point(format!("bead{}", i), position, Some(0.5))
            })
            .collect();
        let mut index = ProximityIndex::new(&store, &members, 3.0, 1.0).unwrap();
        assert_eq!(index.get_pairs_within(3.0), brute_force_pairs(&store, &members, 3.0));
        assert_eq!(index.neighbors_within(members[10], 3.0), vec![members[9], members[11]]);

        // Compressing the chain forces rebuilds over the same degenerate axes.
        for (i, &id) in members.iter().enumerate() {
            let p = Point3::new(0.0, 1.9 * i as f64, 0.0);
            store.set_coordinates(id, p).unwrap();
            index.notify_moved(id, p, 0.5);
        }
        assert!(index.rebuild_count() > 0);
        assert_eq!(index.get_pairs_within(3.0), brute_force_pairs(&store, &members, 3.0));
    }

    #[test]
    fn radius_changes_are_tracked_and_reverted() {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::origin(), Some(0.0));
        let b = store.add_point("b", Point3::new(5.0, 0.0, 0.0), Some(0.0));
        let mut index = ProximityIndex::new(&store, &[a, b], 2.0, 1.0).unwrap();
        assert!(index.neighbors_within(a, 2.0).is_empty());

        let update = index.notify_moved(b, Point3::new(5.0, 0.0, 0.0), 6.0);
        assert_eq!(index.radius(b), Some(6.0));
        assert_eq!(index.neighbors_within(a, 2.0), vec![b]);
        assert_eq!(index.neighbors_within(b, 2.0), vec![a]);

        index.revert(update);
        assert_eq!(index.radius(b), Some(0.0));
        assert!(index.neighbors_within(a, 2.0).is_empty());
    }

    proptest! {
        #[test]
        fn pairs_match_brute_force_after_any_move_sequence(
            moves in prop::collection::vec((0usize..12, -3.0f64..3.0, -3.0f64..3.0, -3.0f64..3.0), 1..40),
            slack in 0.2f64..4.0,
        ) {
            let mut store = AttributeStore::new();
            let members = scattered(&mut store, 12);
            let mut index = ProximityIndex::new(&store, &members, 2.5, slack).unwrap();

            for (i, dx, dy, dz) in moves {
                let id = members[i];
                let p = store.coordinates(id).unwrap() + nalgebra::Vector3::new(dx, dy, dz);
                store.set_coordinates(id, p).unwrap();
                index.notify_moved(id, p, store.radius(id).unwrap());
                prop_assert_eq!(index.get_pairs_within(2.5), brute_force_pairs(&store, &members, 2.5));
            }
        }

        #[test]
        fn reverting_all_updates_restores_every_query(
            moves in prop::collection::vec((0usize..10, -2.0f64..2.0, -2.0f64..2.0, -2.0f64..2.0), 1..20),
        ) {
            let mut store = AttributeStore::new();
            let members = scattered(&mut store, 10);
            let mut index = ProximityIndex::new(&store, &members, 2.0, 1.0).unwrap();
            let before = index.get_pairs_within(2.0);
            let positions: Vec<_> = members.iter().map(|&m| index.position(m)).collect();

            let mut updates = Vec::new();
            for (i, dx, dy, dz) in moves {
                let id = members[i];
                let p = index.position(id).unwrap() + nalgebra::Vector3::new(dx, dy, dz);
                let radius = index.radius(id).unwrap();
                updates.push(index.notify_moved(id, p, radius));
            }
            while let Some(update) = updates.pop() {
                index.revert(update);
            }

            prop_assert_eq!(index.get_pairs_within(2.0), before);
            prop_assert_eq!(index.rebuild_count(), 0);
            prop_assert_eq!(index.max_displacement(), 0.0);
            let after: Vec<_> = members.iter().map(|&m| index.position(m)).collect();
            prop_assert_eq!(after, positions);
        }
    }
}
