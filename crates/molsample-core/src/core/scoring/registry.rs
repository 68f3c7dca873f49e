use super::derivatives::DerivativeAccumulator;
use super::pair_scores::PairScore;
use super::restraint::{Restraint, ScoringError};
use super::score_state::ScoreState;
use crate::core::models::ids::{ClosePairId, EntityId, RestraintId, ScoreStateId};
use crate::core::models::store::AttributeStore;
use crate::core::utils::geometry::surface_distance;
use itertools::Itertools;
use slotmap::SlotMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Restraint {0:?} not found in the registry")]
    RestraintNotFound(RestraintId),
    #[error("Score state {0:?} not found in the registry")]
    ScoreStateNotFound(ScoreStateId),
    #[error("Close-pair score {0:?} not found in the registry")]
    ClosePairNotFound(ClosePairId),
    #[error("Restraint {0:?} is not a restraint set")]
    NotASet(RestraintId),
    #[error("Adding {child:?} to set {set:?} would create a cycle")]
    Cycle { set: RestraintId, child: RestraintId },
    #[error("Invalid weight {0}: weights must be finite")]
    InvalidWeight(f64),
    #[error("Invalid cutoff {0}: cutoffs must be finite and non-negative")]
    InvalidCutoff(f64),
}

/// A node of the restraint hierarchy.
#[derive(Clone)]
pub enum RestraintNode {
    Leaf {
        restraint: Arc<dyn Restraint>,
        weight: f64,
    },
    Set {
        name: String,
        weight: f64,
        children: Vec<RestraintId>,
    },
}

impl RestraintNode {
    pub fn name(&self) -> &str {
        match self {
            RestraintNode::Leaf { restraint, .. } => restraint.name(),
            RestraintNode::Set { name, .. } => name,
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            RestraintNode::Leaf { weight, .. } | RestraintNode::Set { weight, .. } => *weight,
        }
    }

    fn children(&self) -> &[RestraintId] {
        match self {
            RestraintNode::Leaf { .. } => &[],
            RestraintNode::Set { children, .. } => children,
        }
    }
}

/// A leaf restraint reached through the hierarchy, with the product of all weights on its
/// path and the sets it was reached through (outermost first).
#[derive(Clone)]
pub struct FlatLeaf {
    pub id: RestraintId,
    pub restraint: Arc<dyn Restraint>,
    pub weight: f64,
    pub ancestors: Vec<RestraintId>,
}

/// A short-range pair term over a container of entities.
///
/// Its value is `weight` times the sum of the pair score over every unordered pair of
/// members whose surface distance is strictly below `cutoff`.
#[derive(Debug, Clone)]
pub struct ClosePairScore {
    pub name: String,
    members: Vec<EntityId>,
    pub score: Arc<dyn PairScore>,
    pub cutoff: f64,
    pub weight: f64,
}

impl ClosePairScore {
    pub fn new(
        name: impl Into<String>,
        members: Vec<EntityId>,
        score: Arc<dyn PairScore>,
        cutoff: f64,
    ) -> Self {
        Self {
            name: name.into(),
            members: members.into_iter().unique().collect(),
            score,
            cutoff,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn members(&self) -> &[EntityId] {
        &self.members
    }

    pub fn within_cutoff(
        &self,
        store: &AttributeStore,
        a: EntityId,
        b: EntityId,
    ) -> Result<bool, ScoringError> {
        let separation = surface_distance(
            &store.coordinates(a)?,
            store.radius(a)?,
            &store.coordinates(b)?,
            store.radius(b)?,
        );
        Ok(separation < self.cutoff)
    }

    /// The weighted contribution of one pair; zero when the pair is not within the cutoff.
    pub fn score_pair(
        &self,
        store: &AttributeStore,
        a: EntityId,
        b: EntityId,
        derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError> {
        if !self.within_cutoff(store, a, b)? {
            return Ok(0.0);
        }
        let value = match derivatives {
            Some(acc) => self
                .score
                .score(store, a, b, Some(&mut acc.scaled(self.weight)))?,
            None => self.score.score(store, a, b, None)?,
        };
        Ok(self.weight * value)
    }

    /// Brute-force evaluation over all member pairs.
    pub fn evaluate_all(
        &self,
        store: &AttributeStore,
        mut derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError> {
        let mut total = 0.0;
        for (&a, &b) in self.members.iter().tuple_combinations() {
            total += self.score_pair(store, a, b, derivatives.as_deref_mut())?;
        }
        Ok(total)
    }
}

/// Arena owning every scoring object of a model.
///
/// Restraints form a DAG of weighted sets; roots contribute directly to the total. Score
/// states and close-pair scores are kept in registration order, which is also the order in
/// which they are evaluated. Any structural change bumps [`RestraintRegistry::version`].
#[derive(Default)]
pub struct RestraintRegistry {
    nodes: SlotMap<RestraintId, RestraintNode>,
    roots: Vec<RestraintId>,
    states: SlotMap<ScoreStateId, Arc<dyn ScoreState>>,
    state_order: Vec<ScoreStateId>,
    close_pairs: SlotMap<ClosePairId, ClosePairScore>,
    close_pair_order: Vec<ClosePairId>,
    version: u64,
}

fn check_weight(weight: f64) -> Result<(), RegistryError> {
    if weight.is_finite() {
        Ok(())
    } else {
        Err(RegistryError::InvalidWeight(weight))
    }
}

impl RestraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Registers a top-level restraint.
    pub fn add_restraint(
        &mut self,
        restraint: impl Restraint + 'static,
        weight: f64,
    ) -> Result<RestraintId, RegistryError> {
        self.add_shared(Arc::new(restraint), weight)
    }

    pub fn add_shared(
        &mut self,
        restraint: Arc<dyn Restraint>,
        weight: f64,
    ) -> Result<RestraintId, RegistryError> {
        check_weight(weight)?;
        let id = self.nodes.insert(RestraintNode::Leaf { restraint, weight });
        self.roots.push(id);
        self.version += 1;
        Ok(id)
    }

    /// Registers an empty top-level restraint set.
    pub fn add_restraint_set(
        &mut self,
        name: impl Into<String>,
        weight: f64,
    ) -> Result<RestraintId, RegistryError> {
        check_weight(weight)?;
        let id = self.nodes.insert(RestraintNode::Set {
            name: name.into(),
            weight,
            children: Vec::new(),
        });
        self.roots.push(id);
        self.version += 1;
        Ok(id)
    }

    /// Registers a restraint directly as a child of `set`.
    pub fn add_child(
        &mut self,
        set: RestraintId,
        restraint: impl Restraint + 'static,
        weight: f64,
    ) -> Result<RestraintId, RegistryError> {
        check_weight(weight)?;
        self.set_children_mut(set)?;
        let id = self.nodes.insert(RestraintNode::Leaf {
            restraint: Arc::new(restraint),
            weight,
        });
        self.set_children_mut(set)?.push(id);
        self.version += 1;
        Ok(id)
    }

    /// Links an existing restraint or set under `set`.
    ///
    /// A linked node stops being a root, so it contributes through `set` only. Linking a
    /// node that is already a child of `set` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Cycle`] if `set` is reachable from `child`.
    pub fn add_to_set(&mut self, set: RestraintId, child: RestraintId) -> Result<(), RegistryError> {
        if !self.nodes.contains_key(child) {
            return Err(RegistryError::RestraintNotFound(child));
        }
        if self.set_children_mut(set)?.contains(&child) {
            return Ok(());
        }
        if self.reachable(child, set) {
            return Err(RegistryError::Cycle { set, child });
        }
        self.set_children_mut(set)?.push(child);
        self.roots.retain(|&r| r != child);
        self.version += 1;
        Ok(())
    }

    /// Removes a restraint or set. Descendants of a removed set that are no longer
    /// referenced anywhere are removed too.
    pub fn remove_restraint(&mut self, id: RestraintId) -> Result<(), RegistryError> {
        if !self.nodes.contains_key(id) {
            return Err(RegistryError::RestraintNotFound(id));
        }
        self.roots.retain(|&r| r != id);
        for node in self.nodes.values_mut() {
            if let RestraintNode::Set { children, .. } = node {
                children.retain(|&c| c != id);
            }
        }

        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let Some(node) = self.nodes.remove(current) else {
                continue;
            };
            for &child in node.children() {
                let referenced = self.roots.contains(&child)
                    || self.nodes.values().any(|n| n.children().contains(&child));
                if !referenced {
                    pending.push(child);
                }
            }
        }
        self.version += 1;
        Ok(())
    }

    pub fn set_weight(&mut self, id: RestraintId, new_weight: f64) -> Result<(), RegistryError> {
        check_weight(new_weight)?;
        match self.nodes.get_mut(id) {
            Some(RestraintNode::Leaf { weight, .. }) | Some(RestraintNode::Set { weight, .. }) => {
                *weight = new_weight;
            }
            None => return Err(RegistryError::RestraintNotFound(id)),
        }
        self.version += 1;
        Ok(())
    }

    pub fn node(&self, id: RestraintId) -> Option<&RestraintNode> {
        self.nodes.get(id)
    }

    pub fn roots(&self) -> &[RestraintId] {
        &self.roots
    }

    pub fn num_restraints(&self) -> usize {
        self.nodes.len()
    }

    fn set_children_mut(&mut self, set: RestraintId) -> Result<&mut Vec<RestraintId>, RegistryError> {
        match self.nodes.get_mut(set) {
            Some(RestraintNode::Set { children, .. }) => Ok(children),
            Some(RestraintNode::Leaf { .. }) => Err(RegistryError::NotASet(set)),
            None => Err(RegistryError::RestraintNotFound(set)),
        }
    }

    fn reachable(&self, from: RestraintId, target: RestraintId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                stack.extend(node.children().iter().copied());
            }
        }
        false
    }

    /// Walks the hierarchy from the roots and returns every leaf reached, pre-order, in
    /// registration order. A leaf shared by several sets appears once per path.
    pub fn flatten(&self) -> Vec<FlatLeaf> {
        let mut leaves = Vec::new();
        let mut stack: Vec<(RestraintId, f64, Vec<RestraintId>)> = self
            .roots
            .iter()
            .rev()
            .map(|&id| (id, 1.0, Vec::new()))
            .collect();

        while let Some((id, outer_weight, ancestors)) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            match node {
                RestraintNode::Leaf { restraint, weight } => leaves.push(FlatLeaf {
                    id,
                    restraint: Arc::clone(restraint),
                    weight: outer_weight * weight,
                    ancestors,
                }),
                RestraintNode::Set {
                    weight, children, ..
                } => {
                    let mut path = ancestors;
                    path.push(id);
                    for &child in children.iter().rev() {
                        stack.push((child, outer_weight * weight, path.clone()));
                    }
                }
            }
        }
        leaves
    }

    /// Union of the declared inputs of every leaf under `id`.
    pub fn inputs_of(&self, id: RestraintId) -> Result<Vec<EntityId>, RegistryError> {
        if !self.nodes.contains_key(id) {
            return Err(RegistryError::RestraintNotFound(id));
        }
        let mut inputs = Vec::new();
        let mut seen_inputs = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            match self.nodes.get(current) {
                Some(RestraintNode::Leaf { restraint, .. }) => {
                    for entity in restraint.inputs() {
                        if seen_inputs.insert(entity) {
                            inputs.push(entity);
                        }
                    }
                }
                Some(RestraintNode::Set { children, .. }) => {
                    stack.extend(children.iter().rev().copied());
                }
                None => {}
            }
        }
        Ok(inputs)
    }

    pub fn add_score_state(&mut self, state: impl ScoreState + 'static) -> ScoreStateId {
        let id = self.states.insert(Arc::new(state));
        self.state_order.push(id);
        self.version += 1;
        id
    }

    pub fn remove_score_state(&mut self, id: ScoreStateId) -> Result<(), RegistryError> {
        self.states
            .remove(id)
            .ok_or(RegistryError::ScoreStateNotFound(id))?;
        self.state_order.retain(|&s| s != id);
        self.version += 1;
        Ok(())
    }

    pub fn score_state(&self, id: ScoreStateId) -> Option<&Arc<dyn ScoreState>> {
        self.states.get(id)
    }

    /// Score states in registration order.
    pub fn score_states(&self) -> impl Iterator<Item = (ScoreStateId, &Arc<dyn ScoreState>)> + '_ {
        self.state_order
            .iter()
            .filter_map(|&id| self.states.get(id).map(|s| (id, s)))
    }

    pub fn add_close_pair_score(&mut self, score: ClosePairScore) -> Result<ClosePairId, RegistryError> {
        check_weight(score.weight)?;
        if !score.cutoff.is_finite() || score.cutoff < 0.0 {
            return Err(RegistryError::InvalidCutoff(score.cutoff));
        }
        let id = self.close_pairs.insert(score);
        self.close_pair_order.push(id);
        self.version += 1;
        Ok(id)
    }

    pub fn remove_close_pair_score(&mut self, id: ClosePairId) -> Result<(), RegistryError> {
        self.close_pairs
            .remove(id)
            .ok_or(RegistryError::ClosePairNotFound(id))?;
        self.close_pair_order.retain(|&c| c != id);
        self.version += 1;
        Ok(())
    }

    pub fn close_pair(&self, id: ClosePairId) -> Option<&ClosePairScore> {
        self.close_pairs.get(id)
    }

    /// Close-pair scores in registration order.
    pub fn close_pairs(&self) -> impl Iterator<Item = (ClosePairId, &ClosePairScore)> + '_ {
        self.close_pair_order
            .iter()
            .filter_map(|&id| self.close_pairs.get(id).map(|c| (id, c)))
    }
}
