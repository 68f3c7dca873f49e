use super::dependency::{DependencyGraph, score_state_order};
use super::error::EngineError;
use super::model::{Model, StructureVersion, check_finite, evaluate_restraint, update_state, update_states};
use super::pair_cache::{Pair, PairCache, canonical_pair};
use super::proximity::ProximityIndex;
use super::transaction::{PairChange, ProposalPhase, TransactionError, TransactionRecord};
use crate::core::models::ids::{ClosePairId, EntityId, RestraintId, ScoreStateId};
use crate::core::models::keys::FloatKey;
use crate::core::models::store::AttributeStore;
use crate::core::scoring::registry::RegistryError;
use crate::core::scoring::restraint::Restraint;
use itertools::Itertools;
use std::sync::Arc;
use tracing::{error, info, instrument, trace};

/// One atomic, weighted contribution to the total.
struct Term {
    origin: RestraintId,
    ancestors: Vec<RestraintId>,
    restraint: Arc<dyn Restraint>,
    weight: f64,
}

struct ClosePairTerm {
    id: ClosePairId,
    index: ProximityIndex,
    cache: PairCache,
}

/// Scores a model incrementally, re-evaluating only what a proposal can affect.
///
/// Restraints are flattened through their sets and decomposed into atomic terms whose
/// weighted scores are cached. Close-pair scores keep a [`ProximityIndex`] and a
/// [`PairCache`] holding every pair within `cutoff + slack`.
///
/// A proposal goes through [`set_moved`](Self::set_moved), [`get_score`](Self::get_score)
/// and then either [`commit`](Self::commit) or [`rollback`](Self::rollback). Between
/// `set_moved` and `get_score` the caller may change any attribute of the declared
/// entities; changing anything else leaves the caches stale, which
/// [`check_consistency`](Self::check_consistency) detects.
pub struct IncrementalScoringFunction {
    terms: Vec<Term>,
    term_scores: Vec<f64>,
    state_ids: Vec<ScoreStateId>,
    close_pair_ids: Vec<ClosePairId>,
    close_pairs: Vec<ClosePairTerm>,
    graph: DependencyGraph,
    structure: StructureVersion,
    slack: f64,
    total: f64,
    phase: ProposalPhase,
    record: Option<TransactionRecord>,
}

impl IncrementalScoringFunction {
    /// Builds all derived structures for `model` and evaluates it once from scratch.
    ///
    /// # Arguments
    ///
    /// * `slack` - Margin added to every close-pair cutoff; larger values mean fewer
    ///   proximity rebuilds but more cached pairs.
    #[instrument(skip_all, name = "incremental_scoring_init")]
    pub fn new(model: &mut Model, slack: f64) -> Result<Self, EngineError> {
        if !slack.is_finite() || slack < 0.0 {
            return Err(EngineError::Initialization(format!(
                "slack must be finite and non-negative, got {}",
                slack
            )));
        }
        let mut isf = Self {
            terms: Vec::new(),
            term_scores: Vec::new(),
            state_ids: Vec::new(),
            close_pair_ids: Vec::new(),
            close_pairs: Vec::new(),
            graph: DependencyGraph::default(),
            structure: StructureVersion::default(),
            slack,
            total: 0.0,
            phase: ProposalPhase::Idle,
            record: None,
        };
        isf.rebuild(model)?;
        info!(
            terms = isf.terms.len(),
            score_states = isf.state_ids.len(),
            close_pair_scores = isf.close_pairs.len(),
            total = isf.total,
            "Incremental scoring function initialized."
        );
        Ok(isf)
    }

    fn rebuild(&mut self, model: &mut Model) -> Result<(), EngineError> {
        let registry = model.restraints();

        let mut terms = Vec::new();
        for leaf in registry.flatten() {
            let mut pending: Vec<Arc<dyn Restraint>> = vec![Arc::clone(&leaf.restraint)];
            while let Some(restraint) = pending.pop() {
                let pieces = restraint.decompose();
                if pieces.is_empty() {
                    terms.push(Term {
                        origin: leaf.id,
                        ancestors: leaf.ancestors.clone(),
                        restraint,
                        weight: leaf.weight,
                    });
                } else {
                    pending.extend(pieces.into_iter().rev().map(Arc::<dyn Restraint>::from));
                }
            }
        }

        let state_ids = score_state_order(registry)?;
        let states = state_ids
            .iter()
            .map(|&id| {
                registry
                    .score_state(id)
                    .map(|s| (s.inputs(), s.outputs()))
                    .ok_or(RegistryError::ScoreStateNotFound(id))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let (close_pair_ids, containers): (Vec<_>, Vec<_>) = registry
            .close_pairs()
            .map(|(id, cp)| (id, cp.members().to_vec()))
            .unzip();
        let term_inputs: Vec<Vec<EntityId>> = terms.iter().map(|t| t.restraint.inputs()).collect();

        self.graph = DependencyGraph::build(&term_inputs, &states, &containers);
        self.term_scores = vec![0.0; terms.len()];
        self.terms = terms;
        self.state_ids = state_ids;
        self.close_pair_ids = close_pair_ids;
        self.close_pairs.clear();
        self.structure = model.structure_version();
        self.phase = ProposalPhase::Idle;
        self.record = None;

        self.reset(model)?;
        Ok(())
    }

    /// Recomputes every cached value from the current state.
    ///
    /// Used after bulk changes that were not declared as a proposal, such as a
    /// gradient refinement pass.
    pub fn reset(&mut self, model: &mut Model) -> Result<f64, EngineError> {
        if self.phase != ProposalPhase::Idle {
            return Err(TransactionError::ProposalInProgress.into());
        }
        if model.structure_version() != self.structure {
            return Err(EngineError::StructureChanged);
        }
        let check_inputs = model.check_inputs();
        let (store, registry) = model.split_mut();

        update_states(store, registry, &self.state_ids, check_inputs)?;

        for (score, term) in self.term_scores.iter_mut().zip(&self.terms) {
            *score = evaluate_restraint(store, term.restraint.as_ref(), term.weight, None, check_inputs)?;
        }

        self.close_pairs.clear();
        for &id in &self.close_pair_ids {
            let cp = registry
                .close_pair(id)
                .ok_or(RegistryError::ClosePairNotFound(id))?;
            let index = ProximityIndex::new(store, cp.members(), cp.cutoff, self.slack)?;
            let mut cache = PairCache::new();
            for (a, b) in index.get_pairs_within(cp.cutoff + self.slack) {
                let score = cp.score_pair(store, a, b, None)?;
                cache.insert(a, b, score);
            }
            check_finite(&cp.name, cache.sum())?;
            self.close_pairs.push(ClosePairTerm { id, index, cache });
        }

        self.total = self.sum_total();
        Ok(self.total)
    }

    /// Rebuilds all derived structures if the model's structure changed.
    ///
    /// # Return
    ///
    /// `true` if a rebuild happened.
    pub fn refresh(&mut self, model: &mut Model) -> Result<bool, EngineError> {
        if model.structure_version() == self.structure {
            return Ok(false);
        }
        if self.phase != ProposalPhase::Idle {
            return Err(TransactionError::ProposalInProgress.into());
        }
        info!("Model structure changed; rebuilding incremental scoring structures.");
        self.rebuild(model)?;
        Ok(true)
    }

    fn sum_total(&self) -> f64 {
        self.term_scores.iter().sum::<f64>()
            + self.close_pairs.iter().map(|c| c.cache.sum()).sum::<f64>()
    }

    /// Declares the entities the next proposal will change and opens a transaction.
    pub fn set_moved(&mut self, moved: &[EntityId]) -> Result<(), EngineError> {
        if self.phase != ProposalPhase::Idle {
            return Err(TransactionError::ProposalInProgress.into());
        }
        let moved: Vec<EntityId> = moved.iter().copied().unique().collect();
        self.record = Some(TransactionRecord::new(moved, self.total));
        self.phase = ProposalPhase::Declared;
        Ok(())
    }

    /// Scores the declared proposal.
    ///
    /// Only the score states, terms and close pairs reachable from the moved set are
    /// re-evaluated. Without a declared proposal the cached total is returned, and scoring
    /// an already-scored proposal again returns the same value.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StructureChanged`] if the model was structurally modified
    /// since the last build; call [`refresh`](Self::refresh) first.
    pub fn get_score(&mut self, model: &mut Model) -> Result<f64, EngineError> {
        if model.structure_version() != self.structure {
            return Err(EngineError::StructureChanged);
        }
        if self.phase != ProposalPhase::Declared {
            return Ok(self.total);
        }
        let mut record = self
            .record
            .take()
            .ok_or_else(|| EngineError::Internal("declared proposal has no record".to_string()))?;
        let result = self.score_proposal(model, &mut record);
        let previous = record.total;
        self.record = Some(record);

        self.total = result?;
        self.phase = ProposalPhase::Evaluated;
        trace!(
            total = self.total,
            delta = self.total - previous,
            "Proposal scored."
        );
        Ok(self.total)
    }

    fn score_proposal(
        &mut self,
        model: &mut Model,
        record: &mut TransactionRecord,
    ) -> Result<f64, EngineError> {
        let check_inputs = model.check_inputs();
        let affected = self.graph.affected(&record.moved);
        let (store, registry) = model.split_mut();

        for &position in &affected.states {
            let id = self.state_ids[position];
            let state = registry
                .score_state(id)
                .ok_or(RegistryError::ScoreStateNotFound(id))?;
            let attributes: Vec<(EntityId, FloatKey)> = state
                .outputs()
                .into_iter()
                .cartesian_product(state.output_keys())
                .collect();
            record.state_outputs.push(store.snapshot_floats(&attributes)?);
            update_state(store, state.as_ref(), check_inputs)?;
        }

        for &i in &affected.terms {
            let term = &self.terms[i];
            let value =
                evaluate_restraint(store, term.restraint.as_ref(), term.weight, None, check_inputs)?;
            record.term_scores.push((i, self.term_scores[i]));
            self.term_scores[i] = value;
        }

        for &c in &affected.containers {
            let term = &mut self.close_pairs[c];
            let cp = registry
                .close_pair(term.id)
                .ok_or(RegistryError::ClosePairNotFound(term.id))?;
            record.pair_sums.push((c, term.cache.sum()));

            let moved: Vec<EntityId> = affected
                .entities
                .iter()
                .copied()
                .filter(|&e| term.index.contains(e))
                .collect();
            for &entity in &moved {
                let position = store.coordinates(entity)?;
                let radius = store.radius(entity)?;
                let update = term.index.notify_moved(entity, position, radius);
                record.index_updates.push((c, update));
            }
            for &entity in &moved {
                for (pair, score) in term.cache.remove_touching(entity) {
                    record.pair_changes.push(PairChange::Removed {
                        container: c,
                        pair,
                        score,
                    });
                }
            }
            let reach = cp.cutoff + self.slack;
            for &entity in &moved {
                for other in term.index.neighbors_within(entity, reach) {
                    if term.cache.contains(entity, other) {
                        continue;
                    }
                    let score = cp.score_pair(store, entity, other, None)?;
                    term.cache.insert(entity, other, score);
                    record.pair_changes.push(PairChange::Added {
                        container: c,
                        pair: canonical_pair(entity, other),
                    });
                }
            }
            check_finite(&cp.name, term.cache.sum())?;
        }

        Ok(self.sum_total())
    }

    /// Declares `moved` (unless a proposal is already declared) and scores it.
    pub fn evaluate_incremental(
        &mut self,
        model: &mut Model,
        moved: &[EntityId],
    ) -> Result<f64, EngineError> {
        if self.phase == ProposalPhase::Idle {
            self.set_moved(moved)?;
        }
        self.get_score(model)
    }

    /// Evaluates the model from scratch, bypassing every cache.
    pub fn evaluate_full(&self, model: &mut Model, derivatives: bool) -> Result<f64, EngineError> {
        model.evaluate(derivatives)
    }

    /// Accepts the scored proposal and discards its transaction record.
    pub fn commit(&mut self) -> Result<(), TransactionError> {
        match self.phase {
            ProposalPhase::Idle => Err(TransactionError::NoActiveProposal),
            ProposalPhase::Declared => Err(TransactionError::NotEvaluated),
            ProposalPhase::Evaluated => {
                self.record = None;
                self.phase = ProposalPhase::Idle;
                Ok(())
            }
        }
    }

    /// Rejects the open proposal, restoring every cache to its state before
    /// [`set_moved`](Self::set_moved).
    ///
    /// Score-state outputs written while scoring are restored in `store`. The raw
    /// attributes of the moved entities are the caller's to restore.
    pub fn rollback(&mut self, store: &mut AttributeStore) -> Result<(), EngineError> {
        if self.phase == ProposalPhase::Idle {
            return Err(TransactionError::NoActiveProposal.into());
        }
        let record = self
            .record
            .take()
            .ok_or_else(|| EngineError::Internal("open proposal has no record".to_string()))?;

        for change in record.pair_changes.into_iter().rev() {
            match change {
                PairChange::Added { container, pair } => {
                    self.close_pairs[container].cache.remove(pair.0, pair.1);
                }
                PairChange::Removed {
                    container,
                    pair,
                    score,
                } => {
                    self.close_pairs[container].cache.insert(pair.0, pair.1, score);
                }
            }
        }
        for (c, update) in record.index_updates.into_iter().rev() {
            self.close_pairs[c].index.revert(update);
        }
        for (c, sum) in record.pair_sums.into_iter().rev() {
            self.close_pairs[c].cache.set_sum(sum);
        }
        for (i, score) in record.term_scores.into_iter().rev() {
            self.term_scores[i] = score;
        }
        self.total = record.total;
        self.phase = ProposalPhase::Idle;

        for snapshot in record.state_outputs.iter().rev() {
            store.restore_floats(snapshot)?;
        }
        trace!(total = self.total, "Proposal rolled back.");
        Ok(())
    }

    /// Compares the cached total with a full evaluation.
    ///
    /// # Return
    ///
    /// The absolute difference, if within `tolerance` relative to `max(1, |full|)`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CacheDesync`] otherwise.
    pub fn check_consistency(&self, model: &mut Model, tolerance: f64) -> Result<f64, EngineError> {
        let full = model.evaluate(false)?;
        let difference = (full - self.total).abs();
        if difference > tolerance * full.abs().max(1.0) {
            error!(
                incremental = self.total,
                full,
                difference,
                "Incremental score is out of sync with full evaluation."
            );
            return Err(EngineError::CacheDesync {
                incremental: self.total,
                full,
                difference,
            });
        }
        Ok(difference)
    }

    #[inline]
    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn phase(&self) -> ProposalPhase {
        self.phase
    }

    pub fn slack(&self) -> f64 {
        self.slack
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    /// The moved set of the open proposal, if any.
    pub fn moved(&self) -> Option<&[EntityId]> {
        self.record.as_ref().map(|r| r.moved.as_slice())
    }

    /// Last computed weighted contribution of a restraint or restraint set.
    pub fn restraint_score(&self, id: RestraintId) -> Option<f64> {
        let mut found = false;
        let mut sum = 0.0;
        for (term, score) in self.terms.iter().zip(&self.term_scores) {
            if term.origin == id || term.ancestors.contains(&id) {
                found = true;
                sum += score;
            }
        }
        found.then_some(sum)
    }

    /// Last computed value of a close-pair score.
    pub fn close_pair_score(&self, id: ClosePairId) -> Option<f64> {
        self.close_pair_term(id).map(|c| c.cache.sum())
    }

    /// Pairs currently held in a close-pair cache (within `cutoff + slack`).
    pub fn cached_pairs(&self, id: ClosePairId) -> Option<Vec<Pair>> {
        self.close_pair_term(id).map(|c| c.cache.pairs())
    }

    pub fn proximity_index(&self, id: ClosePairId) -> Option<&ProximityIndex> {
        self.close_pair_term(id).map(|c| &c.index)
    }

    fn close_pair_term(&self, id: ClosePairId) -> Option<&ClosePairTerm> {
        self.close_pairs.iter().find(|c| c.id == id)
    }

    /// Restraints whose score can change when `entity` changes, in registration order.
    /// Restraints without declared inputs are always included.
    pub fn dependent_restraints(&self, entity: EntityId) -> Vec<RestraintId> {
        self.graph
            .affected(&[entity])
            .terms
            .into_iter()
            .map(|i| self.terms[i].origin)
            .unique()
            .collect()
    }
}
