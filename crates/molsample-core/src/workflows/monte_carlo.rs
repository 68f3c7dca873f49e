use super::minimize::steepest_descent;
use crate::core::models::ids::EntityId;
use crate::engine::config::SamplerConfig;
use crate::engine::error::EngineError;
use crate::engine::incremental::IncrementalScoringFunction;
use crate::engine::model::Model;
use crate::engine::movers::Mover;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::state::{SamplerPhase, SamplingStatistics, Solution};
use crate::engine::transaction::ProposalPhase;
use crate::engine::utils::sampling::metropolis_accept;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Clone)]
pub struct SamplingResult {
    pub initial_score: f64,
    pub final_score: f64,
    pub final_temperature: f64,
    /// Lowest-scoring state seen, if best-state tracking was enabled.
    pub best: Option<Solution>,
    pub statistics: SamplingStatistics,
    pub reached_threshold: bool,
}

struct Sampler {
    scoring: IncrementalScoringFunction,
    rng: StdRng,
    temperature: f64,
    phase: SamplerPhase,
    statistics: SamplingStatistics,
    best: Option<Solution>,
    accepted_since_check: u64,
}

impl Sampler {
    /// One propose/score/decide cycle. Returns whether the proposal was accepted.
    fn step(
        &mut self,
        model: &mut Model,
        movers: &mut [Box<dyn Mover>],
        config: &SamplerConfig,
    ) -> Result<bool, EngineError> {
        self.scoring.refresh(model)?;
        let previous = self.scoring.total();

        self.phase = SamplerPhase::Proposing;
        let mover = &mut movers[self.rng.gen_range(0..movers.len())];
        let moved = mover.select(&mut self.rng, config.move_probability)?;

        let (accepted, delta) = match self.resolve(model, &mut **mover, &moved, previous) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.abandon(model, &mut **mover);
                return Err(error);
            }
        };
        if accepted {
            self.statistics.accepted += 1;
        } else {
            self.statistics.rejected += 1;
        }
        self.statistics.steps += 1;
        trace!(
            step = self.statistics.steps,
            mover = mover.name(),
            moved = moved.len(),
            delta,
            temperature = self.temperature,
            phase = ?self.phase,
            "Monte Carlo step."
        );
        self.phase = SamplerPhase::Idle;
        Ok(accepted)
    }

    /// Declares, applies, scores and then commits or rolls back a selected proposal.
    fn resolve(
        &mut self,
        model: &mut Model,
        mover: &mut dyn Mover,
        moved: &[EntityId],
        previous: f64,
    ) -> Result<(bool, f64), EngineError> {
        self.scoring.set_moved(moved)?;
        mover.apply(model.store_mut(), &mut self.rng)?;

        self.phase = SamplerPhase::Evaluating;
        let delta = self.scoring.get_score(model)? - previous;

        let accepted = metropolis_accept(delta, self.temperature, &mut self.rng)?;
        if accepted {
            self.scoring.commit()?;
            mover.accept();
            self.phase = SamplerPhase::Accepted;
        } else {
            mover.reject(model.store_mut())?;
            self.scoring.rollback(model.store_mut())?;
            self.phase = SamplerPhase::Rejected;
        }
        Ok((accepted, delta))
    }

    /// Undoes a proposal that failed part way, so the mover and the scoring function
    /// can take the next one.
    fn abandon(&mut self, model: &mut Model, mover: &mut dyn Mover) {
        if let Err(error) = mover.reject(model.store_mut()) {
            warn!(mover = mover.name(), %error, "Mover failed to restore its proposal.");
        }
        if self.scoring.phase() != ProposalPhase::Idle {
            if let Err(error) = self.scoring.rollback(model.store_mut()) {
                warn!(%error, "Failed to roll back the abandoned proposal.");
            }
        }
        self.phase = SamplerPhase::Idle;
    }

    fn verify(
        &mut self,
        model: &mut Model,
        config: &SamplerConfig,
        reporter: &ProgressReporter,
    ) -> Result<(), EngineError> {
        let Some(interval) = config.scoring.consistency_interval else {
            return Ok(());
        };
        self.accepted_since_check += 1;
        if self.accepted_since_check < interval {
            return Ok(());
        }
        self.accepted_since_check = 0;
        let difference = self.scoring.check_consistency(model, config.scoring.tolerance)?;
        self.statistics.consistency_checks += 1;
        reporter.report(Progress::ConsistencyCheck {
            step: self.statistics.steps,
            difference,
        });
        Ok(())
    }

    fn refine(&mut self, model: &mut Model, config: &SamplerConfig) -> Result<(), EngineError> {
        let Some(refinement) = &config.refinement else {
            return Ok(());
        };
        if self.statistics.steps % refinement.interval != 0 {
            return Ok(());
        }
        let result = steepest_descent(model, &refinement.to_minimizer_config())?;
        let total = self.scoring.reset(model)?;
        self.statistics.refinements += 1;
        debug!(
            step = self.statistics.steps,
            before = result.initial_score,
            after = total,
            "Gradient refinement applied."
        );
        Ok(())
    }

    fn cool(&mut self, config: &SamplerConfig, reporter: &ProgressReporter) {
        let Some(annealing) = &config.annealing else {
            return;
        };
        if self.statistics.steps % annealing.steps_per_temperature != 0
            || self.temperature <= annealing.final_temperature
        {
            return;
        }
        self.temperature = (self.temperature * annealing.cooling_rate).max(annealing.final_temperature);
        reporter.report(Progress::StatusUpdate {
            text: format!("Temperature: {:.4}", self.temperature),
        });
    }

    fn track_best(&mut self, model: &Model, reporter: &ProgressReporter) {
        let score = self.scoring.total();
        if let Some(best) = &mut self.best {
            if score < best.score {
                *best = Solution {
                    score,
                    store: model.store().clone(),
                };
                reporter.report(Progress::Improvement {
                    step: self.statistics.steps,
                    score,
                });
            }
        }
    }
}

/// Metropolis Monte Carlo sampling driven by the incremental scoring function.
///
/// Each step picks a mover uniformly at random, lets it perturb the store, scores the
/// proposal incrementally and accepts or rejects it by the Metropolis criterion. Rejected
/// proposals are undone by the mover and rolled back in the scoring caches.
///
/// Sampling stops after `config.max_steps` steps or once the score drops to the
/// configured threshold.
#[instrument(skip_all, name = "monte_carlo_workflow")]
pub fn run(
    model: &mut Model,
    movers: &mut [Box<dyn Mover>],
    config: &SamplerConfig,
    reporter: &ProgressReporter,
) -> Result<SamplingResult, EngineError> {
    // === Phase 0: Preparation ===
    reporter.report(Progress::PhaseStart {
        name: "Preparation",
    });
    config.validate()?;
    if movers.is_empty() {
        return Err(EngineError::Initialization(
            "Monte Carlo sampling needs at least one mover".to_string(),
        ));
    }
    model.set_check_inputs(config.scoring.check_inputs);

    let rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let scoring = IncrementalScoringFunction::new(model, config.scoring.slack)?;
    let initial_score = scoring.total();
    info!(
        initial_score,
        movers = movers.len(),
        max_steps = config.max_steps,
        temperature = config.temperature,
        "Starting Monte Carlo sampling."
    );
    let mut sampler = Sampler {
        best: config.track_best.then(|| Solution {
            score: initial_score,
            store: model.store().clone(),
        }),
        scoring,
        rng,
        temperature: config.temperature,
        phase: SamplerPhase::Idle,
        statistics: SamplingStatistics::default(),
        accepted_since_check: 0,
    };
    reporter.report(Progress::PhaseFinish);

    // === Phase 1: Sampling ===
    reporter.report(Progress::PhaseStart {
        name: "Monte Carlo",
    });
    reporter.report(Progress::TaskStart {
        total_steps: config.max_steps,
    });

    let below_threshold = |score: f64| config.score_threshold.is_some_and(|t| score <= t);
    let mut reached_threshold = below_threshold(initial_score);

    while sampler.statistics.steps < config.max_steps && !reached_threshold {
        let accepted = sampler.step(model, movers, config)?;
        if accepted {
            sampler.verify(model, config, reporter)?;
        }
        sampler.refine(model, config)?;
        sampler.track_best(model, reporter);
        sampler.cool(config, reporter);

        reporter.report(Progress::StepCompleted {
            step: sampler.statistics.steps,
            score: sampler.scoring.total(),
            accepted,
        });
        reporter.report(Progress::TaskIncrement);

        reached_threshold = below_threshold(sampler.scoring.total());
    }

    reporter.report(Progress::TaskFinish);
    reporter.report(Progress::PhaseFinish);

    let final_score = sampler.scoring.total();
    if sampler.statistics.steps > 0 && sampler.statistics.accepted == 0 {
        warn!("No proposal was accepted; consider a higher temperature or smaller moves.");
    }
    info!(
        final_score,
        steps = sampler.statistics.steps,
        acceptance_rate = sampler.statistics.acceptance_rate(),
        reached_threshold,
        "Monte Carlo sampling finished."
    );

    Ok(SamplingResult {
        initial_score,
        final_score,
        final_temperature: sampler.temperature,
        best: sampler.best,
        statistics: sampler.statistics,
        reached_threshold,
    })
}
