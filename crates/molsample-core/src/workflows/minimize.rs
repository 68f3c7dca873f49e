use crate::core::models::ids::EntityId;
use crate::core::models::keys::FloatKey;
use crate::engine::config::MinimizerConfig;
use crate::engine::error::EngineError;
use crate::engine::model::Model;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct MinimizationResult {
    pub initial_score: f64,
    pub final_score: f64,
    pub steps: usize,
    /// `true` if minimization stopped on the threshold, a vanishing gradient or a
    /// vanishing step rather than on the step budget.
    pub converged: bool,
}

/// Steepest descent over every optimizable float attribute.
///
/// Each step moves all attributes by `step_size` along the normalized negative gradient.
/// An improving step is kept and the step size grows by 1.4; otherwise the attributes are
/// restored and the step size is halved.
#[instrument(skip_all, name = "steepest_descent_workflow")]
pub fn steepest_descent(
    model: &mut Model,
    config: &MinimizerConfig,
) -> Result<MinimizationResult, EngineError> {
    config.validate()?;

    let mut score = model.evaluate(true)?;
    let initial_score = score;
    let mut step_size = config.initial_step_size;
    let mut steps = 0;
    let mut converged = false;

    while steps < config.max_steps {
        if config.score_threshold.is_some_and(|t| score <= t) {
            converged = true;
            break;
        }
        if step_size < config.min_step_size {
            converged = true;
            break;
        }

        let attributes: Vec<(EntityId, FloatKey)> = model.store().optimizable_floats();
        let gradient = attributes
            .iter()
            .map(|&(id, key)| model.store().derivative(id, key))
            .collect::<Result<Vec<_>, _>>()?;
        let norm = gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
        if norm == 0.0 {
            converged = true;
            break;
        }

        let saved = model.store().snapshot_floats(&attributes)?;
        let store = model.store_mut();
        for (&(id, key), g) in attributes.iter().zip(&gradient) {
            let value = store.get_float(id, key)?;
            store.set_float(id, key, value - step_size * g / norm)?;
        }
        steps += 1;

        let trial = model.evaluate(true)?;
        if trial < score {
            score = trial;
            step_size *= 1.4;
        } else {
            model.store_mut().restore_floats(&saved)?;
            step_size *= 0.5;
            score = model.evaluate(true)?;
        }
        debug!(step = steps, score, step_size, "Steepest descent step.");
    }

    info!(
        initial_score,
        final_score = score,
        steps,
        converged,
        "Steepest descent finished."
    );
    Ok(MinimizationResult {
        initial_score,
        final_score: score,
        steps,
        converged,
    })
}
