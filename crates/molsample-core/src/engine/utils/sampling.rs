use rand::Rng;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SamplingError {
    #[error("Invalid temperature: {0}. Temperature must be finite and non-negative")]
    InvalidTemperature(f64),
    #[error("Score difference is not finite: {0}")]
    NonFiniteDelta(f64),
}

/// Metropolis acceptance test for a proposal that changes the score by `delta`.
///
/// Non-increasing moves are always accepted. Otherwise the move is accepted with
/// probability `exp(-delta / temperature)`; at zero temperature it is rejected.
#[instrument(level = "trace", skip_all, fields(delta, temperature))]
pub fn metropolis_accept<R: Rng + ?Sized>(
    delta: f64,
    temperature: f64,
    rng: &mut R,
) -> Result<bool, SamplingError> {
    if !temperature.is_finite() || temperature < 0.0 {
        return Err(SamplingError::InvalidTemperature(temperature));
    }
    if delta.is_nan() || delta == f64::INFINITY {
        return Err(SamplingError::NonFiniteDelta(delta));
    }
    if delta <= 0.0 {
        return Ok(true);
    }
    if temperature == 0.0 {
        return Ok(false);
    }
    Ok(rng.r#gen::<f64>() < (-delta / temperature).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn downhill_moves_are_always_accepted() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert!(metropolis_accept(-1.0, 0.5, &mut rng).unwrap());
            assert!(metropolis_accept(0.0, 0.0, &mut rng).unwrap());
        }
    }

    #[test]
    fn zero_temperature_rejects_uphill_moves() {
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..100 {
            assert!(!metropolis_accept(1e-12, 0.0, &mut rng).unwrap());
        }
    }

    #[test]
    fn uphill_acceptance_rate_follows_the_boltzmann_factor() {
        let mut rng = StdRng::seed_from_u64(3);
        let trials = 20_000;
        let accepted = (0..trials)
            .filter(|_| metropolis_accept(1.0, 1.0, &mut rng).unwrap())
            .count();
        let rate = accepted as f64 / trials as f64;
        assert!((rate - (-1.0f64).exp()).abs() < 0.02, "rate was {}", rate);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let mut rng = StdRng::seed_from_u64(4);
        assert_eq!(
            metropolis_accept(1.0, -1.0, &mut rng),
            Err(SamplingError::InvalidTemperature(-1.0))
        );
        assert!(matches!(
            metropolis_accept(f64::NAN, 1.0, &mut rng),
            Err(SamplingError::NonFiniteDelta(_))
        ));
        assert!(metropolis_accept(f64::NEG_INFINITY, 1.0, &mut rng).unwrap());
    }
}
