use super::derivatives::DerivativeAccumulator;
use super::restraint::ScoringError;
use crate::core::models::ids::EntityId;
use crate::core::models::store::AttributeStore;
use std::fmt::Debug;

const MIN_DISTANCE_FOR_DERIVATIVE: f64 = 1e-12;

/// A score on an unordered pair of entities.
///
/// Pair scores are shared, immutable values: one instance may back many restraints or a
/// whole close-pair container.
pub trait PairScore: Send + Sync + Debug {
    fn score(
        &self,
        store: &AttributeStore,
        a: EntityId,
        b: EntityId,
        derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError>;
}

/// Scores a pair through a one-dimensional function of their separation.
///
/// `f` receives the separation (center distance, or surface distance when `use_radii` is
/// set) and returns the score with its derivative along that separation. The derivative is
/// projected onto both entities' coordinates.
fn score_separation<F>(
    store: &AttributeStore,
    a: EntityId,
    b: EntityId,
    use_radii: bool,
    derivatives: Option<&mut DerivativeAccumulator<'_>>,
    f: F,
) -> Result<f64, ScoringError>
where
    F: Fn(f64) -> (f64, f64),
{
    let pa = store.coordinates(a)?;
    let pb = store.coordinates(b)?;
    let delta = pa - pb;
    let distance = delta.norm();
    let separation = if use_radii {
        distance - store.radius(a)? - store.radius(b)?
    } else {
        distance
    };

    let (value, slope) = f(separation);

    if let Some(acc) = derivatives {
        if slope != 0.0 && distance > MIN_DISTANCE_FOR_DERIVATIVE {
            let gradient = delta * (slope / distance);
            acc.add_vector(a, &gradient);
            acc.add_vector(b, &(-gradient));
        }
    }
    Ok(value)
}

/// `max(0, threshold - d)` on the center distance `d`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearLowerBound {
    pub threshold: f64,
}

impl LinearLowerBound {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl PairScore for LinearLowerBound {
    fn score(
        &self,
        store: &AttributeStore,
        a: EntityId,
        b: EntityId,
        derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError> {
        score_separation(store, a, b, false, derivatives, |d| {
            if d < self.threshold {
                (self.threshold - d, -1.0)
            } else {
                (0.0, 0.0)
            }
        })
    }
}

/// `0.5 * k * (d - mean)^2` on the center distance `d`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarmonicDistance {
    pub mean: f64,
    pub k: f64,
}

impl HarmonicDistance {
    pub fn new(mean: f64, k: f64) -> Self {
        Self { mean, k }
    }
}

impl PairScore for HarmonicDistance {
    fn score(
        &self,
        store: &AttributeStore,
        a: EntityId,
        b: EntityId,
        derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError> {
        score_separation(store, a, b, false, derivatives, |d| {
            let diff = d - self.mean;
            (0.5 * self.k * diff * diff, self.k * diff)
        })
    }
}

/// Harmonic penalty applied only when the center distance exceeds `mean`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarmonicUpperBound {
    pub mean: f64,
    pub k: f64,
}

impl HarmonicUpperBound {
    pub fn new(mean: f64, k: f64) -> Self {
        Self { mean, k }
    }
}

impl PairScore for HarmonicUpperBound {
    fn score(
        &self,
        store: &AttributeStore,
        a: EntityId,
        b: EntityId,
        derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError> {
        score_separation(store, a, b, false, derivatives, |d| {
            let diff = d - self.mean;
            if diff > 0.0 {
                (0.5 * self.k * diff * diff, self.k * diff)
            } else {
                (0.0, 0.0)
            }
        })
    }
}

/// Harmonic penalty on sphere overlap: `0.5 * k * s^2` for negative surface distance `s`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftSphere {
    pub k: f64,
}

impl SoftSphere {
    pub fn new(k: f64) -> Self {
        Self { k }
    }
}

impl PairScore for SoftSphere {
    fn score(
        &self,
        store: &AttributeStore,
        a: EntityId,
        b: EntityId,
        derivatives: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoringError> {
        score_separation(store, a, b, true, derivatives, |s| {
            if s < 0.0 {
                (0.5 * self.k * s * s, self.k * s)
            } else {
                (0.0, 0.0)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::keys::FloatKey;
    use crate::core::scoring::derivatives::DerivativeBuffer;
    use nalgebra::Point3;

    fn f64_approx_equal(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn pair(distance: f64, radius: Option<f64>) -> (AttributeStore, EntityId, EntityId) {
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::origin(), radius);
        let b = store.add_point("b", Point3::new(distance, 0.0, 0.0), radius);
        (store, a, b)
    }

    #[test]
    fn linear_lower_bound_penalizes_close_pairs_only() {
        let score = LinearLowerBound::new(5.0);
        let (store, a, b) = pair(4.0, None);
        assert!(f64_approx_equal(score.score(&store, a, b, None).unwrap(), 1.0));

        let (store, a, b) = pair(6.0, None);
        assert!(f64_approx_equal(score.score(&store, a, b, None).unwrap(), 0.0));
    }

    #[test]
    fn linear_lower_bound_pushes_entities_apart() {
        let score = LinearLowerBound::new(5.0);
        let (store, a, b) = pair(4.0, None);
        let mut buffer = DerivativeBuffer::new();
        let mut acc = DerivativeAccumulator::new(&mut buffer);
        score.score(&store, a, b, Some(&mut acc)).unwrap();

        assert!(f64_approx_equal(buffer.get(a, FloatKey::X), 1.0));
        assert!(f64_approx_equal(buffer.get(b, FloatKey::X), -1.0));
    }

    #[test]
    fn harmonic_distance_is_zero_at_the_mean() {
        let score = HarmonicDistance::new(3.0, 2.0);
        let (store, a, b) = pair(3.0, None);
        assert!(f64_approx_equal(score.score(&store, a, b, None).unwrap(), 0.0));

        let (store, a, b) = pair(5.0, None);
        assert!(f64_approx_equal(score.score(&store, a, b, None).unwrap(), 4.0));
    }

    #[test]
    fn harmonic_derivative_matches_finite_difference() {
        let score = HarmonicDistance::new(1.0, 3.0);
        let mut store = AttributeStore::new();
        let a = store.add_point("a", Point3::new(0.3, -0.2, 0.1), None);
        let b = store.add_point("b", Point3::new(2.1, 0.7, -1.3), None);

        let mut buffer = DerivativeBuffer::new();
        let mut acc = DerivativeAccumulator::new(&mut buffer);
        let base = score.score(&store, a, b, Some(&mut acc)).unwrap();

        let h = 1e-6;
        let x = store.get_float(a, FloatKey::X).unwrap();
        store.set_float(a, FloatKey::X, x + h).unwrap();
        let shifted = score.score(&store, a, b, None).unwrap();
        let numeric = (shifted - base) / h;
        assert!((numeric - buffer.get(a, FloatKey::X)).abs() < 1e-4);
    }

    #[test]
    fn harmonic_upper_bound_is_flat_below_the_mean() {
        let score = HarmonicUpperBound::new(4.0, 1.0);
        let (store, a, b) = pair(2.0, None);
        assert!(f64_approx_equal(score.score(&store, a, b, None).unwrap(), 0.0));

        let (store, a, b) = pair(6.0, None);
        assert!(f64_approx_equal(score.score(&store, a, b, None).unwrap(), 2.0));
    }

    #[test]
    fn soft_sphere_uses_radii() {
        let score = SoftSphere::new(2.0);
        let (store, a, b) = pair(3.0, Some(2.0));
        assert!(f64_approx_equal(score.score(&store, a, b, None).unwrap(), 1.0));

        let (store, a, b) = pair(4.5, Some(2.0));
        assert!(f64_approx_equal(score.score(&store, a, b, None).unwrap(), 0.0));
    }
}
