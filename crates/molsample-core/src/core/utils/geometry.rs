use nalgebra::{Point3, Vector3};
use rand::Rng;

/// Separation between two spheres: center distance minus both radii.
///
/// Negative when the spheres overlap. Point-like entities use a radius of zero.
#[inline]
pub fn surface_distance(a: &Point3<f64>, radius_a: f64, b: &Point3<f64>, radius_b: f64) -> f64 {
    nalgebra::distance(a, b) - radius_a - radius_b
}

/// Draws a point uniformly from the ball of `radius` around `center`.
pub fn random_in_ball<R: Rng + ?Sized>(center: &Point3<f64>, radius: f64, rng: &mut R) -> Point3<f64> {
    if radius <= 0.0 {
        return *center;
    }
    loop {
        let offset = Vector3::new(
            rng.gen_range(-1.0..=1.0),
            rng.gen_range(-1.0..=1.0),
            rng.gen_range(-1.0..=1.0),
        );
        if offset.norm_squared() <= 1.0 {
            return center + offset * radius;
        }
    }
}

/// Arithmetic mean of a set of points, or `None` for an empty set.
pub fn centroid(points: &[Point3<f64>]) -> Option<Point3<f64>> {
    if points.is_empty() {
        return None;
    }
    let sum = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords);
    Some(Point3::from(sum / points.len() as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn f64_approx_equal(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn surface_distance_subtracts_both_radii() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(5.0, 0.0, 0.0);
        assert!(f64_approx_equal(surface_distance(&a, 1.0, &b, 1.5), 2.5));
        assert!(f64_approx_equal(surface_distance(&a, 3.0, &b, 3.0), -1.0));
    }

    #[test]
    fn random_in_ball_stays_inside_the_ball() {
        let mut rng = StdRng::seed_from_u64(7);
        let center = Point3::new(1.0, -2.0, 3.0);
        for _ in 0..500 {
            let p = random_in_ball(&center, 0.75, &mut rng);
            assert!(nalgebra::distance(&p, &center) <= 0.75 + 1e-12);
        }
    }

    #[test]
    fn random_in_ball_with_zero_radius_returns_center() {
        let mut rng = StdRng::seed_from_u64(1);
        let center = Point3::new(4.0, 4.0, 4.0);
        assert_eq!(random_in_ball(&center, 0.0, &mut rng), center);
    }

    #[test]
    fn centroid_is_the_mean_position() {
        let points = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(1.0, 3.0, 0.0),
        ];
        let c = centroid(&points).unwrap();
        assert!(f64_approx_equal(c.x, 1.0));
        assert!(f64_approx_equal(c.y, 1.0));
        assert!(f64_approx_equal(c.z, 0.0));
        assert!(centroid(&[]).is_none());
    }
}
