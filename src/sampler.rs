// src/sampler.rs

use rand::Rng;
use rand_distr::{Beta as BetaDist, Binomial, Distribution, Gamma as GammaDist};

/// Smallest shape/rate we hand to the gamma sampler. Conditional posteriors
/// can collapse to zero shape when a topic receives no counts.
pub const SHAPE_FLOOR: f64 = 1e-10;

#[derive(Debug)]
pub enum SamplerError {
    InvalidParameter(String),
    EmptyWeights,
}

impl std::fmt::Display for SamplerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplerError::InvalidParameter(s) => write!(f, "Invalid parameter: {}", s),
            SamplerError::EmptyWeights => write!(f, "Weight vector is empty"),
        }
    }
}

impl std::error::Error for SamplerError {}

/// Draw from Gamma(shape, scale). Shape and scale are floored so that
/// degenerate conditionals (zero counts) still return a valid positive draw.
pub fn gamma<R: Rng + ?Sized>(rng: &mut R, shape: f64, scale: f64) -> f64 {
    let shape = shape.max(SHAPE_FLOOR);
    let scale = scale.max(SHAPE_FLOOR);
    match GammaDist::new(shape, scale) {
        Ok(d) => d.sample(rng).max(f64::MIN_POSITIVE),
        // Unreachable after flooring, but keep the sampler total.
        Err(_) => f64::MIN_POSITIVE,
    }
}

/// Draw from Beta(a, b) with the same flooring policy as `gamma`.
pub fn beta<R: Rng + ?Sized>(rng: &mut R, a: f64, b: f64) -> f64 {
    let a = a.max(SHAPE_FLOOR);
    let b = b.max(SHAPE_FLOOR);
    match BetaDist::new(a, b) {
        Ok(d) => d.sample(rng).clamp(1e-12, 1.0 - 1e-12),
        Err(_) => 0.5,
    }
}

/// Draw a Dirichlet vector by normalizing independent gamma variates.
/// `concentrations` entries may be zero (they are floored internally).
pub fn dirichlet<R: Rng + ?Sized>(rng: &mut R, concentrations: &[f64]) -> Vec<f64> {
    let mut draws: Vec<f64> = concentrations.iter().map(|&a| gamma(rng, a, 1.0)).collect();
    let total: f64 = draws.iter().sum();
    if total > 0.0 {
        for d in draws.iter_mut() {
            *d /= total;
        }
    } else {
        let uniform = 1.0 / draws.len().max(1) as f64;
        for d in draws.iter_mut() {
            *d = uniform;
        }
    }
    draws
}

/// Allocate `count` items across `weights.len()` bins with probability
/// proportional to the weights. Uses sequential binomial splitting so the
/// cost is O(bins) rather than O(count).
pub fn multinomial<R: Rng + ?Sized>(
    rng: &mut R,
    count: u64,
    weights: &[f64],
) -> Result<Vec<u64>, SamplerError> {
    if weights.is_empty() {
        return Err(SamplerError::EmptyWeights);
    }
    let mut total: f64 = weights.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        // All-zero weights: dump everything in the first bin. The callers
        // only hit this when a topic column has fully decayed.
        let mut out = vec![0u64; weights.len()];
        out[0] = count;
        return Ok(out);
    }

    let mut out = vec![0u64; weights.len()];
    let mut remaining = count;
    for (i, &w) in weights.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        if i == weights.len() - 1 {
            out[i] = remaining;
            break;
        }
        let p = (w / total).clamp(0.0, 1.0);
        let draw = match Binomial::new(remaining, p) {
            Ok(d) => d.sample(rng),
            Err(_) => 0,
        };
        out[i] = draw;
        remaining -= draw;
        total = (total - w).max(0.0);
    }
    Ok(out)
}

/// Chinese Restaurant Table draw: the number of tables occupied by `count`
/// customers under concentration `rate`. Always in `0..=count`, and zero
/// when `count` is zero.
pub fn crt<R: Rng + ?Sized>(rng: &mut R, count: u64, rate: f64) -> u64 {
    if count == 0 || rate <= 0.0 {
        return 0;
    }
    let mut tables = 0u64;
    for i in 0..count {
        let p = rate / (rate + i as f64);
        if rng.gen::<f64>() < p {
            tables += 1;
        }
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_gamma_mean_roughly_matches() {
        let mut r = rng();
        let n = 20_000;
        let mean: f64 = (0..n).map(|_| gamma(&mut r, 4.0, 0.5)).sum::<f64>() / n as f64;
        // Gamma(4, 0.5) has mean 2.0.
        assert_abs_diff_eq!(mean, 2.0, epsilon = 0.1);
    }

    #[test]
    fn test_gamma_zero_shape_is_finite_positive() {
        let mut r = rng();
        for _ in 0..100 {
            let x = gamma(&mut r, 0.0, 1.0);
            assert!(x.is_finite() && x > 0.0);
        }
    }

    #[test]
    fn test_beta_bounds() {
        let mut r = rng();
        for _ in 0..1000 {
            let x = beta(&mut r, 0.3, 0.7);
            assert!(x > 0.0 && x < 1.0);
        }
    }

    #[test]
    fn test_dirichlet_sums_to_one() {
        let mut r = rng();
        let d = dirichlet(&mut r, &[0.1, 2.0, 5.0, 0.0]);
        assert_eq!(d.len(), 4);
        let total: f64 = d.iter().sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
        assert!(d.iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn test_multinomial_conserves_count() {
        let mut r = rng();
        let counts = multinomial(&mut r, 1234, &[0.5, 1.5, 3.0, 0.0, 2.0]).unwrap();
        assert_eq!(counts.iter().sum::<u64>(), 1234);
        // A zero-weight bin should receive nothing.
        assert_eq!(counts[3], 0);
    }

    #[test]
    fn test_multinomial_empty_weights_errors() {
        let mut r = rng();
        assert!(matches!(
            multinomial(&mut r, 10, &[]),
            Err(SamplerError::EmptyWeights)
        ));
    }

    #[test]
    fn test_multinomial_degenerate_weights() {
        let mut r = rng();
        let counts = multinomial(&mut r, 9, &[0.0, 0.0]).unwrap();
        assert_eq!(counts.iter().sum::<u64>(), 9);
    }

    #[test]
    fn test_crt_zero_count_gives_zero_tables() {
        let mut r = rng();
        assert_eq!(crt(&mut r, 0, 1.0), 0);
    }

    #[test]
    fn test_crt_bounded_by_count() {
        let mut r = rng();
        for count in [1u64, 5, 50, 500] {
            let tables = crt(&mut r, count, 2.5);
            assert!(tables >= 1 && tables <= count);
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_crt_never_exceeds_count(count in 0u64..200, rate in 0.01f64..50.0) {
            let mut r = StdRng::seed_from_u64(count.wrapping_mul(31));
            let tables = crt(&mut r, count, rate);
            proptest::prop_assert!(tables <= count);
        }

        #[test]
        fn prop_multinomial_total(count in 0u64..5000) {
            let mut r = StdRng::seed_from_u64(count);
            let counts = multinomial(&mut r, count, &[1.0, 2.0, 3.0]).unwrap();
            proptest::prop_assert_eq!(counts.iter().sum::<u64>(), count);
        }
    }
}
