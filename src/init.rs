//! Random weight initialization.

use crate::error::{Error, Result};
use crate::real::{Real, real};
use crate::tensor::Tensor;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

/// Standard deviation before the master scale is applied.
pub const DEFAULT_SIGMA: f64 = 0.05;

// spreads worker seeds apart
const WORKER_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Fan-in of a weight of this shape: the product of every dimension after
/// the first.
#[must_use]
pub fn fan_in(shape: &[usize]) -> usize {
    shape.iter().skip(1).product()
}

/// Scale `sqrt(2 / fan_in) / sqrt(2)` for a weight of this shape.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn fan_in_scale(shape: &[usize]) -> f64 {
    let fan_in = fan_in(shape).max(1) as f64;
    (2.0 / fan_in).sqrt() / std::f64::consts::SQRT_2
}

/// Fills weights with normally distributed values in parallel.
///
/// Worker `id` of `W` writes indices `id, id + W, id + 2W, ...` from its own
/// generator. With a seed the generators are derived from it and the result
/// depends only on the seed and the worker count.
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    sigma: f64,
    seed: Option<u64>,
    workers: Option<usize>,
}

impl Default for Initializer {
    fn default() -> Self {
        Self {
            sigma: DEFAULT_SIGMA,
            seed: None,
            workers: None,
        }
    }
}

impl Initializer {
    /// Unseeded initializer with [`DEFAULT_SIGMA`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives every worker's generator from `seed`.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Overrides the worker count (defaults to the rayon pool size).
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    /// Overrides the base standard deviation.
    #[must_use]
    pub fn sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }

    /// Fills `tensor.data` with `N(0, sigma * master_scale)` samples.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] unless the data is host-resident and
    /// [`Error::Config`] for a negative or non-finite deviation.
    pub fn init_weight(&self, tensor: &mut Tensor, master_scale: f64) -> Result<()> {
        let std_dev = self.sigma * master_scale;
        if !(std_dev >= 0.0 && std_dev.is_finite()) {
            return Err(Error::Config(format!("invalid deviation {std_dev}")));
        }
        let normal = Normal::new(0.0, std_dev)
            .map_err(|e| Error::Config(format!("invalid deviation {std_dev}: {e}")))?;
        let data = tensor.data.host_mut()?;
        let len = data.len();
        let workers = self.workers.unwrap_or_else(rayon::current_num_threads).max(1);
        let seed = self.seed;

        let strides: Vec<Vec<Real>> = (0..workers)
            .into_par_iter()
            .map(|id| {
                let mut rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(seed ^ (id as u64).wrapping_mul(WORKER_STRIDE)),
                    None => StdRng::from_os_rng(),
                };
                (id..len)
                    .step_by(workers)
                    .map(|_| real(normal.sample(&mut rng)))
                    .collect()
            })
            .collect();

        for (id, stride) in strides.into_iter().enumerate() {
            for (k, value) in stride.into_iter().enumerate() {
                data[id + k * workers] = value;
            }
        }

        tracing::debug!(len, workers, std_dev, "weights initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_in_skips_first_dimension() {
        assert_eq!(fan_in(&[4, 3, 2]), 6);
        assert_eq!(fan_in(&[7]), 1);
        assert!((fan_in_scale(&[1, 2]) - 0.707_106_781).abs() < 1e-6);
    }

    #[test]
    fn rejects_negative_scale() {
        let mut t = Tensor::zeros([2, 2], 1);
        assert!(matches!(
            Initializer::new().init_weight(&mut t, -1.0),
            Err(Error::Config(_))
        ));
        assert!(Initializer::new().init_weight(&mut t, f64::NAN).is_err());
        assert!(Initializer::new().sigma(f64::INFINITY).init_weight(&mut t, 1.0).is_err());
        assert_eq!(t.data.to_vec().unwrap(), [0.0; 4]);
    }
}
