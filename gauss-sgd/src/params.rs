use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::errors::{ProcessError, Result};
use crate::kernel::Kernel;
use crate::optimizer::{GradientDescent, Optimizer};
use crate::process::GaussProcs;

#[derive(Clone, Debug)]
/// The set of settings used to build a [GaussProcs]
///
/// Mandatory settings are given to [GpParams::new], the rest have defaults:
///
/// * `noise`: $0$
/// * `train_noise`: `false`
/// * `optimizer`: [GradientDescent] with learning rate $0.01$
/// * `verbose`: $0$
/// * `seed`: none, the shuffling generator is seeded from entropy
///
/// Nothing is checked until [GpParams::build].
///
/// # Examples
///
/// ```
/// use gauss_sgd::{GpParams, Momentum, SquaredExponential};
///
/// let kernel = SquaredExponential::new(vec![1.], 1.).unwrap();
/// let process = GpParams::new(1, kernel, 10, 10)
///     .noise(0.1)
///     .train_noise(true)
///     .optimizer(Momentum::new(0.01, 0.9))
///     .seed(42)
///     .build()
///     .unwrap();
/// assert!(!process.is_fitted());
/// ```
pub struct GpParams<K: Kernel, O: Optimizer = GradientDescent> {
    pub(crate) n_dim: usize,
    pub(crate) kernel: K,
    pub(crate) n_epochs: usize,
    pub(crate) batch_size: usize,
    pub(crate) noise: f64,
    pub(crate) train_noise: bool,
    pub(crate) optimizer: O,
    pub(crate) verbose: u8,
    pub(crate) seed: Option<u64>,
}

impl<K: Kernel> GpParams<K, GradientDescent> {
    /// Settings for a process over `n_dim` dimensional inputs, trained for `n_epochs`
    /// passes over the data in minibatches of `batch_size` rows
    pub fn new(n_dim: usize, kernel: K, n_epochs: usize, batch_size: usize) -> Self {
        Self {
            n_dim,
            kernel,
            n_epochs,
            batch_size,
            noise: 0.,
            train_noise: false,
            optimizer: GradientDescent::default(),
            verbose: 0,
            seed: None,
        }
    }
}

impl<K: Kernel, O: Optimizer> GpParams<K, O> {
    /// Initial observation noise $\sigma$, the diagonal term added to the covariance is $\sigma^{2}$
    #[must_use]
    pub fn noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Whether $\sigma$ is optimised along with the length scales
    #[must_use]
    pub fn train_noise(mut self, train_noise: bool) -> Self {
        self.train_noise = train_noise;
        self
    }

    /// Update rule used on each minibatch
    pub fn optimizer<P: Optimizer>(self, optimizer: P) -> GpParams<K, P> {
        GpParams {
            n_dim: self.n_dim,
            kernel: self.kernel,
            n_epochs: self.n_epochs,
            batch_size: self.batch_size,
            noise: self.noise,
            train_noise: self.train_noise,
            optimizer,
            verbose: self.verbose,
            seed: self.seed,
        }
    }

    /// 0 is quiet, 1 logs each epoch at `info`, 2 also logs each minibatch at `debug`
    #[must_use]
    pub fn verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    /// Seed for the minibatch shuffling, every fit then replays the same permutations
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn check(&self) -> Result<()> {
        if self.n_dim == 0 {
            return Err(ProcessError::InvalidConfig(
                "n_dim must be positive".to_string(),
            ));
        }
        if self.kernel.n_dim() != self.n_dim {
            return Err(ProcessError::DimensionMismatch {
                expected: self.n_dim,
                found: self.kernel.n_dim(),
            });
        }
        if self.n_epochs == 0 {
            return Err(ProcessError::InvalidConfig(
                "n_epochs must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ProcessError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if !self.noise.is_finite() {
            return Err(ProcessError::InvalidConfig(format!(
                "noise must be finite, found {}",
                self.noise
            )));
        }
        Ok(())
    }

    pub(crate) fn rng(&self) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        }
    }

    /// Validate the settings and create an unfitted process
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel dimension differs from `n_dim`, if `n_epochs` or
    /// `batch_size` is zero, or if the noise is not finite
    pub fn build(self) -> Result<GaussProcs<K, O>> {
        self.check()?;
        Ok(GaussProcs::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SquaredExponential;

    fn kernel(n_dim: usize) -> SquaredExponential {
        SquaredExponential::new(vec![1.; n_dim], 1.).unwrap()
    }

    #[test]
    fn defaults() {
        let params = GpParams::new(2, kernel(2), 5, 3);
        assert_eq!(params.noise, 0.);
        assert!(!params.train_noise);
        assert_eq!(params.optimizer, GradientDescent::new(0.01));
        assert_eq!(params.verbose, 0);
        assert!(params.build().is_ok());
    }

    #[test]
    fn kernel_dimension_must_match() {
        assert_eq!(
            GpParams::new(3, kernel(2), 5, 3).build().unwrap_err(),
            ProcessError::DimensionMismatch {
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn counts_must_be_positive() {
        assert!(matches!(
            GpParams::new(1, kernel(1), 0, 3).build(),
            Err(ProcessError::InvalidConfig(_))
        ));
        assert!(matches!(
            GpParams::new(1, kernel(1), 5, 0).build(),
            Err(ProcessError::InvalidConfig(_))
        ));
        assert!(matches!(
            GpParams::new(1, kernel(1), 5, 2).noise(f64::NAN).build(),
            Err(ProcessError::InvalidConfig(_))
        ));
    }

    #[test]
    fn seeded_rngs_agree() {
        use rand::Rng;
        let params = GpParams::new(1, kernel(1), 1, 1).seed(3);
        let a: u64 = params.rng().gen();
        let b: u64 = params.rng().gen();
        assert_eq!(a, b);
    }
}
