//! Covariance functions.
//!
//! Both kernels here are stationary with one length scale per input dimension
//! (automatic relevance determination) and an amplitude:
//!
//! $k(a, b) = \text{amp}^{2} \, f(r^{2}), \quad r^{2} = \sum_{d} \frac{(a_{d} - b_{d})^{2}}{\ell_{d}^{2}}$
//!
//! The trainable parameters are $\theta_{d} = \ln \ell_{d}$, so that any update of
//! $\theta$ leaves the length scales strictly positive.

use std::fmt::Debug;

use faer::Mat;
use rand::Rng;

use crate::errors::{ProcessError, Result};

/// Trait bounds needed for a type to be used as the covariance function of a [GaussProcs](crate::GaussProcs)
///
/// 1. A covariance between the rows of two design matrices
///
/// 2. A set of differentiable parameters and the derivative of the autocovariance
/// with respect to each of them
///
/// The amplitude is read by the process but is not part of the trainable parameters.
///
/// Note that the covariance function should never return NaN
pub trait Kernel: Clone + Debug {
    /// Number of columns expected in every design matrix
    fn n_dim(&self) -> usize;

    /// The amplitude, $k(x, x) = \text{amp}^{2}$ for stationary kernels
    fn amplitude(&self) -> f64;

    /// The current length scales $\ell_{d}$
    fn length_scales(&self) -> Vec<f64>;

    /// The unconstrained trainable parameters
    fn params(&self) -> Vec<f64>;

    /// Overwrite the trainable parameters, `params.len()` must equal `self.params().len()`
    fn set_params(&mut self, params: &[f64]);

    /// Covariance between each row of `a` (M x D) and each row of `b` (N x D), giving M x N
    ///
    /// # Panics
    ///
    /// Panics if `a` or `b` has fewer than [Kernel::n_dim] columns
    fn covariance(&self, a: &Mat<f64>, b: &Mat<f64>) -> Mat<f64>;

    /// Covariance of `a` against itself
    fn autocovariance(&self, a: &Mat<f64>) -> Mat<f64> {
        self.covariance(a, a)
    }

    /// $\partial k(a, a) / \partial \theta_{p}$ for every trainable parameter $p$, in the order of [Kernel::params]
    ///
    /// # Panics
    ///
    /// Panics if `a` has fewer than [Kernel::n_dim] columns
    fn param_gradients(&self, a: &Mat<f64>) -> Vec<Mat<f64>>;
}

fn validate(length_scales: &[f64], amp: f64) -> Result<()> {
    if length_scales.is_empty() {
        return Err(ProcessError::InvalidConfig(
            "a kernel needs at least one dimension".to_string(),
        ));
    }
    if let Some(bad) = length_scales.iter().find(|l| !(l.is_finite() && **l > 0.)) {
        return Err(ProcessError::InvalidConfig(format!(
            "length scales must be positive, found {bad}"
        )));
    }
    if !(amp.is_finite() && amp > 0.) {
        return Err(ProcessError::InvalidConfig(format!(
            "amplitude must be positive, found {amp}"
        )));
    }
    Ok(())
}

fn random_scales<R: Rng + ?Sized>(
    n_dim: usize,
    range: (f64, f64),
    rng: &mut R,
) -> Result<Vec<f64>> {
    if !(range.0 > 0. && range.0 < range.1 && range.1.is_finite()) {
        return Err(ProcessError::InvalidConfig(format!(
            "length scale range must satisfy 0 < low < high, found {range:?}"
        )));
    }
    Ok((0..n_dim).map(|_| rng.gen_range(range.0..range.1)).collect())
}

/// $r^{2}$ between row `i` of `a` and row `j` of `b`
fn scaled_sq_dist(a: &Mat<f64>, i: usize, b: &Mat<f64>, j: usize, inv_sq: &[f64]) -> f64 {
    inv_sq
        .iter()
        .enumerate()
        .map(|(d, w)| (a[(i, d)] - b[(j, d)]).powi(2) * w)
        .sum()
}

fn inverse_squares(log_scales: &[f64]) -> Vec<f64> {
    log_scales.iter().map(|t| (-2. * t).exp()).collect()
}

/// Build $\partial K / \partial \theta_{d}$ given $\partial k / \partial r^{2}$
///
/// $\frac{\partial r^{2}}{\partial \theta_{d}} = -2 \frac{(a_{d} - b_{d})^{2}}{\ell_{d}^{2}}$
fn stationary_gradients(
    a: &Mat<f64>,
    log_scales: &[f64],
    dk_dr2: impl Fn(f64) -> f64,
) -> Vec<Mat<f64>> {
    let n = a.nrows();
    let inv_sq = inverse_squares(log_scales);
    let r2 = Mat::from_fn(n, n, |i, j| scaled_sq_dist(a, i, a, j, &inv_sq));
    let slope = Mat::from_fn(n, n, |i, j| dk_dr2(r2[(i, j)]));
    inv_sq
        .iter()
        .enumerate()
        .map(|(d, w)| {
            Mat::from_fn(n, n, |i, j| {
                -2. * slope[(i, j)] * (a[(i, d)] - a[(j, d)]).powi(2) * w
            })
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
/// Squared exponential (RBF) kernel
///
/// $k(a, b) = \text{amp}^{2} \exp(-\frac{1}{2} r^{2})$
///
/// # Examples
///
/// ```
/// use faer::mat;
/// use gauss_sgd::{Kernel, SquaredExponential};
///
/// let kernel = SquaredExponential::new(vec![1.], 2.).unwrap();
/// let x = mat![[0.], [1.]];
/// let k = kernel.autocovariance(&x);
/// assert!((k[(0, 0)] - 4.).abs() < 1e-12);
/// assert!((k[(0, 1)] - 4. * (-0.5f64).exp()).abs() < 1e-12);
/// ```
pub struct SquaredExponential {
    log_scales: Vec<f64>,
    amp: f64,
}

impl SquaredExponential {
    /// Default range the length scales are drawn from in [SquaredExponential::random]
    pub const DEFAULT_SCALE_RANGE: (f64, f64) = (0.1, 0.2);

    /// Creates the kernel from explicit length scales, one per dimension
    ///
    /// # Errors
    ///
    /// Returns an error if any length scale or the amplitude is non positive
    pub fn new(length_scales: Vec<f64>, amp: f64) -> Result<Self> {
        validate(&length_scales, amp)?;
        Ok(Self {
            log_scales: length_scales.iter().map(|l| l.ln()).collect(),
            amp,
        })
    }

    /// Creates the kernel with length scales drawn uniformly from `range`
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not positive and increasing, or the amplitude is non positive
    pub fn random<R: Rng + ?Sized>(
        n_dim: usize,
        range: (f64, f64),
        amp: f64,
        rng: &mut R,
    ) -> Result<Self> {
        Self::new(random_scales(n_dim, range, rng)?, amp)
    }
}

impl Kernel for SquaredExponential {
    fn n_dim(&self) -> usize {
        self.log_scales.len()
    }

    fn amplitude(&self) -> f64 {
        self.amp
    }

    fn length_scales(&self) -> Vec<f64> {
        self.log_scales.iter().map(|t| t.exp()).collect()
    }

    fn params(&self) -> Vec<f64> {
        self.log_scales.clone()
    }

    fn set_params(&mut self, params: &[f64]) {
        self.log_scales.copy_from_slice(params);
    }

    fn covariance(&self, a: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
        let inv_sq = inverse_squares(&self.log_scales);
        let amp2 = self.amp.powi(2);
        Mat::from_fn(a.nrows(), b.nrows(), |i, j| {
            amp2 * (-0.5 * scaled_sq_dist(a, i, b, j, &inv_sq)).exp()
        })
    }

    fn param_gradients(&self, a: &Mat<f64>) -> Vec<Mat<f64>> {
        let amp2 = self.amp.powi(2);
        stationary_gradients(a, &self.log_scales, |r2| -0.5 * amp2 * (-0.5 * r2).exp())
    }
}

#[derive(Clone, Debug, PartialEq)]
/// Matérn 5/2 kernel
///
/// $k(a, b) = \text{amp}^{2} (1 + \sqrt{5} r + \frac{5}{3} r^{2}) \exp(-\sqrt{5} r)$
pub struct Matern52 {
    log_scales: Vec<f64>,
    amp: f64,
}

impl Matern52 {
    /// Creates the kernel from explicit length scales, one per dimension
    ///
    /// # Errors
    ///
    /// Returns an error if any length scale or the amplitude is non positive
    pub fn new(length_scales: Vec<f64>, amp: f64) -> Result<Self> {
        validate(&length_scales, amp)?;
        Ok(Self {
            log_scales: length_scales.iter().map(|l| l.ln()).collect(),
            amp,
        })
    }

    /// Creates the kernel with length scales drawn uniformly from `range`
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not positive and increasing, or the amplitude is non positive
    pub fn random<R: Rng + ?Sized>(
        n_dim: usize,
        range: (f64, f64),
        amp: f64,
        rng: &mut R,
    ) -> Result<Self> {
        Self::new(random_scales(n_dim, range, rng)?, amp)
    }
}

const SQRT_5: f64 = 2.236_067_977_499_79;

impl Kernel for Matern52 {
    fn n_dim(&self) -> usize {
        self.log_scales.len()
    }

    fn amplitude(&self) -> f64 {
        self.amp
    }

    fn length_scales(&self) -> Vec<f64> {
        self.log_scales.iter().map(|t| t.exp()).collect()
    }

    fn params(&self) -> Vec<f64> {
        self.log_scales.clone()
    }

    fn set_params(&mut self, params: &[f64]) {
        self.log_scales.copy_from_slice(params);
    }

    fn covariance(&self, a: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
        let inv_sq = inverse_squares(&self.log_scales);
        let amp2 = self.amp.powi(2);
        Mat::from_fn(a.nrows(), b.nrows(), |i, j| {
            let r2 = scaled_sq_dist(a, i, b, j, &inv_sq);
            let r = r2.sqrt();
            amp2 * (1. + SQRT_5 * r + 5. / 3. * r2) * (-SQRT_5 * r).exp()
        })
    }

    fn param_gradients(&self, a: &Mat<f64>) -> Vec<Mat<f64>> {
        let amp2 = self.amp.powi(2);
        // dk/dr2 = dk/dr / 2r, the r cancels so this is finite at r = 0
        stationary_gradients(a, &self.log_scales, |r2| {
            let r = r2.sqrt();
            -amp2 * 5. / 6. * (1. + SQRT_5 * r) * (-SQRT_5 * r).exp()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use faer::mat;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn design() -> Mat<f64> {
        mat![[0.1, 1.0], [0.7, -0.3], [1.4, 0.2], [-0.5, 0.9]]
    }

    fn check_gradients<K: Kernel>(kernel: &K) {
        let x = design();
        let grads = kernel.param_gradients(&x);
        let params = kernel.params();
        assert_eq!(grads.len(), params.len());
        let eps = 1e-6;
        for (p, grad) in grads.iter().enumerate() {
            let mut shifted = kernel.clone();
            let mut moved = params.clone();
            moved[p] += eps;
            shifted.set_params(&moved);
            let k0 = kernel.autocovariance(&x);
            let k1 = shifted.autocovariance(&x);
            for i in 0..x.nrows() {
                for j in 0..x.nrows() {
                    assert_approx_eq!((k1[(i, j)] - k0[(i, j)]) / eps, grad[(i, j)], 1e-5);
                }
            }
        }
    }

    #[test]
    fn covariance_is_symmetric() {
        let kernel = SquaredExponential::new(vec![0.8, 1.7], 1.3).unwrap();
        let k = kernel.autocovariance(&design());
        for i in 0..4 {
            assert_approx_eq!(k[(i, i)], 1.3f64.powi(2));
            for j in 0..4 {
                assert_approx_eq!(k[(i, j)], k[(j, i)]);
            }
        }
        let kernel = Matern52::new(vec![0.8, 1.7], 1.3).unwrap();
        let k = kernel.autocovariance(&design());
        for i in 0..4 {
            assert_approx_eq!(k[(i, i)], 1.3f64.powi(2));
            for j in 0..4 {
                assert_approx_eq!(k[(i, j)], k[(j, i)]);
            }
        }
    }

    #[test]
    fn cross_covariance_shape() {
        let kernel = SquaredExponential::new(vec![1., 1.], 1.).unwrap();
        let query = mat![[0., 0.]];
        let k = kernel.covariance(&query, &design());
        assert_eq!((k.nrows(), k.ncols()), (1, 4));
    }

    #[test]
    fn squared_exponential_gradients() {
        check_gradients(&SquaredExponential::new(vec![0.6, 1.9], 1.5).unwrap());
    }

    #[test]
    fn matern_gradients() {
        check_gradients(&Matern52::new(vec![0.6, 1.9], 1.5).unwrap());
    }

    #[test]
    fn params_are_log_scales() {
        let mut kernel = SquaredExponential::new(vec![2., 0.5], 1.).unwrap();
        assert_approx_eq!(kernel.params()[0], 2f64.ln());
        kernel.set_params(&[-10., 3.]);
        let scales = kernel.length_scales();
        assert!(scales.iter().all(|l| *l > 0.));
        assert_approx_eq!(scales[1], 3f64.exp());
    }

    #[test]
    fn random_scales_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let kernel = SquaredExponential::random(
            5,
            SquaredExponential::DEFAULT_SCALE_RANGE,
            1.,
            &mut rng,
        )
        .unwrap();
        assert_eq!(kernel.n_dim(), 5);
        assert!(kernel
            .length_scales()
            .iter()
            .all(|l| (0.1..0.2 + 1e-12).contains(l)));
    }

    #[test]
    fn invalid_parameters() {
        assert!(matches!(
            SquaredExponential::new(vec![1., 0.], 1.),
            Err(ProcessError::InvalidConfig(_))
        ));
        assert!(matches!(
            Matern52::new(vec![1.], -1.),
            Err(ProcessError::InvalidConfig(_))
        ));
        assert!(matches!(
            SquaredExponential::new(vec![], 1.),
            Err(ProcessError::InvalidConfig(_))
        ));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(
            Matern52::random(2, (0.5, 0.1), 1., &mut rng),
            Err(ProcessError::InvalidConfig(_))
        ));
    }
}
