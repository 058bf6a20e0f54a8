use std::{f64::consts::PI, ops::Range, time::Instant};

use faer::Mat;
use log::{debug, info};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::autodiff::Tape;
use crate::errors::{ProcessError, Result};
use crate::kernel::Kernel;
use crate::linalg::{self, check_finite};
use crate::optimizer::{GradientDescent, Optimizer};
use crate::params::GpParams;

/// Values cached at the end of a fit, everything [GaussProcs::predict] needs
#[derive(Clone, Debug)]
struct Fitted {
    k_inv: Mat<f64>,
    inputs: Mat<f64>,
    res: Mat<f64>,
}

#[derive(Debug)]
/// A Gaussian process whose kernel length scales (and optionally noise) are learnt by
/// minibatch gradient descent on the negative log marginal likelihood
///
/// For a design matrix $X$ and outputs $y$ the covariance matrix is
///
/// $\bm{K} = k(X, X) + \sigma^{2}\bm{I}$
///
/// and each minibatch step minimises
///
/// $\mathcal{L} = y^{\intercal}\bm{K}^{-1}y + \ln |\bm{K}|$
///
/// with respect to the kernel's [params](Kernel::params), plus $\sigma$ when noise is trained.
/// The amplitude of the kernel is never trained: it is used as given by prediction.
///
/// Build one through [GpParams].
pub struct GaussProcs<K: Kernel, O: Optimizer = GradientDescent> {
    n_dim: usize,
    kernel: K,
    initial_kernel: K,
    noise: f64,
    initial_noise: f64,
    n_epochs: usize,
    batch_size: usize,
    train_noise: bool,
    optimizer: O,
    verbose: u8,
    seed: Option<u64>,
    rng: ChaCha8Rng,
    fitted: Option<Fitted>,
}

/// Contiguous minibatch row ranges, `n_samples / batch_size` of them,
/// the trailing `n_samples % batch_size` rows are not covered
pub(crate) fn minibatches(
    n_samples: usize,
    batch_size: usize,
) -> impl Iterator<Item = Range<usize>> {
    (0..n_samples / batch_size).map(move |j| j * batch_size..(j + 1) * batch_size)
}

fn select_rows(a: &Mat<f64>, rows: &[usize]) -> Mat<f64> {
    Mat::from_fn(rows.len(), a.ncols(), |i, j| a[(rows[i], j)])
}

fn slice_rows(a: &Mat<f64>, rows: Range<usize>) -> Mat<f64> {
    Mat::from_fn(rows.len(), a.ncols(), |i, j| a[(rows.start + i, j)])
}

/// Apply one random permutation to the rows of both `x` and `y`
pub(crate) fn shuffle_rows<R: Rng + ?Sized>(
    x: &Mat<f64>,
    y: &Mat<f64>,
    rng: &mut R,
) -> (Mat<f64>, Mat<f64>) {
    let mut perm: Vec<usize> = (0..x.nrows()).collect();
    perm.shuffle(rng);
    (select_rows(x, &perm), select_rows(y, &perm))
}

/// $k(X, X) + \sigma^{2}\bm{I}$
fn noisy_covariance<K: Kernel>(kernel: &K, noise: f64, x: &Mat<f64>) -> Mat<f64> {
    let noise2 = noise.powi(2);
    let mut k = kernel.autocovariance(x);
    for i in 0..x.nrows() {
        k[(i, i)] += noise2;
    }
    k
}

/// The minibatch loss and its gradient with respect to the trainable parameters,
/// ordered as the kernel parameters followed by $\sigma$ when `train_noise` is set
///
/// $\frac{\partial \mathcal{L}}{\partial \theta_{p}} = \langle \bar{\bm{K}}, \frac{\partial \bm{K}}{\partial \theta_{p}} \rangle_{F}, \quad \frac{\partial \mathcal{L}}{\partial \sigma} = 2 \sigma \text{Tr}(\bar{\bm{K}})$
fn loss_and_gradient<K: Kernel>(
    kernel: &K,
    noise: f64,
    train_noise: bool,
    x: &Mat<f64>,
    y: &Mat<f64>,
) -> Result<(f64, Vec<f64>)> {
    let mut tape = Tape::new();
    let k = tape.leaf(noisy_covariance(kernel, noise, x));
    let k_inv = tape.inverse(k)?;
    let data_fit = tape.quad_form(k_inv, y);
    let log_det = tape.log_determinant(k)?;
    let loss = tape.add(data_fit, log_det);

    let loss_value = tape.scalar(loss);
    if !loss_value.is_finite() {
        return Err(ProcessError::NonFinite("loss"));
    }

    let grad = tape.backward(loss)?;
    let k_bar = grad.wrt(k).ok_or(ProcessError::NonFinite("gradient"))?;

    let mut grads: Vec<f64> = kernel
        .param_gradients(x)
        .iter()
        .map(|dk| linalg::frobenius(k_bar, dk))
        .collect();
    if train_noise {
        grads.push(2. * noise * linalg::trace(k_bar));
    }

    if grads.iter().all(|g| g.is_finite()) {
        Ok((loss_value, grads))
    } else {
        Err(ProcessError::NonFinite("gradient"))
    }
}

impl<K: Kernel, O: Optimizer> GaussProcs<K, O> {
    pub(crate) fn new(params: GpParams<K, O>) -> Self {
        let rng = params.rng();
        GaussProcs {
            n_dim: params.n_dim,
            initial_kernel: params.kernel.clone(),
            kernel: params.kernel,
            noise: params.noise,
            initial_noise: params.noise,
            n_epochs: params.n_epochs,
            batch_size: params.batch_size,
            train_noise: params.train_noise,
            optimizer: params.optimizer,
            verbose: params.verbose,
            seed: params.seed,
            rng,
            fitted: None,
        }
    }

    fn check_design(&self, x: &Mat<f64>) -> Result<()> {
        if x.ncols() == self.n_dim {
            Ok(())
        } else {
            Err(ProcessError::DimensionMismatch {
                expected: self.n_dim,
                found: x.ncols(),
            })
        }
    }

    fn check_training(&self, x: &Mat<f64>, y: &Mat<f64>) -> Result<()> {
        self.check_design(x)?;
        if y.ncols() != 1 {
            return Err(ProcessError::MismatchedInputs(format!(
                "outputs must be a single column, found {} columns",
                y.ncols()
            )));
        }
        if x.nrows() != y.nrows() {
            return Err(ProcessError::MismatchedInputs(format!(
                "{} input rows but {} outputs",
                x.nrows(),
                y.nrows()
            )));
        }
        if x.nrows() < self.batch_size {
            return Err(ProcessError::InsufficientSamples {
                n_samples: x.nrows(),
                batch_size: self.batch_size,
            });
        }
        Ok(())
    }

    /// Fit the process to observed data `x` (N x D) and `y` (N x 1)
    ///
    /// Every fit starts again from the kernel and noise the process was built with. Each of the
    /// `n_epochs` epochs shuffles the rows, then takes one optimiser step per full minibatch;
    /// the remaining `N % batch_size` rows sit that epoch out. Finally $\bm{K}^{-1}$ over all
    /// N rows is cached, together with copies of `x` and `y`, for [GaussProcs::predict].
    ///
    /// Gradient descent may only reach a local optimum, there is no convergence check.
    ///
    /// # Errors
    ///
    /// Returns an error if the shapes are inconsistent, if there are fewer rows than a
    /// minibatch, or if a covariance matrix stops being positive definite. On error the
    /// process keeps the parameters and cached values of its previous fit.
    ///
    /// # Examples
    ///
    /// ```
    /// use faer::Mat;
    /// use gauss_sgd::{GpParams, SquaredExponential};
    ///
    /// let x = Mat::from_fn(20, 1, |i, _| i as f64 * 0.5);
    /// let y = Mat::from_fn(20, 1, |i, _| (i as f64 * 0.5).sin());
    /// let kernel = SquaredExponential::new(vec![1.], 1.).unwrap();
    /// let mut process = GpParams::new(1, kernel, 5, 5).noise(0.1).seed(0).build().unwrap();
    /// process.fit(&x, &y).unwrap();
    /// assert!(process.is_fitted());
    /// ```
    pub fn fit(&mut self, x: &Mat<f64>, y: &Mat<f64>) -> Result<()> {
        self.check_training(x, y)?;
        let now = Instant::now();

        let mut kernel = self.initial_kernel.clone();
        let mut noise = self.initial_noise;
        self.optimizer.reset();
        if let Some(seed) = self.seed {
            self.rng = ChaCha8Rng::seed_from_u64(seed);
        }

        let n_kernel = kernel.params().len();
        let mut x = x.to_owned();
        let mut y = y.to_owned();

        for epoch in 0..self.n_epochs {
            (x, y) = shuffle_rows(&x, &y, &mut self.rng);

            let mut total = 0.;
            let mut n_batches = 0u32;
            for (j, rows) in minibatches(x.nrows(), self.batch_size).enumerate() {
                let mini_x = slice_rows(&x, rows.clone());
                let mini_y = slice_rows(&y, rows);

                let (loss, grads) =
                    loss_and_gradient(&kernel, noise, self.train_noise, &mini_x, &mini_y)?;

                let mut trainable = kernel.params();
                if self.train_noise {
                    trainable.push(noise);
                }
                self.optimizer.step(&mut trainable, &grads);
                kernel.set_params(&trainable[..n_kernel]);
                if self.train_noise {
                    noise = trainable[n_kernel];
                }

                if self.verbose >= 2 {
                    debug!("epoch {epoch} batch {j}: loss = {loss:.6}, grads = {grads:?}");
                }
                total += loss;
                n_batches += 1;
            }

            if self.verbose >= 1 {
                info!(
                    "epoch {}/{}: mean loss = {:.6}, length scales = {:?}, noise = {:.6}",
                    epoch + 1,
                    self.n_epochs,
                    total / f64::from(n_batches),
                    kernel.length_scales(),
                    noise
                );
            }
        }

        let k_inv = linalg::inverse(&noisy_covariance(&kernel, noise, &x))?;

        self.kernel = kernel;
        self.noise = noise;
        self.fitted = Some(Fitted {
            k_inv,
            inputs: x,
            res: y,
        });

        if self.verbose >= 1 {
            info!("fit finished in {:?}", now.elapsed());
        }
        Ok(())
    }

    /// Predict the latent function mean and variance at the rows of `x` (M x D)
    ///
    /// With the cross covariance $\bm{C} = k(X_{*}, X)$ and $\bm{A} = \bm{C}\bm{K}^{-1}$
    ///
    /// $\mu = \bm{A} y$
    ///
    /// $\mathbb{V}_{i} = \text{amp}^{2} - \sum_{j} \bm{A}_{i, j}\bm{C}_{i, j}$
    ///
    /// Only the diagonal of the posterior covariance is computed, so each query point is
    /// treated independently. The variance is not clamped: a degenerate training set can
    /// give slightly negative values from rounding.
    ///
    /// Returns `(mean, variance)`, both M x 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the process has not been fitted, if `x` does not have D columns,
    /// or if the prediction is not finite
    pub fn predict(&self, x: &Mat<f64>) -> Result<(Mat<f64>, Mat<f64>)> {
        let fitted = self.fitted.as_ref().ok_or(ProcessError::NotFitted)?;
        self.check_design(x)?;

        let crosscorr = self.kernel.covariance(x, &fitted.inputs);
        let weights = &crosscorr * &fitted.k_inv;

        let mu = &weights * &fitted.res;
        let amp2 = self.kernel.amplitude().powi(2);
        let sigma = Mat::from_fn(x.nrows(), 1, |i, _| {
            amp2 - (0..crosscorr.ncols())
                .map(|j| weights[(i, j)] * crosscorr[(i, j)])
                .sum::<f64>()
        });

        check_finite(&mu, "predictive mean")?;
        check_finite(&sigma, "predictive variance")?;
        Ok((mu, sigma))
    }

    /// Calculate the log marginal likelihood of the fitted training set
    ///
    /// $\ln p(y | X, \theta) = -\frac{1}{2}(y^{\intercal}\bm{K}^{-1}y + \ln |\bm{K}| + N\ln 2\pi)$
    ///
    /// # Errors
    ///
    /// Returns an error if the process has not been fitted
    #[allow(clippy::cast_precision_loss)]
    pub fn log_marginal_likelihood(&self) -> Result<f64> {
        let fitted = self.fitted.as_ref().ok_or(ProcessError::NotFitted)?;
        let n = fitted.res.nrows();

        let yky = (fitted.res.transpose() * &fitted.k_inv * &fitted.res)[(0, 0)];
        let log_det =
            linalg::log_determinant(&noisy_covariance(&self.kernel, self.noise, &fitted.inputs))?;
        let ln2pi = (2. * PI).ln();

        Ok(-0.5 * (yky + log_det + (n as f64) * ln2pi))
    }

    /// Input dimension D
    #[must_use]
    pub fn n_dim(&self) -> usize {
        self.n_dim
    }

    /// The kernel with its current (fitted) parameters
    #[must_use]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Current length scales of the kernel
    #[must_use]
    pub fn length_scales(&self) -> Vec<f64> {
        self.kernel.length_scales()
    }

    /// Current noise $\sigma$
    #[must_use]
    pub fn noise(&self) -> f64 {
        self.noise
    }

    /// Whether [GaussProcs::fit] has succeeded at least once
    #[must_use]
    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }
}
