//! This library implements Gaussian process (GP) regression whose kernel hyperparameters
//! are learnt by minibatch gradient descent.
//!
//! GP regression treats the unknown function values at all training points as a
//! Gaussian Process fully characterised by some arbitrary covariance function or
//! kernel between points $x_{1}$ and $x_{2}$.
//!
//! The output is modelled as a stochastic process:
//!
//! $ Y(x) = Z(x) + \epsilon$
//!
//! where $Z(x)$ is a zero mean realization of the stochastic process and $\epsilon \sim \mathcal{N}(0, \sigma^{2})$
//!
//! # Implementation
//!
//! * Based of [Faer](https://github.com/sarah-ek/faer-rs) to provide linear algebra subroutine
//! * GP mean currently must be 0
//! * Kernels are pluggable through the [Kernel] trait, squared exponential and Matérn 5/2 are provided
//! * Length scales (and optionally noise) are fitted by minimising the negative log marginal likelihood
//!   $y^{\intercal}\bm{K}^{-1}y + \ln |\bm{K}|$ over shuffled minibatches with any [Optimizer]
//! * Gradients through $\bm{K}^{-1}$ and $|\bm{K}|$ come from a small reverse mode tape ([autodiff])
//! * The amplitude of the kernel is not trained
//! * Dimensionality issue : scales as $O(n^{3})$ in size of training data
//!
//! # Examples
//!
//! ```
//! use faer::Mat;
//! use gauss_sgd::{GpParams, SquaredExponential};
//!
//! let x = Mat::from_fn(40, 1, |i, _| 1. + i as f64 * 0.225);
//! let y = Mat::from_fn(40, 1, |i, _| x[(i, 0)].sin());
//!
//! let kernel = SquaredExponential::new(vec![1.], 1.).unwrap();
//! let mut process = GpParams::new(1, kernel, 10, 10)
//!     .noise(0.1)
//!     .seed(0)
//!     .build()
//!     .unwrap();
//! process.fit(&x, &y).unwrap();
//!
//! let query = Mat::from_fn(3, 1, |i, _| 2. + i as f64);
//! let (mean, variance) = process.predict(&query).unwrap();
//! assert_eq!((mean.nrows(), variance.nrows()), (3, 3));
//! ```
//!
//! # Reference
//!
//! Gaussian Processes for Machine Learning, C. E. Rasmussen & C. K. I. Williams, 2006
//!
//! Lafage, R., (2022). egobox, a Rust toolbox for efficient global optimization.
//! Journal of Open Source Software, 7(78), 4737,
//! <https://doi.org/10.21105/joss.04737>

#![warn(
    clippy::pedantic,
    clippy::suspicious,
    clippy::perf,
    clippy::complexity,
    clippy::style
)]
#![forbid(unsafe_code)]
#![allow(clippy::doc_markdown)]

pub mod autodiff;
mod errors;
mod kernel;
pub mod linalg;
mod optimizer;
mod params;
mod process;

pub use errors::{ProcessError, Result};
pub use kernel::{Kernel, Matern52, SquaredExponential};
pub use optimizer::{Adam, GradientDescent, Momentum, Optimizer};
pub use params::GpParams;
pub use process::GaussProcs;
