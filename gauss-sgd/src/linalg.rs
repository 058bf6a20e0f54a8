//! Inversion and determinants of covariance matrices.
//!
//! All routines expect a square, symmetric, positive definite input, which is what
//! a covariance matrix with a noise term on its diagonal is. Nothing here tries to
//! repair a bad matrix: a failed factorisation or a non-finite result is returned as
//! a [`ProcessError`] so that a fit can never silently carry NaNs forward.

use dyn_stack::{GlobalPodBuffer, PodStack};
use faer::{Faer, Mat};
use faer_core::Parallelism;

use crate::errors::{ProcessError, Result};

/// find x, the solution to AX=B where a is positive definite
/// takes the lower cholesky factor of A as an input
///
/// # Errors
///
/// Returns an error if the scratch space for the solve cannot be sized
pub fn cholesky_solve(l: &Mat<f64>, b: &Mat<f64>) -> Result<Mat<f64>> {
    let mut b = b.clone();
    let i = l.nrows();
    let j = b.ncols();

    let req = faer_cholesky::llt::solve::solve_in_place_req::<f64>(i, j, Parallelism::Rayon(0))
        .map_err(|_| ProcessError::WorkspaceOverflow)?;

    faer_cholesky::llt::solve::solve_in_place_with_conj(
        l.as_ref(),
        faer_core::Conj::No,
        b.as_mut(),
        Parallelism::Rayon(0),
        PodStack::new(&mut GlobalPodBuffer::new(req)),
    );

    Ok(b)
}

/// The $n \times n$ identity
#[must_use]
pub fn identity(n: usize) -> Mat<f64> {
    Mat::from_fn(n, n, |i, j| if i == j { 1. } else { 0. })
}

/// Sum of the diagonal
#[must_use]
pub fn trace(a: &Mat<f64>) -> f64 {
    (0..a.nrows().min(a.ncols())).map(|i| a[(i, i)]).sum()
}

/// Frobenius inner product $\sum_{i, j} A_{i, j} B_{i, j}$
#[must_use]
pub fn frobenius(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    debug_assert_eq!((a.nrows(), a.ncols()), (b.nrows(), b.ncols()));
    let mut acc = 0.;
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            acc += a[(i, j)] * b[(i, j)];
        }
    }
    acc
}

fn check_square(a: &Mat<f64>) -> Result<()> {
    if a.nrows() == a.ncols() {
        Ok(())
    } else {
        Err(ProcessError::MismatchedInputs(format!(
            "expected a square matrix, found {}x{}",
            a.nrows(),
            a.ncols()
        )))
    }
}

pub(crate) fn check_finite(a: &Mat<f64>, what: &'static str) -> Result<()> {
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            if !a[(i, j)].is_finite() {
                return Err(ProcessError::NonFinite(what));
            }
        }
    }
    Ok(())
}

/// Lower cholesky factor $L$ with $A = LL^{\intercal}$
///
/// # Errors
///
/// Returns an error if the matrix is non square or non Cholesky decomposable
pub fn cholesky_factor(a: &Mat<f64>) -> Result<Mat<f64>> {
    check_square(a)?;
    check_finite(a, "covariance matrix")?;
    Ok(a.cholesky(faer::Side::Lower)?.compute_l())
}

/// Inverse of a symmetric positive definite matrix
///
/// The matrix is decomposed as $A = LL^{\intercal}$ and the identity is solved against the
/// factor, which is more stable than a general purpose inversion.
///
/// # Errors
///
/// Returns an error if the matrix is non Cholesky decomposable or the inverse is non finite
///
/// # Examples
///
/// ```
/// use faer::mat;
/// use gauss_sgd::linalg::inverse;
///
/// let a = mat![[4., 12.], [12., 37.]];
/// let a_inv = inverse(&a).unwrap();
/// assert!((a_inv[(0, 0)] - 37. / 4.).abs() < 1e-9);
/// ```
pub fn inverse(a: &Mat<f64>) -> Result<Mat<f64>> {
    let l = cholesky_factor(a)?;
    let inv = cholesky_solve(&l, &identity(a.nrows()))?;
    check_finite(&inv, "matrix inverse")?;
    Ok(inv)
}

/// Determinant of a square matrix, from faer's LU decomposition
///
/// Works for any square matrix, symmetric or not. Underflows to zero or overflows for
/// large covariances, see [log_determinant].
///
/// # Errors
///
/// Returns an error if the matrix is non square or the determinant is non finite
pub fn determinant(a: &Mat<f64>) -> Result<f64> {
    check_square(a)?;
    let det = a.determinant();
    if det.is_finite() {
        Ok(det)
    } else {
        Err(ProcessError::NonFinite("determinant"))
    }
}

/// $\ln |A|$ of a positive definite matrix, $2 \sum_{i} \ln L_{i, i}$
///
/// Does not under or overflow for large matrices the way [determinant] can.
///
/// # Errors
///
/// Returns an error if the matrix is non Cholesky decomposable
pub fn log_determinant(a: &Mat<f64>) -> Result<f64> {
    let l = cholesky_factor(a)?;
    let log_det = 2. * (0..l.nrows()).map(|i| l[(i, i)].ln()).sum::<f64>();
    if log_det.is_finite() {
        Ok(log_det)
    } else {
        Err(ProcessError::NonFinite("log determinant"))
    }
}
