//! A minimal reverse mode tape over the few operations the GP loss is made of.
//!
//! The negative log marginal likelihood
//!
//! $\mathcal{L} = y^{\intercal}\bm{K}^{-1}y + \ln |\bm{K}|$
//!
//! is recorded as a list of nodes, each holding its forward value. [Tape::backward]
//! walks the list in reverse and applies each operation's adjoint rule, giving
//! $\bar{\bm{K}} = \partial \mathcal{L} / \partial \bm{K}$. The chain rule through the
//! kernel parameters is then a Frobenius product against $\partial \bm{K} / \partial \theta$.
//!
//! The rule for [Op::Determinant] is
//!
//! $\bar{A} = g \, |A| \, (A^{-1})^{\intercal}$
//!
//! for an upstream scalar gradient $g$. [Op::LogDeterminant] fuses $\ln |A|$ into one node:
//! its forward value comes from the Cholesky factor, so it neither under nor overflows
//! for large covariances, and its adjoint is the same rule with the upstream gradient
//! $g / |A|$, which is $g \, (A^{-1})^{\intercal}$.

use faer::Mat;

use crate::errors::{ProcessError, Result};
use crate::linalg;

/// Handle to a node on a [Tape]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeId(usize);

/// Forward value or adjoint of a node
#[derive(Clone, Debug)]
pub enum Value {
    /// a scalar
    Scalar(f64),
    /// a dense matrix
    Matrix(Mat<f64>),
}

impl Value {
    fn scalar(&self) -> f64 {
        match self {
            Value::Scalar(s) => *s,
            Value::Matrix(_) => unreachable!("scalar operation recorded on a matrix node"),
        }
    }

    fn matrix(&self) -> &Mat<f64> {
        match self {
            Value::Matrix(m) => m,
            Value::Scalar(_) => unreachable!("matrix operation recorded on a scalar node"),
        }
    }

    fn accumulate(slot: &mut Option<Value>, rhs: Value) {
        *slot = Some(match (slot.take(), rhs) {
            (None, rhs) => rhs,
            (Some(Value::Scalar(a)), Value::Scalar(b)) => Value::Scalar(a + b),
            (Some(Value::Matrix(a)), Value::Matrix(b)) => Value::Matrix(a + b),
            _ => unreachable!("adjoint shape differs from its node"),
        });
    }
}

/// Operations that can be recorded
#[derive(Clone, Debug)]
pub enum Op {
    /// an input
    Leaf,
    /// $A^{-1}$
    Inverse(NodeId),
    /// $|A|$
    Determinant(NodeId),
    /// $\ln a$
    Ln(NodeId),
    /// $\ln |A|$ of a positive definite matrix
    LogDeterminant(NodeId),
    /// $y^{\intercal} A y$ for a constant column $y$
    QuadForm(NodeId, Mat<f64>),
    /// $a + b$ for scalars
    Add(NodeId, NodeId),
}

#[derive(Clone, Debug)]
struct Node {
    op: Op,
    value: Value,
}

/// Recorded computation
#[derive(Clone, Debug, Default)]
pub struct Tape {
    nodes: Vec<Node>,
}

/// Adjoints of every node on a tape with respect to one output
#[derive(Debug)]
pub struct Grad {
    adjoints: Vec<Option<Value>>,
}

impl Grad {
    /// Adjoint of a matrix node, `None` if the output does not depend on it
    #[must_use]
    pub fn wrt(&self, node: NodeId) -> Option<&Mat<f64>> {
        match self.adjoints[node.0].as_ref() {
            Some(Value::Matrix(m)) => Some(m),
            _ => None,
        }
    }

    /// Adjoint of a scalar node
    #[must_use]
    pub fn wrt_scalar(&self, node: NodeId) -> Option<f64> {
        match self.adjoints[node.0].as_ref() {
            Some(Value::Scalar(s)) => Some(*s),
            _ => None,
        }
    }
}

/// Gradient of $|A|$ with respect to $A$ scaled by the upstream gradient `g`
///
/// # Errors
///
/// Inherits the failure of [linalg::inverse] when $A$ is singular
pub fn determinant_adjoint(g: f64, a: &Mat<f64>, det: f64) -> Result<Mat<f64>> {
    let a_inv = linalg::inverse(a)?;
    let scale = g * det;
    Ok(Mat::from_fn(a.nrows(), a.ncols(), |i, j| scale * a_inv[(j, i)]))
}

impl Tape {
    /// An empty tape
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, op: Op, value: Value) -> NodeId {
        self.nodes.push(Node { op, value });
        NodeId(self.nodes.len() - 1)
    }

    /// Forward value of a node
    #[must_use]
    pub fn value(&self, node: NodeId) -> &Value {
        &self.nodes[node.0].value
    }

    /// Forward value of a scalar node
    #[must_use]
    pub fn scalar(&self, node: NodeId) -> f64 {
        self.nodes[node.0].value.scalar()
    }

    /// Record a matrix input
    pub fn leaf(&mut self, a: Mat<f64>) -> NodeId {
        self.push(Op::Leaf, Value::Matrix(a))
    }

    /// Record $A^{-1}$
    ///
    /// # Errors
    ///
    /// Returns an error if $A$ is not positive definite
    pub fn inverse(&mut self, a: NodeId) -> Result<NodeId> {
        let inv = linalg::inverse(self.nodes[a.0].value.matrix())?;
        Ok(self.push(Op::Inverse(a), Value::Matrix(inv)))
    }

    /// Record $|A|$
    ///
    /// # Errors
    ///
    /// Returns an error if the determinant is non finite
    pub fn determinant(&mut self, a: NodeId) -> Result<NodeId> {
        let det = linalg::determinant(self.nodes[a.0].value.matrix())?;
        Ok(self.push(Op::Determinant(a), Value::Scalar(det)))
    }

    /// Record $\ln |A|$
    ///
    /// # Errors
    ///
    /// Returns an error if $A$ is not positive definite
    pub fn log_determinant(&mut self, a: NodeId) -> Result<NodeId> {
        let log_det = linalg::log_determinant(self.nodes[a.0].value.matrix())?;
        Ok(self.push(Op::LogDeterminant(a), Value::Scalar(log_det)))
    }

    /// Record $\ln a$
    ///
    /// # Errors
    ///
    /// Returns an error if $a \leq 0$
    pub fn ln(&mut self, a: NodeId) -> Result<NodeId> {
        let x = self.scalar(a);
        if x > 0. && x.is_finite() {
            Ok(self.push(Op::Ln(a), Value::Scalar(x.ln())))
        } else {
            Err(ProcessError::NonFinite("logarithm of determinant"))
        }
    }

    /// Record $y^{\intercal} A y$
    pub fn quad_form(&mut self, a: NodeId, y: &Mat<f64>) -> NodeId {
        let a_val = self.nodes[a.0].value.matrix();
        let q = (y.transpose() * a_val * y)[(0, 0)];
        self.push(Op::QuadForm(a, y.clone()), Value::Scalar(q))
    }

    /// Record $a + b$
    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let sum = self.scalar(a) + self.scalar(b);
        self.push(Op::Add(a, b), Value::Scalar(sum))
    }

    /// Propagate adjoints from a scalar `output` back to every node it depends on
    ///
    /// # Errors
    ///
    /// Returns an error if an adjoint rule needs an inverse that does not exist
    pub fn backward(&self, output: NodeId) -> Result<Grad> {
        let mut adjoints: Vec<Option<Value>> = vec![None; self.nodes.len()];
        adjoints[output.0] = Some(Value::Scalar(1.));

        for idx in (0..=output.0).rev() {
            let Some(adjoint) = adjoints[idx].clone() else {
                continue;
            };
            let node = &self.nodes[idx];
            match &node.op {
                Op::Leaf => {}
                Op::Add(a, b) => {
                    let g = adjoint.scalar();
                    Value::accumulate(&mut adjoints[a.0], Value::Scalar(g));
                    Value::accumulate(&mut adjoints[b.0], Value::Scalar(g));
                }
                Op::Ln(a) => {
                    let g = adjoint.scalar() / self.scalar(*a);
                    Value::accumulate(&mut adjoints[a.0], Value::Scalar(g));
                }
                Op::QuadForm(a, y) => {
                    let g = adjoint.scalar();
                    let n = y.nrows();
                    let outer = Mat::from_fn(n, n, |i, j| g * y[(i, 0)] * y[(j, 0)]);
                    Value::accumulate(&mut adjoints[a.0], Value::Matrix(outer));
                }
                Op::Inverse(a) => {
                    // B = A^-1, dA = -B^T dB B^T
                    let b_t = node.value.matrix().transpose();
                    let prod = b_t * adjoint.matrix() * b_t;
                    let a_bar = Mat::from_fn(prod.nrows(), prod.ncols(), |i, j| -prod[(i, j)]);
                    Value::accumulate(&mut adjoints[a.0], Value::Matrix(a_bar));
                }
                Op::Determinant(a) => {
                    let a_bar = determinant_adjoint(
                        adjoint.scalar(),
                        self.nodes[a.0].value.matrix(),
                        node.value.scalar(),
                    )?;
                    Value::accumulate(&mut adjoints[a.0], Value::Matrix(a_bar));
                }
                Op::LogDeterminant(a) => {
                    // upstream g / |A| times |A|
                    let a_bar =
                        determinant_adjoint(adjoint.scalar(), self.nodes[a.0].value.matrix(), 1.)?;
                    Value::accumulate(&mut adjoints[a.0], Value::Matrix(a_bar));
                }
            }
        }

        Ok(Grad { adjoints })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use faer::mat;

    fn spd() -> Mat<f64> {
        mat![[2.0, 0.3, 0.1], [0.3, 1.5, -0.2], [0.1, -0.2, 1.2]]
    }

    fn nll(tape: &mut Tape, k: NodeId, y: &Mat<f64>) -> NodeId {
        let k_inv = tape.inverse(k).unwrap();
        let fit = tape.quad_form(k_inv, y);
        let det = tape.determinant(k).unwrap();
        let log_det = tape.ln(det).unwrap();
        tape.add(fit, log_det)
    }

    #[test]
    fn determinant_rule_matches_finite_differences() {
        let a = spd();
        let det = linalg::determinant(&a).unwrap();
        let analytic = determinant_adjoint(1., &a, det).unwrap();
        let eps = 1e-6;
        for i in 0..3 {
            for j in 0..3 {
                let mut perturbed = a.clone();
                perturbed[(i, j)] += eps;
                let fd = (linalg::determinant(&perturbed).unwrap() - det) / eps;
                assert_approx_eq!(fd, analytic[(i, j)], 1e-5);
            }
        }
    }

    #[test]
    fn determinant_rule_on_tape() {
        let a = spd();
        let mut tape = Tape::new();
        let a_node = tape.leaf(a.clone());
        let det = tape.determinant(a_node).unwrap();
        let grad = tape.backward(det).unwrap();
        let expected = determinant_adjoint(1., &a, tape.scalar(det)).unwrap();
        let got = grad.wrt(a_node).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_approx_eq!(got[(i, j)], expected[(i, j)], 1e-12);
            }
        }
    }

    #[test]
    fn singular_determinant_rule_propagates() {
        let a = mat![[1., 1.], [1., 1.]];
        assert_eq!(
            determinant_adjoint(1., &a, 0.).unwrap_err(),
            ProcessError::CholeskyFailure
        );
    }

    #[test]
    fn ln_of_non_positive_fails() {
        let mut tape = Tape::new();
        let a = tape.leaf(mat![[1., 2.], [2., 1.]]);
        let det = tape.determinant(a).unwrap();
        assert!(tape.scalar(det) < 0.);
        assert_eq!(
            tape.ln(det).unwrap_err(),
            ProcessError::NonFinite("logarithm of determinant")
        );
    }

    // dL/dK of the marginal likelihood is K^-1 - K^-1 y y^T K^-1 for symmetric K,
    // checked against perturbing a symmetric pair of entries
    #[test]
    fn loss_gradient_matches_finite_differences() {
        let k = spd();
        let y = mat![[0.5], [-1.0], [0.25]];

        let mut tape = Tape::new();
        let k_node = tape.leaf(k.clone());
        let loss = nll(&mut tape, k_node, &y);
        let base = tape.scalar(loss);
        let grad = tape.backward(loss).unwrap();
        let k_bar = grad.wrt(k_node).unwrap();

        let eps = 1e-6;
        for i in 0..3 {
            for j in 0..3 {
                let mut perturbed = k.clone();
                perturbed[(i, j)] += eps;
                if i != j {
                    perturbed[(j, i)] += eps;
                }
                let mut fd_tape = Tape::new();
                let node = fd_tape.leaf(perturbed);
                let fd_loss = nll(&mut fd_tape, node, &y);
                let fd = (fd_tape.scalar(fd_loss) - base) / eps;
                let analytic = if i == j {
                    k_bar[(i, i)]
                } else {
                    k_bar[(i, j)] + k_bar[(j, i)]
                };
                assert_approx_eq!(fd, analytic, 1e-4);
            }
        }
    }

    #[test]
    fn log_determinant_node_matches_ln_of_determinant() {
        let a = spd();
        let mut tape = Tape::new();
        let a_node = tape.leaf(a.clone());
        let det = tape.determinant(a_node).unwrap();
        let ln_det = tape.ln(det).unwrap();
        let fused = tape.log_determinant(a_node).unwrap();
        assert_approx_eq!(tape.scalar(fused), tape.scalar(ln_det), 1e-12);

        let unfused = tape.backward(ln_det).unwrap();
        let grad = tape.backward(fused).unwrap();
        let (expected, got) = (unfused.wrt(a_node).unwrap(), grad.wrt(a_node).unwrap());
        for i in 0..3 {
            for j in 0..3 {
                assert_approx_eq!(got[(i, j)], expected[(i, j)], 1e-12);
            }
        }
    }

    #[test]
    fn log_determinant_survives_underflow() {
        // |0.01 I| = 1e-400 is below the smallest f64
        let n = 200;
        let a = Mat::from_fn(n, n, |i, j| if i == j { 0.01 } else { 0. });
        assert_eq!(linalg::determinant(&a).unwrap(), 0.);

        let mut tape = Tape::new();
        let a_node = tape.leaf(a);
        let log_det = tape.log_determinant(a_node).unwrap();
        assert_approx_eq!(tape.scalar(log_det), 200. * 0.01_f64.ln(), 1e-9);
        let grad = tape.backward(log_det).unwrap();
        let a_bar = grad.wrt(a_node).unwrap();
        assert_approx_eq!(a_bar[(0, 0)], 100., 1e-9);
        assert_approx_eq!(a_bar[(0, 1)], 0., 1e-12);
    }

    #[test]
    fn log_determinant_of_indefinite_fails() {
        let mut tape = Tape::new();
        let a = tape.leaf(mat![[1., 2.], [2., 1.]]);
        assert_eq!(
            tape.log_determinant(a).unwrap_err(),
            ProcessError::CholeskyFailure
        );
    }

    #[test]
    fn unused_nodes_have_no_adjoint() {
        let mut tape = Tape::new();
        let a = tape.leaf(spd());
        let b = tape.leaf(spd());
        let det = tape.determinant(a).unwrap();
        let grad = tape.backward(det).unwrap();
        assert!(grad.wrt(a).is_some());
        assert!(grad.wrt(b).is_none());
        assert_approx_eq!(grad.wrt_scalar(det).unwrap(), 1.);
    }
}
