//! Gradient descent update rules.
//!
//! The process hands an [Optimizer] the current trainable parameters together with the
//! gradient of the minibatch loss and lets it choose the step. Any state the rule keeps
//! (velocities, moment estimates) is cleared by [Optimizer::reset] at the start of every fit.

use std::fmt::Debug;

/// A gradient based update rule over a flat parameter vector
pub trait Optimizer: Debug {
    /// Move `params` one step against `grads`, both have the same length
    fn step(&mut self, params: &mut [f64], grads: &[f64]);

    /// Forget any accumulated state
    fn reset(&mut self) {}
}

#[derive(Clone, Debug, PartialEq)]
/// Plain gradient descent, $\theta \leftarrow \theta - \eta \nabla$
pub struct GradientDescent {
    learning_rate: f64,
}

impl GradientDescent {
    /// Creates the rule with learning rate $\eta$
    #[must_use]
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Default for GradientDescent {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl Optimizer for GradientDescent {
    fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        for (p, g) in params.iter_mut().zip(grads) {
            *p -= self.learning_rate * g;
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
/// Gradient descent with (heavy ball) momentum
///
/// $v \leftarrow \mu v + \nabla, \quad \theta \leftarrow \theta - \eta v$
pub struct Momentum {
    learning_rate: f64,
    momentum: f64,
    velocity: Vec<f64>,
}

impl Momentum {
    /// Creates the rule with learning rate $\eta$ and momentum $\mu$
    #[must_use]
    pub fn new(learning_rate: f64, momentum: f64) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for Momentum {
    fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        if self.velocity.len() != params.len() {
            self.velocity = vec![0.; params.len()];
        }
        for ((p, g), v) in params.iter_mut().zip(grads).zip(self.velocity.iter_mut()) {
            *v = self.momentum * *v + g;
            *p -= self.learning_rate * *v;
        }
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }
}

#[derive(Clone, Debug, PartialEq)]
/// Adam, with bias corrected first and second moment estimates
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: i32,
    m: Vec<f64>,
    v: Vec<f64>,
}

impl Adam {
    /// Creates the rule with learning rate $\eta$ and the usual $\beta_{1} = 0.9$, $\beta_{2} = 0.999$
    #[must_use]
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Override the moment decay rates
    #[must_use]
    pub fn betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        if self.m.len() != params.len() {
            self.m = vec![0.; params.len()];
            self.v = vec![0.; params.len()];
            self.t = 0;
        }
        self.t = self.t.saturating_add(1);
        let bias1 = 1. - self.beta1.powi(self.t);
        let bias2 = 1. - self.beta2.powi(self.t);

        for (i, (p, g)) in params.iter_mut().zip(grads).enumerate() {
            self.m[i] = self.beta1 * self.m[i] + (1. - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1. - self.beta2) * g * g;
            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;
            *p -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
        }
    }

    fn reset(&mut self) {
        self.t = 0;
        self.m.clear();
        self.v.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    // f(x) = (x0 - 3)^2 + 2 (x1 + 1)^2
    fn grad(x: &[f64]) -> Vec<f64> {
        vec![2. * (x[0] - 3.), 4. * (x[1] + 1.)]
    }

    fn minimise<O: Optimizer>(opt: &mut O, steps: usize) -> Vec<f64> {
        let mut x = vec![0., 0.];
        for _ in 0..steps {
            let g = grad(&x);
            opt.step(&mut x, &g);
        }
        x
    }

    #[test]
    fn gradient_descent_step() {
        let mut opt = GradientDescent::new(0.5);
        let mut x = vec![1., 2.];
        opt.step(&mut x, &[2., -4.]);
        assert_approx_eq!(x[0], 0.);
        assert_approx_eq!(x[1], 4.);
    }

    #[test]
    fn gradient_descent_converges() {
        let x = minimise(&mut GradientDescent::new(0.1), 200);
        assert_approx_eq!(x[0], 3., 1e-6);
        assert_approx_eq!(x[1], -1., 1e-6);
    }

    #[test]
    fn momentum_converges() {
        let x = minimise(&mut Momentum::new(0.05, 0.9), 500);
        assert_approx_eq!(x[0], 3., 1e-4);
        assert_approx_eq!(x[1], -1., 1e-4);
    }

    #[test]
    fn adam_converges() {
        let x = minimise(&mut Adam::new(0.05), 2000);
        assert_approx_eq!(x[0], 3., 1e-2);
        assert_approx_eq!(x[1], -1., 1e-2);
    }

    #[test]
    fn reset_clears_state() {
        let mut opt = Momentum::new(0.1, 0.9);
        let first = minimise(&mut opt, 3);
        opt.reset();
        let second = minimise(&mut opt, 3);
        assert_eq!(first, second);

        let mut opt = Adam::new(0.1);
        let first = minimise(&mut opt, 3);
        opt.reset();
        let second = minimise(&mut opt, 3);
        assert_eq!(first, second);
    }
}
