//! Activation plugins fused into layer kernels.
//!
//! An activation contributes a WGSL function `ForwardActivate(x: Real) -> Real`
//! that is spliced into the owning layer's kernel source, plus host versions
//! of the forward map and its derivative. The derivative is expressed in
//! terms of the activated *output*, which is what the backward pass keeps.

use crate::real::{Real, real};
use core::fmt::Debug;

/// A fusable element-wise activation.
pub trait Activation: Debug + Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// WGSL definition of `fn ForwardActivate(x: Real) -> Real`.
    fn kernel_source(&self) -> String;

    /// Host forward map.
    fn forward(&self, x: Real) -> Real;

    /// Gradient with respect to the input given upstream `gy` and output `y`.
    fn backward(&self, gy: Real, y: Real) -> Real;
}

/// `max(x, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl Activation for Relu {
    fn name(&self) -> &str {
        "ReLU"
    }

    fn kernel_source(&self) -> String {
        "fn ForwardActivate(x: Real) -> Real {\n    return max(x, Real(0.0));\n}\n".to_string()
    }

    fn forward(&self, x: Real) -> Real {
        x.max(0.0)
    }

    fn backward(&self, gy: Real, y: Real) -> Real {
        if y > 0.0 { gy } else { 0.0 }
    }
}

/// `1 / (1 + e^-x)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sigmoid;

impl Activation for Sigmoid {
    fn name(&self) -> &str {
        "Sigmoid"
    }

    fn kernel_source(&self) -> String {
        "fn ForwardActivate(x: Real) -> Real {\n    return Real(1.0) / (Real(1.0) + exp(-x));\n}\n"
            .to_string()
    }

    fn forward(&self, x: Real) -> Real {
        1.0 / (1.0 + (-x).exp())
    }

    fn backward(&self, gy: Real, y: Real) -> Real {
        gy * y * (1.0 - y)
    }
}

/// Hyperbolic tangent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

impl Activation for Tanh {
    fn name(&self) -> &str {
        "Tanh"
    }

    fn kernel_source(&self) -> String {
        "fn ForwardActivate(x: Real) -> Real {\n    return tanh(x);\n}\n".to_string()
    }

    fn forward(&self, x: Real) -> Real {
        x.tanh()
    }

    fn backward(&self, gy: Real, y: Real) -> Real {
        gy * (1.0 - y * y)
    }
}

/// Exponential linear unit: `x` for `x >= 0`, `alpha * (e^x - 1)` below.
#[derive(Debug, Clone, Copy)]
pub struct Elu {
    alpha: Real,
}

impl Elu {
    /// ELU with the given negative-side scale.
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self { alpha: real(alpha) }
    }

    /// Negative-side scale.
    #[must_use]
    pub fn alpha(&self) -> Real {
        self.alpha
    }
}

impl Default for Elu {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Activation for Elu {
    fn name(&self) -> &str {
        "ELU"
    }

    fn kernel_source(&self) -> String {
        format!(
            "fn ForwardActivate(x: Real) -> Real {{\n    if (x >= Real(0.0)) {{\n        return x;\n    }}\n    return Real({:?}) * (exp(x) - Real(1.0));\n}}\n",
            self.alpha
        )
    }

    fn forward(&self, x: Real) -> Real {
        if x >= 0.0 {
            x
        } else {
            self.alpha * (x.exp() - 1.0)
        }
    }

    fn backward(&self, gy: Real, y: Real) -> Real {
        // below zero, d/dx alpha*(e^x - 1) = y + alpha
        if y >= 0.0 { gy } else { gy * (y + self.alpha) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_clips_and_gates() {
        assert_eq!(Relu.forward(-2.0), 0.0);
        assert_eq!(Relu.forward(3.0), 3.0);
        assert_eq!(Relu.backward(5.0, 0.0), 0.0);
        assert_eq!(Relu.backward(5.0, 1.0), 5.0);
    }

    #[test]
    fn elu_derivative_matches_finite_difference() {
        let elu = Elu::new(1.0);
        let x: Real = -0.7;
        let h: Real = 1e-3;
        let numeric = (elu.forward(x + h) - elu.forward(x - h)) / (2.0 * h);
        let analytic = elu.backward(1.0, elu.forward(x));
        assert!((numeric - analytic).abs() < 1e-3);
    }

    #[test]
    fn elu_passes_gradient_through_at_zero() {
        let elu = Elu::new(0.5);
        assert_eq!(elu.forward(0.0), 0.0);
        assert_eq!(elu.backward(2.0, elu.forward(0.0)), 2.0);
        assert_eq!(elu.backward(2.0, 1.5), 2.0);
    }

    #[test]
    fn sigmoid_derivative_uses_output() {
        let y = Sigmoid.forward(0.0);
        assert!((y - 0.5).abs() < 1e-6);
        assert!((Sigmoid.backward(1.0, y) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn kernel_sources_define_forward_activate() {
        let all: [&dyn Activation; 4] = [&Relu, &Sigmoid, &Tanh, &Elu::new(0.5)];
        for a in all {
            assert!(a.kernel_source().contains("fn ForwardActivate(x: Real) -> Real"));
        }
        assert!(Elu::new(0.5).kernel_source().contains("Real(0.5)"));
    }
}
