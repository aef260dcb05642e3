use super::autograd::Parameter;
use crate::result::Result;
use anyhow::ensure;
use ndarray::ArrayD;

/// Optimizer builders.
pub mod builder {
    use super::Sgd;

    /// Builder for creating a [`Sgd`].
    #[derive(Default, Clone, Copy, Debug)]
    pub struct SgdBuilder {
        pub(super) momentum: Option<f32>,
        pub(super) dampening: Option<f32>,
        pub(super) weight_decay: Option<f32>,
        pub(super) nesterov: bool,
    }

    impl SgdBuilder {
        /// Momentum. Default is 0.
        ///
        /// If `momentum` is greater than 0, a velocity tensor is kept per parameter.
        pub fn momentum(self, momentum: f32) -> Self {
            Self {
                momentum: Some(momentum),
                ..self
            }
        }
        /// Dampening applied to the gradient term of the velocity. Default is 0.
        pub fn dampening(self, dampening: f32) -> Self {
            Self {
                dampening: Some(dampening),
                ..self
            }
        }
        /// L2 weight decay. Default is 0.
        pub fn weight_decay(self, weight_decay: f32) -> Self {
            Self {
                weight_decay: Some(weight_decay),
                ..self
            }
        }
        /// Nesterov momentum. Default is false.
        pub fn nesterov(self, nesterov: bool) -> Self {
            Self { nesterov, ..self }
        }
        /// Builds the optimizer.
        pub fn build(self) -> Sgd {
            let Self {
                momentum,
                dampening,
                weight_decay,
                nesterov,
            } = self;
            Sgd {
                momentum: momentum.unwrap_or(0.),
                dampening: dampening.unwrap_or(0.),
                weight_decay: weight_decay.unwrap_or(0.),
                nesterov,
                velocities: Vec::new(),
            }
        }
    }
}
use builder::SgdBuilder;

/// Optimizer.
pub trait Optimizer {
    /// Performs the optimization, updating `parameters` with `learning_rate`.
    ///
    /// Takes each parameter's gradient; parameters without a gradient are skipped.
    ///
    /// **Errors**
    ///
    /// Returns an error if the update could not be performed. Some parameters may have
    /// been updated even when returning an error.
    fn update(&mut self, learning_rate: f32, parameters: &mut [&mut Parameter]) -> Result<()>;
}

/// Stochastic Gradient Descent.
///
/// With momentum m, dampening d, and weight decay w:
/// ```text
/// g = grad + w * value
/// v = m * v + (1 - d) * g
/// value -= lr * (g + m * v)    // nesterov
/// value -= lr * v              // otherwise
/// ```
///
/// Velocities are kept per parameter, matched by position, and are lazily
/// (re)initialized when a parameter first appears or changes shape.
#[derive(Default, Debug)]
pub struct Sgd {
    momentum: f32,
    dampening: f32,
    weight_decay: f32,
    nesterov: bool,
    velocities: Vec<ArrayD<f32>>,
}

impl Sgd {
    /// A [`Sgd`] builder.
    pub fn builder() -> SgdBuilder {
        SgdBuilder::default()
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, learning_rate: f32, parameters: &mut [&mut Parameter]) -> Result<()> {
        ensure!(
            (0. ..=1.).contains(&learning_rate),
            "Learning rate {} is not between 0 and 1!",
            learning_rate,
        );
        for (i, parameter) in parameters.iter_mut().enumerate() {
            let grad = match parameter.take_grad() {
                Some(grad) => grad,
                None => continue,
            };
            let mut grad = grad;
            if self.weight_decay > 0. {
                grad.scaled_add(self.weight_decay, &parameter.value().view());
            }
            if self.momentum > 0. {
                let (momentum, dampening) = (self.momentum, self.dampening);
                if self.velocities.len() <= i {
                    self.velocities
                        .resize_with(i + 1, || ArrayD::zeros(grad.raw_dim()));
                }
                let velocity = &mut self.velocities[i];
                if velocity.raw_dim() != grad.raw_dim() {
                    *velocity = ArrayD::zeros(grad.raw_dim());
                }
                velocity.zip_mut_with(&grad, |v, &g| {
                    *v = momentum * *v + (1. - dampening) * g;
                });
                if self.nesterov {
                    grad.scaled_add(self.momentum, velocity);
                    parameter.view_mut().scaled_add(-learning_rate, &grad);
                } else {
                    parameter.view_mut().scaled_add(-learning_rate, velocity);
                }
            } else {
                parameter.view_mut().scaled_add(-learning_rate, &grad);
            }
        }
        Ok(())
    }
}
