use super::vae::VaeOutput;
use crate::neural_network::{autograd::Variable, functional::sigmoid_scalar};
use crate::result::Result;
use anyhow::ensure;
use ndarray::{arr0, ArrayD, ArrayViewD, Zip};
use std::rc::Rc;

/// A loss criterion.
pub trait Criterion<X, T> {
    type Output;
    /// Evaluates the criterion for `input` against `target`.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

/// The evaluated ELBO.
///
/// `loss` is a 0 dimensional [`Variable`]; calling
/// [`.backward()`](Variable::backward()) on it accumulates gradients into the
/// reconstruction logits, μ, and logσ².
#[derive(Debug)]
pub struct ElboLoss {
    /// The total loss, reconstruction + β·KL, mean over the batch.
    pub loss: Variable,
    /// The reconstruction component, mean over the batch.
    pub reconstruction: f32,
    /// The KL component (unweighted), mean over the batch.
    pub kl: f32,
}

/// Negative evidence lower bound.
///
/// ```text
/// loss = bce(σ(logits), target) + β · KL(N(μ, σ²) ‖ N(0, I))
/// ```
///
/// The reconstruction term is binary cross-entropy summed over pixels, computed from
/// logits so the sigmoid never saturates the gradient. Both terms are means over the
/// batch. β = 1 recovers the standard ELBO.
#[derive(Clone, Copy, Debug)]
pub struct Elbo {
    beta: f32,
}

impl Default for Elbo {
    fn default() -> Self {
        Self { beta: 1. }
    }
}

impl Elbo {
    /// Creates an [`Elbo`] with KL weight `beta`.
    pub fn new(beta: f32) -> Self {
        Self { beta }
    }
    /// The KL weight.
    pub fn beta(&self) -> f32 {
        self.beta
    }
}

// bce(l, t) = max(l, 0) - l·t + ln(1 + exp(-|l|)), elementwise from logits.
fn bce_with_logits(logits: &ArrayD<f32>, target: &ArrayViewD<f32>) -> f32 {
    Zip::from(logits)
        .and(target)
        .fold(0., |acc, &l, &t| {
            acc + l.max(0.) - l * t + (-l.abs()).exp().ln_1p()
        })
}

// KL(N(μ, σ²) ‖ N(0, I)) summed over the latent dims.
fn kl_divergence(mu: &ArrayD<f32>, logvar: &ArrayD<f32>) -> f32 {
    Zip::from(mu)
        .and(logvar)
        .fold(0., |acc, &m, &lv| acc - 0.5 * (1. + lv - m * m - lv.exp()))
}

impl<'a> Criterion<&'a VaeOutput, ArrayViewD<'a, f32>> for Elbo {
    type Output = ElboLoss;
    fn eval(&self, input: &'a VaeOutput, target: ArrayViewD<'a, f32>) -> Result<Self::Output> {
        let logits = &input.reconstruction;
        let mu = &input.mu;
        let logvar = &input.logvar;
        ensure!(
            logits.shape() == target.shape(),
            "Reconstruction {:?} does not match target {:?}!",
            logits.shape(),
            target.shape(),
        );
        ensure!(
            mu.shape() == logvar.shape(),
            "Mu {:?} does not match logvar {:?}!",
            mu.shape(),
            logvar.shape(),
        );
        let batch_size = logits.shape()[0];
        ensure!(batch_size > 0, "Empty batch!");
        let scale = 1. / batch_size as f32;
        let reconstruction = bce_with_logits(logits.value(), &target) * scale;
        let kl = kl_divergence(mu.value(), logvar.value()) * scale;
        let beta = self.beta;
        let loss_value = arr0(reconstruction + beta * kl);
        let req_grad = logits.req_grad() || mu.req_grad() || logvar.req_grad();
        let loss = Variable::new(logits.tape(), loss_value, req_grad);
        if let Some(loss_grad) = loss.grad() {
            let loss_grad = Rc::clone(loss_grad);
            let logits_value = Rc::clone(logits.value());
            let logits_grad = logits.grad().map(Rc::clone);
            let mu_value = Rc::clone(mu.value());
            let mu_grad = mu.grad().map(Rc::clone);
            let logvar_value = Rc::clone(logvar.value());
            let logvar_grad = logvar.grad().map(Rc::clone);
            let target = target.to_owned();
            logits.tape().backward_op(move || {
                let dy = *loss_grad.borrow().first().unwrap() * scale;
                if let Some(ref logits_grad) = logits_grad {
                    let mut logits_grad = logits_grad.borrow_mut();
                    // d bce / d l = σ(l) - t
                    Zip::from(&mut *logits_grad)
                        .and(&*logits_value)
                        .and(&target)
                        .for_each(|dl, &l, &t| {
                            *dl += dy * (sigmoid_scalar(l) - t);
                        });
                }
                if let Some(ref mu_grad) = mu_grad {
                    let mut mu_grad = mu_grad.borrow_mut();
                    Zip::from(&mut *mu_grad)
                        .and(&*mu_value)
                        .for_each(|dm, &m| *dm += dy * beta * m);
                }
                if let Some(ref logvar_grad) = logvar_grad {
                    let mut logvar_grad = logvar_grad.borrow_mut();
                    Zip::from(&mut *logvar_grad)
                        .and(&*logvar_value)
                        .for_each(|dlv, &lv| *dlv += dy * beta * 0.5 * (lv.exp() - 1.));
                }
            });
        }
        Ok(ElboLoss {
            loss,
            reconstruction,
            kl,
        })
    }
}
