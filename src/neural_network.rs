use crate::result::Result;
use autograd::{Parameter, Variable};

/// Variables and Parameters.
pub mod autograd;

/// Functional ops on arrays and [`Variable`]s.
pub mod functional;

/// Layers.
pub mod layer;

/// Optimizers.
pub mod optimizer;

/// A trait for the forward pass.
///
/// [`Layer`]s implement [`Forward`], which computes the output as a function of the
/// input.
pub trait Forward {
    /// Computes the forward pass.
    ///
    /// # Autograd
    /// If the input or any parameter requires a gradient, the implementation records
    /// backward ops on the input's [`Tape`](autograd::Tape).
    ///
    /// **Errors**
    ///
    /// Returns an error if the operation could not be performed, generally a shape
    /// mismatch between the input and the layer.
    fn forward(&self, input: &Variable) -> Result<Variable>;
}

/// A trait for networks and layers.
///
/// [`Layer`] provides reflection over the parameters of a layer, including child
/// layers.
pub trait Layer: Forward {
    /// The number of parameters.
    ///
    /// This is the length of [`.parameters_mut()`](Self::parameters_mut()).
    fn parameters_len(&self) -> usize {
        0
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Parameter>) {}
    /// Enumerates mutable references to the parameters of the layer, including child
    /// layers.
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters_mut(&mut parameters);
        parameters
    }
    /// Readies all parameters for a backward pass by zeroing their gradients.
    fn zero_grads(&mut self) {
        for parameter in self.parameters_mut() {
            parameter.zero_grad();
        }
    }
    /// Drops all parameter gradients, so that subsequent forward passes do not record
    /// backward ops for them.
    fn none_grads(&mut self) {
        for parameter in self.parameters_mut() {
            parameter.none_grad();
        }
    }
}
