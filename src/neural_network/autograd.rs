use ndarray::{ArcArray, Array, ArrayD, ArrayViewD, ArrayViewMutD, Dimension, IxDyn};
use parking_lot::Mutex;
use std::{
    cell::RefCell,
    fmt::{self, Debug},
    rc::Rc,
    sync::Arc,
};

/// A tape of backward ops.
///
/// Ops on [`Variable`]s record closures on the tape of the input during the forward
/// pass. [`Variable::backward()`] executes them in reverse order, accumulating
/// gradients into the variables and [`Parameter`]s each op captured.
///
/// The tape is shared via [`Rc`], so a fresh tape (and its recorded closures) is
/// dropped at the end of each training step.
#[derive(Default)]
pub struct Tape {
    backward_ops: RefCell<Vec<Box<dyn Fn()>>>,
}

impl Tape {
    /// Creates an empty tape.
    pub fn new() -> Self {
        Self::default()
    }
    /// Records `op` to be executed on the backward pass.
    pub fn backward_op(&self, op: impl Fn() + 'static) {
        self.backward_ops.borrow_mut().push(Box::new(op));
    }
    fn exec_backward(&self) {
        self.backward_ops.borrow().iter().rev().for_each(|op| op());
    }
}

impl Debug for Tape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Tape")
            .field("backward_ops", &self.backward_ops.borrow().len())
            .finish()
    }
}

/// A variable.
///
/// The value is shared, so cloning a variable is cheap. The gradient, if present, is
/// lazily accumulated by backward ops; ops treat a variable without a gradient as a
/// constant.
#[derive(Clone)]
pub struct Variable {
    tape: Rc<Tape>,
    value: Rc<ArrayD<f32>>,
    grad: Option<Rc<RefCell<ArrayD<f32>>>>,
}

impl Variable {
    /// Creates a variable on `tape` with `value`.
    ///
    /// If `req_grad`, allocates a zeroed gradient of the same shape.
    pub fn new<D: Dimension>(tape: &Rc<Tape>, value: Array<f32, D>, req_grad: bool) -> Self {
        let value = value.into_dyn();
        let grad = if req_grad {
            Some(Rc::new(RefCell::new(ArrayD::zeros(value.raw_dim()))))
        } else {
            None
        };
        Self {
            tape: Rc::clone(tape),
            value: Rc::new(value),
            grad,
        }
    }
    /// The tape this variable records backward ops on.
    pub fn tape(&self) -> &Rc<Tape> {
        &self.tape
    }
    /// The value.
    pub fn value(&self) -> &Rc<ArrayD<f32>> {
        &self.value
    }
    /// The shape of the value.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The gradient.
    pub fn grad(&self) -> Option<&Rc<RefCell<ArrayD<f32>>>> {
        self.grad.as_ref()
    }
    /// Whether backward ops should compute a gradient for this variable.
    pub fn req_grad(&self) -> bool {
        self.grad.is_some()
    }
    /// Executes the backward pass.
    ///
    /// Seeds this variable's gradient with ones, then executes the recorded backward
    /// ops in reverse order. Typically called on a scalar loss.
    pub fn backward(&self) {
        if let Some(ref grad) = self.grad {
            grad.borrow_mut().fill(1.);
        }
        self.tape.exec_backward();
    }
    /// Unwraps the value, cloning if it is shared.
    pub fn into_array(self) -> ArrayD<f32> {
        match Rc::try_unwrap(self.value) {
            Ok(value) => value,
            Err(value) => ArrayD::clone(&value),
        }
    }
}

impl Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Variable")
            .field("shape", &self.shape())
            .field("req_grad", &self.req_grad())
            .finish()
    }
}

/// A trainable parameter.
///
/// The value is an [`ArcArray`] so that forward ops can cheaply capture it for their
/// backward closures. The gradient is guarded by a [`Mutex`], allowing backward ops
/// to accumulate per sample contributions from parallel workers.
#[derive(Default, Clone)]
pub struct Parameter {
    value: ArcArray<f32, IxDyn>,
    grad: Option<Arc<Mutex<ArrayD<f32>>>>,
}

impl Parameter {
    /// Creates a parameter from `value`, without a gradient.
    pub fn from_array<D: Dimension>(value: Array<f32, D>) -> Self {
        Self {
            value: value.into_dyn().into_shared(),
            grad: None,
        }
    }
    /// The value.
    pub fn value(&self) -> &ArcArray<f32, IxDyn> {
        &self.value
    }
    /// A view of the value.
    pub fn view(&self) -> ArrayViewD<f32> {
        self.value.view()
    }
    /// A mutable view of the value.
    ///
    /// Clones the underlying data if it is shared, so this parameter stays canonical.
    pub fn view_mut(&mut self) -> ArrayViewMutD<f32> {
        self.value.view_mut()
    }
    /// The shape of the value.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The gradient.
    pub fn grad(&self) -> Option<&Arc<Mutex<ArrayD<f32>>>> {
        self.grad.as_ref()
    }
    /// Whether backward ops should compute a gradient for this parameter.
    pub fn req_grad(&self) -> bool {
        self.grad.is_some()
    }
    /// Replaces the gradient with zeros, readying the parameter for a backward pass.
    pub fn zero_grad(&mut self) {
        self.grad = Some(Arc::new(Mutex::new(ArrayD::zeros(self.value.raw_dim()))));
    }
    /// Drops the gradient.
    pub fn none_grad(&mut self) {
        self.grad = None;
    }
    /// Takes the accumulated gradient, if any, leaving the parameter without one.
    pub fn take_grad(&mut self) -> Option<ArrayD<f32>> {
        self.grad.take().map(|grad| match Arc::try_unwrap(grad) {
            Ok(grad) => grad.into_inner(),
            Err(grad) => grad.lock().clone(),
        })
    }
}

impl Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("shape", &self.shape())
            .field("req_grad", &self.req_grad())
            .finish()
    }
}
