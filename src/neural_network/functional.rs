use super::autograd::{Parameter, Variable};
use crate::result::Result;
use anyhow::{ensure, Error};
use ndarray::{
    arr0, linalg::general_mat_mul, Array, Array2, Array3, Array4, ArrayBase, ArrayD, ArrayView2,
    ArrayView3, Axis, Data, Dimension, Ix2, Ix4,
};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::rc::Rc;

/// Strides and padding of a convolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Conv2Args {
    /// Strides. Defaults to 1.
    pub strides: [usize; 2],
    /// Zero padding. Defaults to 0.
    pub padding: [usize; 2],
}

impl Default for Conv2Args {
    fn default() -> Self {
        Self {
            strides: [1, 1],
            padding: [0, 0],
        }
    }
}

impl Conv2Args {
    /// Output spatial dims for an input of `hw` convolved with `kernel`.
    ///
    /// **Errors**
    ///
    /// The padded input must be at least as large as the kernel.
    pub fn output_hw(&self, hw: [usize; 2], kernel: [usize; 2]) -> Result<[usize; 2]> {
        let mut out = [0, 0];
        for i in 0..2 {
            ensure!(
                hw[i] + 2 * self.padding[i] >= kernel[i],
                "Kernel {:?} does not fit input {:?} with padding {:?}!",
                kernel,
                hw,
                self.padding,
            );
            out[i] = (hw[i] + 2 * self.padding[i] - kernel[i]) / self.strides[i] + 1;
        }
        Ok(out)
    }
}

/// Strides, padding, and output padding of a transposed convolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConvTranspose2Args {
    /// Strides. Defaults to 1.
    pub strides: [usize; 2],
    /// Zero padding. Defaults to 0.
    pub padding: [usize; 2],
    /// Extra rows / columns added to the output. Defaults to 0.
    pub output_padding: [usize; 2],
}

impl Default for ConvTranspose2Args {
    fn default() -> Self {
        Self {
            strides: [1, 1],
            padding: [0, 0],
            output_padding: [0, 0],
        }
    }
}

impl ConvTranspose2Args {
    /// Output spatial dims for an input of `hw` transposed-convolved with `kernel`.
    ///
    /// **Errors**
    ///
    /// The output dims must be positive.
    pub fn output_hw(&self, hw: [usize; 2], kernel: [usize; 2]) -> Result<[usize; 2]> {
        let mut out = [0, 0];
        for i in 0..2 {
            let expanded = (hw[i] - 1) * self.strides[i] + kernel[i] + self.output_padding[i];
            ensure!(
                expanded > 2 * self.padding[i],
                "Padding {:?} swallows the entire output for input {:?} and kernel {:?}!",
                self.padding,
                hw,
                kernel,
            );
            out[i] = expanded - 2 * self.padding[i];
        }
        Ok(out)
    }
}

// Patch extraction for [c, h, w] images. Row layout is (c * kh + ki) * kw + kj, column
// layout is oi * ow + oj; out of bounds positions read as zero.
fn im2col(
    input: ArrayView3<f32>,
    kernel: [usize; 2],
    strides: [usize; 2],
    padding: [usize; 2],
    patch_hw: [usize; 2],
) -> Array2<f32> {
    let (c, h, w) = input.dim();
    let [kh, kw] = kernel;
    let [sh, sw] = strides;
    let [ph, pw] = padding;
    let [oh, ow] = patch_hw;
    let mut cols = Array2::zeros((c * kh * kw, oh * ow));
    for ci in 0..c {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (ci * kh + ki) * kw + kj;
                for oi in 0..oh {
                    let ii = (oi * sh + ki) as isize - ph as isize;
                    if ii < 0 || ii >= h as isize {
                        continue;
                    }
                    for oj in 0..ow {
                        let jj = (oj * sw + kj) as isize - pw as isize;
                        if jj < 0 || jj >= w as isize {
                            continue;
                        }
                        cols[(row, oi * ow + oj)] = input[(ci, ii as usize, jj as usize)];
                    }
                }
            }
        }
    }
    cols
}

// Adjoint of [`im2col`]: scatters columns back into an image, accumulating where
// patches overlap.
fn col2im(
    cols: ArrayView2<f32>,
    dim: [usize; 3],
    kernel: [usize; 2],
    strides: [usize; 2],
    padding: [usize; 2],
    patch_hw: [usize; 2],
) -> Array3<f32> {
    let [c, h, w] = dim;
    let [kh, kw] = kernel;
    let [sh, sw] = strides;
    let [ph, pw] = padding;
    let [oh, ow] = patch_hw;
    let mut image = Array3::zeros((c, h, w));
    for ci in 0..c {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (ci * kh + ki) * kw + kj;
                for oi in 0..oh {
                    let ii = (oi * sh + ki) as isize - ph as isize;
                    if ii < 0 || ii >= h as isize {
                        continue;
                    }
                    for oj in 0..ow {
                        let jj = (oj * sw + kj) as isize - pw as isize;
                        if jj < 0 || jj >= w as isize {
                            continue;
                        }
                        image[(ci, ii as usize, jj as usize)] += cols[(row, oi * ow + oj)];
                    }
                }
            }
        }
    }
    image
}

fn stack_samples(samples: Vec<Array3<f32>>) -> Result<Array4<f32>> {
    let views: Vec<_> = samples.iter().map(Array3::view).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

fn add_channel_bias(image: &mut Array3<f32>, bias: &Parameter) {
    let bias = bias.value();
    for (mut channel, b) in image.outer_iter_mut().zip(bias.iter().copied()) {
        channel += b;
    }
}

/// Dense / fully connected op.
pub trait Dense {
    type Output;
    /// Flattens the trailing dims of `self` and computes `self · weightᵀ + bias`.
    fn dense(&self, weight: &Parameter, bias: Option<&Parameter>) -> Result<Self::Output>;
}

fn dense_array(
    input: ArrayView2<f32>,
    weight: &Parameter,
    bias: Option<&Parameter>,
) -> Result<Array2<f32>> {
    let weight = weight.view().into_dimensionality::<Ix2>()?;
    let (outputs, inputs) = weight.dim();
    ensure!(
        input.ncols() == inputs,
        "Input {:?} does not match weight {:?}!",
        input.shape(),
        weight.shape(),
    );
    let batch_size = input.nrows();
    let mut out = if let Some(bias) = bias {
        let bias = bias.view().into_dimensionality::<ndarray::Ix1>()?;
        bias.broadcast((batch_size, outputs))
            .ok_or_else(|| Error::msg("Bias does not broadcast!"))?
            .to_owned()
    } else {
        Array2::zeros((batch_size, outputs))
    };
    general_mat_mul(1., &input, &weight.t(), 1., &mut out);
    Ok(out)
}

impl<S: Data<Elem = f32>, D: Dimension> Dense for ArrayBase<S, D> {
    type Output = Array2<f32>;
    fn dense(&self, weight: &Parameter, bias: Option<&Parameter>) -> Result<Self::Output> {
        let batch_size = self.shape()[0];
        let inputs = self.shape()[1..].iter().product();
        let input = self.view().into_shape((batch_size, inputs))?;
        dense_array(input, weight, bias)
    }
}

impl Dense for Variable {
    type Output = Variable;
    fn dense(&self, weight: &Parameter, bias: Option<&Parameter>) -> Result<Self::Output> {
        let out_value = self.value().dense(weight, bias)?;
        let req_grad =
            self.req_grad() || weight.req_grad() || bias.map_or(false, Parameter::req_grad);
        let out = Variable::new(self.tape(), out_value, req_grad);
        if let Some(out_grad) = out.grad() {
            let out_grad = Rc::clone(out_grad);
            let input_value = Rc::clone(self.value());
            let input_grad = self.grad().map(Rc::clone);
            let weight_value = weight.value().clone();
            let weight_grad = weight.grad().map(std::sync::Arc::clone);
            let bias_grad = bias.and_then(Parameter::grad).map(std::sync::Arc::clone);
            self.tape().backward_op(move || {
                let out_grad = out_grad.borrow();
                let out_grad = out_grad.view().into_dimensionality::<Ix2>().unwrap();
                let batch_size = input_value.shape()[0];
                let inputs = input_value.shape()[1..].iter().product();
                let input = input_value.view().into_shape((batch_size, inputs)).unwrap();
                if let Some(ref weight_grad) = weight_grad {
                    let mut weight_grad = weight_grad.lock();
                    let mut weight_grad =
                        weight_grad.view_mut().into_dimensionality::<Ix2>().unwrap();
                    general_mat_mul(1., &out_grad.t(), &input, 1., &mut weight_grad);
                }
                if let Some(ref bias_grad) = bias_grad {
                    let mut bias_grad = bias_grad.lock();
                    let batch_sum = out_grad.sum_axis(Axis(0));
                    bias_grad
                        .view_mut()
                        .into_dimensionality::<ndarray::Ix1>()
                        .unwrap()
                        .scaled_add(1., &batch_sum);
                }
                if let Some(ref input_grad) = input_grad {
                    let mut input_grad = input_grad.borrow_mut();
                    let mut input_grad =
                        input_grad.view_mut().into_shape((batch_size, inputs)).unwrap();
                    let weight = weight_value.view().into_dimensionality::<Ix2>().unwrap();
                    general_mat_mul(1., &out_grad, &weight, 1., &mut input_grad);
                }
            });
        }
        Ok(out)
    }
}

/// 2D convolution.
pub trait Conv2 {
    type Output;
    /// Convolves `self` (\[n, c_in, h, w\]) with `weight` (\[c_out, c_in, kh, kw\]).
    fn conv2(
        &self,
        weight: &Parameter,
        bias: Option<&Parameter>,
        args: &Conv2Args,
    ) -> Result<Self::Output>;
}

fn conv2_forward(
    input: &ArrayD<f32>,
    weight: &Parameter,
    bias: Option<&Parameter>,
    args: &Conv2Args,
) -> Result<Array4<f32>> {
    let input = input.view().into_dimensionality::<Ix4>()?;
    let (n, c_in, h, w) = input.dim();
    let weight_view = weight.view().into_dimensionality::<Ix4>()?;
    let (c_out, wc_in, kh, kw) = weight_view.dim();
    ensure!(
        c_in == wc_in,
        "Input channels {} do not match weight {:?}!",
        c_in,
        weight_view.shape(),
    );
    let [oh, ow] = args.output_hw([h, w], [kh, kw])?;
    let weight2 = weight_view.into_shape((c_out, wc_in * kh * kw))?;
    let samples = (0..n)
        .into_par_iter()
        .map(|i| {
            let cols = im2col(
                input.index_axis(Axis(0), i),
                [kh, kw],
                args.strides,
                args.padding,
                [oh, ow],
            );
            let mut out = weight2
                .dot(&cols)
                .into_shape((c_out, oh, ow))
                .expect("conv2 output reshape");
            if let Some(bias) = bias {
                add_channel_bias(&mut out, bias);
            }
            out
        })
        .collect();
    stack_samples(samples)
}

impl<S: Data<Elem = f32>, D: Dimension> Conv2 for ArrayBase<S, D> {
    type Output = Array4<f32>;
    fn conv2(
        &self,
        weight: &Parameter,
        bias: Option<&Parameter>,
        args: &Conv2Args,
    ) -> Result<Self::Output> {
        conv2_forward(&self.to_owned().into_dyn(), weight, bias, args)
    }
}

impl Conv2 for Variable {
    type Output = Variable;
    fn conv2(
        &self,
        weight: &Parameter,
        bias: Option<&Parameter>,
        args: &Conv2Args,
    ) -> Result<Self::Output> {
        let out_value = conv2_forward(self.value(), weight, bias, args)?;
        let req_grad =
            self.req_grad() || weight.req_grad() || bias.map_or(false, Parameter::req_grad);
        let out = Variable::new(self.tape(), out_value, req_grad);
        if let Some(out_grad) = out.grad() {
            let out_grad = Rc::clone(out_grad);
            let input_value = Rc::clone(self.value());
            let input_grad = self.grad().map(Rc::clone);
            let weight_value = weight.value().clone();
            let weight_grad = weight.grad().map(std::sync::Arc::clone);
            let bias_grad = bias.and_then(Parameter::grad).map(std::sync::Arc::clone);
            let args = *args;
            self.tape().backward_op(move || {
                let input = input_value.view().into_dimensionality::<Ix4>().unwrap();
                let (n, c_in, h, w) = input.dim();
                let weight = weight_value.view().into_dimensionality::<Ix4>().unwrap();
                let (c_out, _, kh, kw) = weight.dim();
                let weight2 = weight.into_shape((c_out, c_in * kh * kw)).unwrap();
                let out_grad = out_grad.borrow();
                let out_grad = out_grad.view().into_dimensionality::<Ix4>().unwrap();
                let (_, _, oh, ow) = out_grad.dim();
                let need_weight = weight_grad.is_some();
                let need_input = input_grad.is_some();
                let parts: Vec<_> = (0..n)
                    .into_par_iter()
                    .map(|i| {
                        let dout2 = out_grad
                            .index_axis(Axis(0), i)
                            .into_shape((c_out, oh * ow))
                            .expect("conv2 grad reshape");
                        let dweight = if need_weight {
                            let cols = im2col(
                                input.index_axis(Axis(0), i),
                                [kh, kw],
                                args.strides,
                                args.padding,
                                [oh, ow],
                            );
                            Some(dout2.dot(&cols.t()))
                        } else {
                            None
                        };
                        let dinput = if need_input {
                            Some(col2im(
                                weight2.t().dot(&dout2).view(),
                                [c_in, h, w],
                                [kh, kw],
                                args.strides,
                                args.padding,
                                [oh, ow],
                            ))
                        } else {
                            None
                        };
                        (dweight, dinput)
                    })
                    .collect();
                if let Some(ref weight_grad) = weight_grad {
                    let mut weight_grad = weight_grad.lock();
                    let mut weight_grad = weight_grad
                        .view_mut()
                        .into_shape((c_out, c_in * kh * kw))
                        .unwrap();
                    for (dweight, _) in parts.iter() {
                        weight_grad.scaled_add(1., dweight.as_ref().unwrap());
                    }
                }
                if let Some(ref bias_grad) = bias_grad {
                    let mut bias_grad = bias_grad.lock();
                    let batch_sum = out_grad.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0));
                    bias_grad
                        .view_mut()
                        .into_dimensionality::<ndarray::Ix1>()
                        .unwrap()
                        .scaled_add(1., &batch_sum);
                }
                if let Some(ref input_grad) = input_grad {
                    let mut input_grad = input_grad.borrow_mut();
                    let mut input_grad =
                        input_grad.view_mut().into_dimensionality::<Ix4>().unwrap();
                    for (i, (_, dinput)) in parts.into_iter().enumerate() {
                        input_grad
                            .index_axis_mut(Axis(0), i)
                            .scaled_add(1., &dinput.unwrap());
                    }
                }
            });
        }
        Ok(out)
    }
}

/// Transposed 2D convolution.
pub trait ConvTranspose2 {
    type Output;
    /// Transposed-convolves `self` (\[n, c_in, h, w\]) with `weight`
    /// (\[c_in, c_out, kh, kw\]), upsampling the spatial dims.
    fn conv_transpose2(
        &self,
        weight: &Parameter,
        bias: Option<&Parameter>,
        args: &ConvTranspose2Args,
    ) -> Result<Self::Output>;
}

fn conv_transpose2_forward(
    input: &ArrayD<f32>,
    weight: &Parameter,
    bias: Option<&Parameter>,
    args: &ConvTranspose2Args,
) -> Result<Array4<f32>> {
    let input = input.view().into_dimensionality::<Ix4>()?;
    let (n, c_in, h, w) = input.dim();
    let weight_view = weight.view().into_dimensionality::<Ix4>()?;
    let (wc_in, c_out, kh, kw) = weight_view.dim();
    ensure!(
        c_in == wc_in,
        "Input channels {} do not match weight {:?}!",
        c_in,
        weight_view.shape(),
    );
    let [oh, ow] = args.output_hw([h, w], [kh, kw])?;
    let weight2 = weight_view.into_shape((wc_in, c_out * kh * kw))?;
    let samples = (0..n)
        .into_par_iter()
        .map(|i| {
            let x2 = input
                .index_axis(Axis(0), i)
                .into_shape((c_in, h * w))
                .expect("conv_transpose2 input reshape");
            let cols = weight2.t().dot(&x2);
            let mut out = col2im(
                cols.view(),
                [c_out, oh, ow],
                [kh, kw],
                args.strides,
                args.padding,
                [h, w],
            );
            if let Some(bias) = bias {
                add_channel_bias(&mut out, bias);
            }
            out
        })
        .collect();
    stack_samples(samples)
}

impl<S: Data<Elem = f32>, D: Dimension> ConvTranspose2 for ArrayBase<S, D> {
    type Output = Array4<f32>;
    fn conv_transpose2(
        &self,
        weight: &Parameter,
        bias: Option<&Parameter>,
        args: &ConvTranspose2Args,
    ) -> Result<Self::Output> {
        conv_transpose2_forward(&self.to_owned().into_dyn(), weight, bias, args)
    }
}

impl ConvTranspose2 for Variable {
    type Output = Variable;
    fn conv_transpose2(
        &self,
        weight: &Parameter,
        bias: Option<&Parameter>,
        args: &ConvTranspose2Args,
    ) -> Result<Self::Output> {
        let out_value = conv_transpose2_forward(self.value(), weight, bias, args)?;
        let req_grad =
            self.req_grad() || weight.req_grad() || bias.map_or(false, Parameter::req_grad);
        let out = Variable::new(self.tape(), out_value, req_grad);
        if let Some(out_grad) = out.grad() {
            let out_grad = Rc::clone(out_grad);
            let input_value = Rc::clone(self.value());
            let input_grad = self.grad().map(Rc::clone);
            let weight_value = weight.value().clone();
            let weight_grad = weight.grad().map(std::sync::Arc::clone);
            let bias_grad = bias.and_then(Parameter::grad).map(std::sync::Arc::clone);
            let args = *args;
            self.tape().backward_op(move || {
                let input = input_value.view().into_dimensionality::<Ix4>().unwrap();
                let (n, c_in, h, w) = input.dim();
                let weight = weight_value.view().into_dimensionality::<Ix4>().unwrap();
                let (_, c_out, kh, kw) = weight.dim();
                let weight2 = weight.into_shape((c_in, c_out * kh * kw)).unwrap();
                let out_grad = out_grad.borrow();
                let out_grad = out_grad.view().into_dimensionality::<Ix4>().unwrap();
                let need_weight = weight_grad.is_some();
                let need_input = input_grad.is_some();
                let parts: Vec<_> = (0..n)
                    .into_par_iter()
                    .map(|i| {
                        // Patches of the output gradient line up with the input grid,
                        // mirroring the forward scatter.
                        let dcols = im2col(
                            out_grad.index_axis(Axis(0), i),
                            [kh, kw],
                            args.strides,
                            args.padding,
                            [h, w],
                        );
                        let dweight = if need_weight {
                            let x2 = input
                                .index_axis(Axis(0), i)
                                .into_shape((c_in, h * w))
                                .expect("conv_transpose2 input reshape");
                            Some(x2.dot(&dcols.t()))
                        } else {
                            None
                        };
                        let dinput = if need_input {
                            Some(
                                weight2
                                    .dot(&dcols)
                                    .into_shape((c_in, h, w))
                                    .expect("conv_transpose2 grad reshape"),
                            )
                        } else {
                            None
                        };
                        (dweight, dinput)
                    })
                    .collect();
                if let Some(ref weight_grad) = weight_grad {
                    let mut weight_grad = weight_grad.lock();
                    let mut weight_grad = weight_grad
                        .view_mut()
                        .into_shape((c_in, c_out * kh * kw))
                        .unwrap();
                    for (dweight, _) in parts.iter() {
                        weight_grad.scaled_add(1., dweight.as_ref().unwrap());
                    }
                }
                if let Some(ref bias_grad) = bias_grad {
                    let mut bias_grad = bias_grad.lock();
                    let batch_sum = out_grad.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0));
                    bias_grad
                        .view_mut()
                        .into_dimensionality::<ndarray::Ix1>()
                        .unwrap()
                        .scaled_add(1., &batch_sum);
                }
                if let Some(ref input_grad) = input_grad {
                    let mut input_grad = input_grad.borrow_mut();
                    let mut input_grad =
                        input_grad.view_mut().into_dimensionality::<Ix4>().unwrap();
                    for (i, (_, dinput)) in parts.into_iter().enumerate() {
                        input_grad
                            .index_axis_mut(Axis(0), i)
                            .scaled_add(1., &dinput.unwrap());
                    }
                }
            });
        }
        Ok(out)
    }
}

/// ReLU activation.
pub trait Relu {
    type Output;
    fn relu(&self) -> Self::Output;
}

impl<S: Data<Elem = f32>, D: Dimension> Relu for ArrayBase<S, D> {
    type Output = Array<f32, D>;
    fn relu(&self) -> Self::Output {
        self.map(|&x| if x > 0. { x } else { 0. })
    }
}

impl Relu for Variable {
    type Output = Variable;
    fn relu(&self) -> Self::Output {
        let out = Variable::new(self.tape(), self.value().relu(), self.req_grad());
        if let Some(out_grad) = out.grad() {
            let out_grad = Rc::clone(out_grad);
            let input_value = Rc::clone(self.value());
            let input_grad = Rc::clone(self.grad().as_ref().unwrap());
            self.tape().backward_op(move || {
                let out_grad = out_grad.borrow();
                let mut input_grad = input_grad.borrow_mut();
                ndarray::Zip::from(&*input_value)
                    .and(&mut *input_grad)
                    .and(&*out_grad)
                    .for_each(|&x, dx, &dy| {
                        if x > 0. {
                            *dx += dy;
                        }
                    });
            });
        }
        out
    }
}

/// Logistic sigmoid activation.
pub trait Sigmoid {
    type Output;
    fn sigmoid(&self) -> Self::Output;
}

pub(crate) fn sigmoid_scalar(x: f32) -> f32 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

impl<S: Data<Elem = f32>, D: Dimension> Sigmoid for ArrayBase<S, D> {
    type Output = Array<f32, D>;
    fn sigmoid(&self) -> Self::Output {
        self.map(|&x| sigmoid_scalar(x))
    }
}

impl Sigmoid for Variable {
    type Output = Variable;
    fn sigmoid(&self) -> Self::Output {
        let out = Variable::new(self.tape(), self.value().sigmoid(), self.req_grad());
        if let Some(out_grad) = out.grad() {
            let out_grad = Rc::clone(out_grad);
            let out_value = Rc::clone(out.value());
            let input_grad = Rc::clone(self.grad().as_ref().unwrap());
            self.tape().backward_op(move || {
                let out_grad = out_grad.borrow();
                let mut input_grad = input_grad.borrow_mut();
                ndarray::Zip::from(&*out_value)
                    .and(&mut *input_grad)
                    .and(&*out_grad)
                    .for_each(|&y, dx, &dy| {
                        *dx += dy * y * (1. - y);
                    });
            });
        }
        out
    }
}

impl Variable {
    /// Reshapes the value, preserving the number of elements.
    ///
    /// **Errors**
    ///
    /// The new shape must match the element count.
    pub fn reshape(&self, shape: &[usize]) -> Result<Variable> {
        let value = ArrayD::clone(self.value()).into_shape(shape)?;
        let out = Variable::new(self.tape(), value, self.req_grad());
        if let Some(out_grad) = out.grad() {
            let out_grad = Rc::clone(out_grad);
            let input_grad = Rc::clone(self.grad().as_ref().unwrap());
            let input_dim = self.value().raw_dim();
            self.tape().backward_op(move || {
                let out_grad = out_grad.borrow();
                let out_grad = out_grad
                    .view()
                    .into_shape(input_dim.clone())
                    .expect("reshape grad");
                input_grad.borrow_mut().scaled_add(1., &out_grad);
            });
        }
        Ok(out)
    }
    /// Flattens all but the batch dim.
    pub fn flatten(&self) -> Result<Variable> {
        let batch_size = self.shape()[0];
        let inputs = self.shape()[1..].iter().product();
        self.reshape(&[batch_size, inputs])
    }
    /// Sums all elements into a 0 dimensional variable.
    pub fn sum(&self) -> Variable {
        let out = Variable::new(self.tape(), arr0(self.value().sum()), self.req_grad());
        if let Some(out_grad) = out.grad() {
            let out_grad = Rc::clone(out_grad);
            let input_grad = Rc::clone(self.grad().as_ref().unwrap());
            self.tape().backward_op(move || {
                let dy = *out_grad.borrow().first().unwrap();
                input_grad.borrow_mut().mapv_inplace(|dx| dx + dy);
            });
        }
        out
    }
}

/// Draws z = μ + σ·ε with ε ~ N(0, I), where σ = exp(logσ² / 2).
///
/// This is the reparameterization trick: the sample is differentiable with respect to
/// both `mu` and `logvar`.
///
/// **Errors**
///
/// `mu` and `logvar` must have the same shape.
pub fn reparameterize<R: Rng>(mu: &Variable, logvar: &Variable, rng: &mut R) -> Result<Variable> {
    ensure!(
        mu.shape() == logvar.shape(),
        "Mu {:?} does not match logvar {:?}!",
        mu.shape(),
        logvar.shape(),
    );
    let std = logvar.value().mapv(|lv| (0.5 * lv).exp());
    let eps: ArrayD<f32> =
        Array::from_shape_simple_fn(mu.value().raw_dim(), || rng.sample(StandardNormal));
    let value = &**mu.value() + &(&eps * &std);
    let req_grad = mu.req_grad() || logvar.req_grad();
    let out = Variable::new(mu.tape(), value, req_grad);
    if let Some(out_grad) = out.grad() {
        let out_grad = Rc::clone(out_grad);
        let mu_grad = mu.grad().map(Rc::clone);
        let logvar_grad = logvar.grad().map(Rc::clone);
        // dz/dlogσ² = ε · σ / 2
        let scaled = &eps * &std * 0.5;
        mu.tape().backward_op(move || {
            let out_grad = out_grad.borrow();
            if let Some(ref mu_grad) = mu_grad {
                mu_grad.borrow_mut().scaled_add(1., &*out_grad);
            }
            if let Some(ref logvar_grad) = logvar_grad {
                let mut logvar_grad = logvar_grad.borrow_mut();
                ndarray::Zip::from(&mut *logvar_grad)
                    .and(&*out_grad)
                    .and(&scaled)
                    .for_each(|dlv, &dz, &s| *dlv += dz * s);
            }
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array2, Array4, IxDyn};
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use std::rc::Rc;

    use crate::neural_network::autograd::Tape;

    fn random_array(shape: &[usize], rng: &mut SmallRng) -> ArrayD<f32> {
        ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-1f32..1.))
    }

    #[test]
    fn conv2_args_output_hw() {
        let args = Conv2Args {
            strides: [2, 2],
            padding: [1, 1],
        };
        assert_eq!(args.output_hw([28, 28], [3, 3]).unwrap(), [14, 14]);
        assert_eq!(args.output_hw([14, 14], [3, 3]).unwrap(), [7, 7]);
        assert!(Conv2Args::default().output_hw([2, 2], [3, 3]).is_err());
    }

    #[test]
    fn conv_transpose2_args_output_hw() {
        let args = ConvTranspose2Args {
            strides: [2, 2],
            padding: [1, 1],
            output_padding: [1, 1],
        };
        assert_eq!(args.output_hw([7, 7], [3, 3]).unwrap(), [14, 14]);
        assert_eq!(args.output_hw([14, 14], [3, 3]).unwrap(), [28, 28]);
    }

    #[test]
    fn im2col_unit_stride() {
        let input = Array3::from_shape_vec((1, 3, 3), (1..=9).map(|x| x as f32).collect()).unwrap();
        let cols = im2col(input.view(), [2, 2], [1, 1], [0, 0], [2, 2]);
        assert_eq!(cols.dim(), (4, 4));
        // Patch at (0, 0) reads the top-left window in row-major kernel order.
        assert_eq!(
            cols.column(0).to_vec(),
            vec![1., 2., 4., 5.],
        );
        // Patch at (1, 1) reads the bottom-right window.
        assert_eq!(
            cols.column(3).to_vec(),
            vec![5., 6., 8., 9.],
        );
    }

    #[test]
    fn conv2_sums_windows() {
        let input =
            Array4::from_shape_vec((1, 1, 3, 3), (1..=9).map(|x| x as f32).collect()).unwrap();
        let weight = Parameter::from_array(Array4::from_elem((1, 1, 2, 2), 1f32));
        let out = input
            .conv2(&weight, None, &Conv2Args::default())
            .unwrap();
        assert_eq!(out.dim(), (1, 1, 2, 2));
        assert_eq!(
            out.into_raw_vec(),
            vec![12., 16., 24., 28.],
        );
    }

    #[test]
    fn conv_transpose2_is_adjoint_of_conv2() {
        // <conv(x), y> == <x, convᵀ(y)> when convᵀ uses the same kernel with the
        // channel axes swapped and the same strides / padding.
        let mut rng = SmallRng::seed_from_u64(0);
        let x = random_array(&[2, 3, 5, 5], &mut rng)
            .into_dimensionality::<Ix4>()
            .unwrap();
        let y = random_array(&[2, 4, 3, 3], &mut rng)
            .into_dimensionality::<Ix4>()
            .unwrap();
        let kernel = random_array(&[4, 3, 3, 3], &mut rng)
            .into_dimensionality::<Ix4>()
            .unwrap();
        let args = Conv2Args {
            strides: [2, 2],
            padding: [1, 1],
        };
        let conv_weight = Parameter::from_array(kernel.clone());
        let fwd = x.conv2(&conv_weight, None, &args).unwrap();
        assert_eq!(fwd.dim(), (2, 4, 3, 3));
        // The conv weight [c_out, c_in, kh, kw] reads as [c_in, c_out, kh, kw] for the
        // transposed op; the array is shared as is.
        let transpose_weight = Parameter::from_array(kernel);
        let t_args = ConvTranspose2Args {
            strides: [2, 2],
            padding: [1, 1],
            output_padding: [0, 0],
        };
        let bwd = y.conv_transpose2(&transpose_weight, None, &t_args).unwrap();
        assert_eq!(bwd.dim(), (2, 3, 5, 5));
        let lhs: f32 = (&fwd * &y).sum();
        let rhs: f32 = (&bwd * &x).sum();
        assert_relative_eq!(lhs, rhs, max_relative = 1e-4);
    }

    // Numerical gradient of `f` at `x` via central differences.
    fn numeric_grad(mut f: impl FnMut(&ArrayD<f32>) -> f32, x: &ArrayD<f32>) -> ArrayD<f32> {
        let eps = 1e-2;
        let mut grad = ArrayD::zeros(x.raw_dim());
        for i in 0..x.len() {
            let mut plus = x.clone();
            plus.as_slice_mut().unwrap()[i] += eps;
            let mut minus = x.clone();
            minus.as_slice_mut().unwrap()[i] -= eps;
            grad.as_slice_mut().unwrap()[i] = (f(&plus) - f(&minus)) / (2. * eps);
        }
        grad
    }

    fn check_grads(analytic: &ArrayD<f32>, numeric: &ArrayD<f32>) {
        for (&a, &n) in analytic.iter().zip(numeric.iter()) {
            assert_relative_eq!(a, n, epsilon = 1e-2, max_relative = 5e-2);
        }
    }

    #[test]
    fn dense_grad() {
        let mut rng = SmallRng::seed_from_u64(1);
        let x = random_array(&[3, 4], &mut rng);
        let w = random_array(&[2, 4], &mut rng);
        let b = random_array(&[2], &mut rng);
        let loss = |x: &ArrayD<f32>, w: &ArrayD<f32>, b: &ArrayD<f32>| {
            let weight = Parameter::from_array(w.clone());
            let bias = Parameter::from_array(b.clone());
            x.dense(&weight, Some(&bias)).unwrap().sum()
        };
        let tape = Rc::new(Tape::new());
        let input = Variable::new(&tape, x.clone(), true);
        let mut weight = Parameter::from_array(w.clone());
        weight.zero_grad();
        let mut bias = Parameter::from_array(b.clone());
        bias.zero_grad();
        input.dense(&weight, Some(&bias)).unwrap().sum().backward();
        check_grads(
            &input.grad().unwrap().borrow(),
            &numeric_grad(|x| loss(x, &w, &b), &x),
        );
        check_grads(
            &weight.take_grad().unwrap(),
            &numeric_grad(|w| loss(&x, w, &b), &w),
        );
        check_grads(
            &bias.take_grad().unwrap(),
            &numeric_grad(|b| loss(&x, &w, b), &b),
        );
    }

    #[test]
    fn conv2_grad() {
        let mut rng = SmallRng::seed_from_u64(2);
        let x = random_array(&[2, 2, 4, 4], &mut rng);
        let w = random_array(&[3, 2, 3, 3], &mut rng);
        let b = random_array(&[3], &mut rng);
        let args = Conv2Args {
            strides: [2, 2],
            padding: [1, 1],
        };
        let loss = |x: &ArrayD<f32>, w: &ArrayD<f32>, b: &ArrayD<f32>| {
            let weight = Parameter::from_array(w.clone());
            let bias = Parameter::from_array(b.clone());
            x.conv2(&weight, Some(&bias), &args).unwrap().sum()
        };
        let tape = Rc::new(Tape::new());
        let input = Variable::new(&tape, x.clone(), true);
        let mut weight = Parameter::from_array(w.clone());
        weight.zero_grad();
        let mut bias = Parameter::from_array(b.clone());
        bias.zero_grad();
        input
            .conv2(&weight, Some(&bias), &args)
            .unwrap()
            .sum()
            .backward();
        check_grads(
            &input.grad().unwrap().borrow(),
            &numeric_grad(|x| loss(x, &w, &b), &x),
        );
        check_grads(
            &weight.take_grad().unwrap(),
            &numeric_grad(|w| loss(&x, w, &b), &w),
        );
        check_grads(
            &bias.take_grad().unwrap(),
            &numeric_grad(|b| loss(&x, &w, b), &b),
        );
    }

    #[test]
    fn conv_transpose2_grad() {
        let mut rng = SmallRng::seed_from_u64(3);
        let x = random_array(&[2, 3, 3, 3], &mut rng);
        let w = random_array(&[3, 2, 3, 3], &mut rng);
        let b = random_array(&[2], &mut rng);
        let args = ConvTranspose2Args {
            strides: [2, 2],
            padding: [1, 1],
            output_padding: [1, 1],
        };
        let loss = |x: &ArrayD<f32>, w: &ArrayD<f32>, b: &ArrayD<f32>| {
            let weight = Parameter::from_array(w.clone());
            let bias = Parameter::from_array(b.clone());
            x.conv_transpose2(&weight, Some(&bias), &args)
                .unwrap()
                .sum()
        };
        let tape = Rc::new(Tape::new());
        let input = Variable::new(&tape, x.clone(), true);
        let mut weight = Parameter::from_array(w.clone());
        weight.zero_grad();
        let mut bias = Parameter::from_array(b.clone());
        bias.zero_grad();
        input
            .conv_transpose2(&weight, Some(&bias), &args)
            .unwrap()
            .sum()
            .backward();
        check_grads(
            &input.grad().unwrap().borrow(),
            &numeric_grad(|x| loss(x, &w, &b), &x),
        );
        check_grads(
            &weight.take_grad().unwrap(),
            &numeric_grad(|w| loss(&x, w, &b), &w),
        );
        check_grads(
            &bias.take_grad().unwrap(),
            &numeric_grad(|b| loss(&x, &w, b), &b),
        );
    }

    #[test]
    fn relu_grad() {
        // Keep inputs away from the kink at 0.
        let x = Array1::from(vec![-2f32, -0.5, 0.5, 2.]).into_dyn();
        let tape = Rc::new(Tape::new());
        let input = Variable::new(&tape, x.clone(), true);
        input.relu().sum().backward();
        check_grads(
            &input.grad().unwrap().borrow(),
            &numeric_grad(|x| x.relu().sum(), &x),
        );
    }

    #[test]
    fn sigmoid_grad() {
        let mut rng = SmallRng::seed_from_u64(4);
        let x = random_array(&[5], &mut rng);
        let tape = Rc::new(Tape::new());
        let input = Variable::new(&tape, x.clone(), true);
        input.sigmoid().sum().backward();
        check_grads(
            &input.grad().unwrap().borrow(),
            &numeric_grad(|x| x.sigmoid().sum(), &x),
        );
    }

    #[test]
    fn reshape_grad_routes_through() {
        let mut rng = SmallRng::seed_from_u64(5);
        let x = random_array(&[2, 3, 2], &mut rng);
        let tape = Rc::new(Tape::new());
        let input = Variable::new(&tape, x, true);
        let out = input.flatten().unwrap();
        assert_eq!(out.shape(), &[2, 6]);
        out.sum().backward();
        let grad = input.grad().unwrap().borrow();
        assert!(grad.iter().all(|&g| g == 1.));
    }

    #[test]
    fn reparameterize_grad() {
        let mut rng = SmallRng::seed_from_u64(6);
        let mu_array = random_array(&[2, 2], &mut rng);
        let logvar_array = random_array(&[2, 2], &mut rng);
        let tape = Rc::new(Tape::new());
        let mu = Variable::new(&tape, mu_array.clone(), true);
        let logvar = Variable::new(&tape, logvar_array.clone(), true);
        let mut sample_rng = SmallRng::seed_from_u64(7);
        let z = reparameterize(&mu, &logvar, &mut sample_rng).unwrap();
        z.sum().backward();
        // z = μ + σ·ε, so dΣz/dμ = 1 and dΣz/dlogσ² = ε·σ/2 with the same ε.
        let mu_grad = mu.grad().unwrap().borrow();
        assert!(mu_grad.iter().all(|&g| g == 1.));
        let std = logvar_array.mapv(|lv| (0.5 * lv).exp());
        let eps = (&**z.value() - &mu_array) / &std;
        let expected = &eps * &std * 0.5;
        check_grads(&logvar.grad().unwrap().borrow(), &expected);
    }

    #[test]
    fn reparameterize_shape_mismatch() {
        let tape = Rc::new(Tape::new());
        let mu = Variable::new(&tape, Array2::<f32>::zeros((1, 2)), false);
        let logvar = Variable::new(&tape, Array2::<f32>::zeros((1, 3)), false);
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(reparameterize(&mu, &logvar, &mut rng).is_err());
    }
}
