use super::{
    autograd::{Parameter, Variable},
    functional::{
        Conv2 as _, Conv2Args, ConvTranspose2 as _, ConvTranspose2Args, Dense as _,
    },
    Forward, Layer,
};
use crate::result::Result;
use ndarray::{Array1, Array2, Array4};
use rand_distr::{Distribution, Normal, Uniform};
use std::fmt::{self, Debug};

fn xavier_uniform(inputs: usize, outputs: usize) -> Uniform<f32> {
    let a = (6. / (inputs + outputs) as f32).sqrt();
    Uniform::new(-a, a)
}

fn he_normal(mut inputs: usize) -> Normal<f32> {
    if inputs == 0 {
        inputs = 1;
    }
    let std_dev = (2. / inputs as f32).sqrt();
    Normal::new(0., std_dev).unwrap()
}

fn sample_vec<D: Distribution<f32>>(distribution: D, len: usize) -> Vec<f32> {
    distribution
        .sample_iter(&mut rand::thread_rng())
        .take(len)
        .collect()
}

/// Convolutional layer.
#[derive(Clone)]
pub struct Conv2 {
    weight: Parameter,
    bias: Option<Parameter>,
    args: Conv2Args,
}

impl Conv2 {
    /// Creates a new [`Conv2`] for `inputs`, `outputs`, and `kernel`.
    ///
    /// Defaults:
    /// - strides: 1
    /// - padding: 0
    /// - bias: None
    ///
    /// The weight has shape \[outputs, inputs, kernel\[0\], kernel\[1\]\] and is
    /// initialized with a uniform distribution of (-a, a) where
    /// a = sqrt(6 / (inputs + outputs)).
    pub fn from_inputs_outputs_kernel(inputs: usize, outputs: usize, kernel: [usize; 2]) -> Self {
        let [kh, kw] = kernel;
        let data = sample_vec(xavier_uniform(inputs, outputs), outputs * inputs * kh * kw);
        let weight = Parameter::from_array(
            Array4::from_shape_vec((outputs, inputs, kh, kw), data).unwrap(),
        );
        Self {
            weight,
            bias: None,
            args: Conv2Args::default(),
        }
    }
    /// Adds `strides`.
    pub fn with_strides(mut self, strides: [usize; 2]) -> Self {
        self.args.strides = strides;
        self
    }
    /// Adds `padding`.
    pub fn with_padding(mut self, padding: [usize; 2]) -> Self {
        self.args.padding = padding;
        self
    }
    /// Adds a bias to the layer, initialized with 0's.
    pub fn with_bias(mut self, bias: bool) -> Self {
        if bias {
            let outputs = self.weight.shape()[0];
            self.bias
                .replace(Parameter::from_array(Array1::zeros(outputs)));
        } else {
            self.bias = None;
        }
        self
    }
    /// The weight.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }
}

impl Debug for Conv2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Conv2");
        builder.field("weight", &self.weight);
        if let Some(bias) = self.bias.as_ref() {
            builder.field("bias", bias);
        }
        if self.args.strides.iter().any(|x| *x != 1) {
            builder.field("strides", &self.args.strides);
        }
        if self.args.padding.iter().any(|x| *x != 0) {
            builder.field("padding", &self.args.padding);
        }
        builder.finish()
    }
}

impl Forward for Conv2 {
    fn forward(&self, input: &Variable) -> Result<Variable> {
        input.conv2(&self.weight, self.bias.as_ref(), &self.args)
    }
}

impl Layer for Conv2 {
    fn parameters_len(&self) -> usize {
        1 + self.bias.is_some() as usize
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Parameter>) {
        parameters.push(&mut self.weight);
        if let Some(bias) = self.bias.as_mut() {
            parameters.push(bias);
        }
    }
}

/// Transposed convolutional layer.
///
/// Upsamples the spatial dims, mirroring a [`Conv2`] with the same strides and
/// padding.
#[derive(Clone)]
pub struct ConvTranspose2 {
    weight: Parameter,
    bias: Option<Parameter>,
    args: ConvTranspose2Args,
}

impl ConvTranspose2 {
    /// Creates a new [`ConvTranspose2`] for `inputs`, `outputs`, and `kernel`.
    ///
    /// Defaults:
    /// - strides: 1
    /// - padding: 0
    /// - output_padding: 0
    /// - bias: None
    ///
    /// The weight has shape \[inputs, outputs, kernel\[0\], kernel\[1\]\] and is
    /// initialized with a uniform distribution of (-a, a) where
    /// a = sqrt(6 / (inputs + outputs)).
    pub fn from_inputs_outputs_kernel(inputs: usize, outputs: usize, kernel: [usize; 2]) -> Self {
        let [kh, kw] = kernel;
        let data = sample_vec(xavier_uniform(inputs, outputs), inputs * outputs * kh * kw);
        let weight = Parameter::from_array(
            Array4::from_shape_vec((inputs, outputs, kh, kw), data).unwrap(),
        );
        Self {
            weight,
            bias: None,
            args: ConvTranspose2Args::default(),
        }
    }
    /// Adds `strides`.
    pub fn with_strides(mut self, strides: [usize; 2]) -> Self {
        self.args.strides = strides;
        self
    }
    /// Adds `padding`.
    pub fn with_padding(mut self, padding: [usize; 2]) -> Self {
        self.args.padding = padding;
        self
    }
    /// Adds `output_padding`, extra rows / columns appended to the output.
    ///
    /// With strides greater than 1 several input sizes map to the same output size;
    /// output padding selects among them, e.g. 7 -> 14 for kernel 3, stride 2,
    /// padding 1, output padding 1.
    pub fn with_output_padding(mut self, output_padding: [usize; 2]) -> Self {
        self.args.output_padding = output_padding;
        self
    }
    /// Adds a bias to the layer, initialized with 0's.
    pub fn with_bias(mut self, bias: bool) -> Self {
        if bias {
            let outputs = self.weight.shape()[1];
            self.bias
                .replace(Parameter::from_array(Array1::zeros(outputs)));
        } else {
            self.bias = None;
        }
        self
    }
    /// The weight.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }
}

impl Debug for ConvTranspose2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("ConvTranspose2");
        builder.field("weight", &self.weight);
        if let Some(bias) = self.bias.as_ref() {
            builder.field("bias", bias);
        }
        if self.args.strides.iter().any(|x| *x != 1) {
            builder.field("strides", &self.args.strides);
        }
        if self.args.padding.iter().any(|x| *x != 0) {
            builder.field("padding", &self.args.padding);
        }
        if self.args.output_padding.iter().any(|x| *x != 0) {
            builder.field("output_padding", &self.args.output_padding);
        }
        builder.finish()
    }
}

impl Forward for ConvTranspose2 {
    fn forward(&self, input: &Variable) -> Result<Variable> {
        input.conv_transpose2(&self.weight, self.bias.as_ref(), &self.args)
    }
}

impl Layer for ConvTranspose2 {
    fn parameters_len(&self) -> usize {
        1 + self.bias.is_some() as usize
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Parameter>) {
        parameters.push(&mut self.weight);
        if let Some(bias) = self.bias.as_mut() {
            parameters.push(bias);
        }
    }
}

/// Dense / fully connected layer.
#[derive(Clone)]
pub struct Dense {
    weight: Parameter,
    bias: Option<Parameter>,
}

impl Dense {
    /// Creates a new [`Dense`] for `inputs` and `outputs`.
    ///
    /// The weight has shape \[outputs, inputs\] and is initialized with a normal
    /// distribution with std_dev = sqrt(2 / inputs).
    pub fn from_inputs_outputs(inputs: usize, outputs: usize) -> Self {
        let data = sample_vec(he_normal(inputs), inputs * outputs);
        let weight =
            Parameter::from_array(Array2::from_shape_vec((outputs, inputs), data).unwrap());
        Self { weight, bias: None }
    }
    /// Adds a bias to the layer, initialized with 0's.
    pub fn with_bias(mut self, bias: bool) -> Self {
        if bias {
            let outputs = self.weight.shape()[0];
            self.bias
                .replace(Parameter::from_array(Array1::zeros(outputs)));
        } else {
            self.bias = None;
        }
        self
    }
    /// The weight.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }
}

impl Debug for Dense {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Dense");
        builder.field("weight", &self.weight);
        if let Some(bias) = self.bias.as_ref() {
            builder.field("bias", bias);
        }
        builder.finish()
    }
}

impl Forward for Dense {
    fn forward(&self, input: &Variable) -> Result<Variable> {
        input.dense(&self.weight, self.bias.as_ref())
    }
}

impl Layer for Dense {
    fn parameters_len(&self) -> usize {
        1 + self.bias.is_some() as usize
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Parameter>) {
        parameters.push(&mut self.weight);
        if let Some(bias) = self.bias.as_mut() {
            parameters.push(bias);
        }
    }
}
