use super::{
    criterion::{Criterion, Elbo},
    Stats, Summarize, Summary, Test, Train,
};
use crate::neural_network::{
    autograd::{Parameter, Tape, Variable},
    functional::{reparameterize, Relu as _, Sigmoid as _},
    layer::{Conv2, ConvTranspose2, Dense},
    optimizer::{Optimizer, Sgd},
    Forward, Layer,
};
use crate::result::Result;
use anyhow::ensure;
use ndarray::{Array2, Array4, ArrayView2, ArrayView4};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::rc::Rc;

/// Vae builder.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Vae`].
    #[derive(Clone, Debug)]
    pub struct VaeBuilder {
        pub(super) latent_dim: usize,
        pub(super) channels: Vec<usize>,
        pub(super) image_dim: usize,
        pub(super) input_channels: usize,
    }

    impl Default for VaeBuilder {
        fn default() -> Self {
            Self {
                latent_dim: 2,
                channels: vec![32, 64],
                image_dim: 28,
                input_channels: 1,
            }
        }
    }

    impl VaeBuilder {
        /// The dimensionality of the latent space. Defaults to 2, which the latent
        /// grid and scatter visualizations require.
        pub fn latent_dim(self, latent_dim: usize) -> Self {
            Self { latent_dim, ..self }
        }
        /// The channel schedule of the encoder, one entry per stride 2 stage. The
        /// decoder mirrors it. Defaults to \[32, 64\].
        pub fn channels(self, channels: impl Into<Vec<usize>>) -> Self {
            Self {
                channels: channels.into(),
                ..self
            }
        }
        /// Height and width of the (square) input images. Defaults to 28.
        pub fn image_dim(self, image_dim: usize) -> Self {
            Self { image_dim, ..self }
        }
        /// Channels of the input images. Defaults to 1.
        pub fn input_channels(self, input_channels: usize) -> Self {
            Self {
                input_channels,
                ..self
            }
        }
        /// Builds the model.
        ///
        /// **Errors**
        /// - The latent dim or a channel count is 0.
        /// - The channel schedule is empty.
        /// - A stride 2 stage does not divide the spatial dims evenly.
        pub fn build(&self) -> Result<Vae> {
            Vae::build(self)
        }
    }
}
use builder::VaeBuilder;

/// A variational autoencoder.
///
/// The encoder is a stack of stride 2 convolutions (kernel 3, padding 1, each halving
/// the spatial dims) followed by dense μ and logσ² heads. The decoder mirrors it with
/// transposed convolutions. [`encode`](Self::encode) maps images to a latent
/// distribution, [`decode`](Self::decode) maps latent vectors back to image logits.
pub struct Vae {
    convs: Vec<Conv2>,
    dense_mu: Dense,
    dense_logvar: Dense,
    dense_decode: Dense,
    deconvs: Vec<ConvTranspose2>,
    latent_dim: usize,
    image_dim: usize,
    input_channels: usize,
    feature_shape: [usize; 3],
}

impl Vae {
    /// Returns a [`VaeBuilder`] used to specify options.
    ///
    /// ```no_run
    /// # use vaegraph::{learn::vae::Vae, result::Result};
    /// # fn main() -> Result<()> {
    /// let vae = Vae::builder()
    ///     .latent_dim(2)
    ///     .channels([32, 64])
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> VaeBuilder {
        VaeBuilder::default()
    }
    fn build(builder: &VaeBuilder) -> Result<Self> {
        ensure!(builder.latent_dim > 0, "Latent dim must be positive!");
        ensure!(
            !builder.channels.is_empty(),
            "Channel schedule must not be empty!",
        );
        ensure!(
            builder.input_channels > 0,
            "Input channels must be positive!",
        );
        let mut convs = Vec::with_capacity(builder.channels.len());
        let mut inputs = builder.input_channels;
        let mut dim = builder.image_dim;
        for &outputs in builder.channels.iter() {
            ensure!(outputs > 0, "Channel count must be positive!");
            ensure!(
                dim >= 2 && dim % 2 == 0,
                "Image dim {} is not divisible by stride 2 across {} stages!",
                builder.image_dim,
                builder.channels.len(),
            );
            convs.push(
                Conv2::from_inputs_outputs_kernel(inputs, outputs, [3, 3])
                    .with_strides([2, 2])
                    .with_padding([1, 1])
                    .with_bias(true),
            );
            inputs = outputs;
            dim /= 2;
        }
        let feature_shape = [*builder.channels.last().unwrap(), dim, dim];
        let feature_len = feature_shape.iter().product();
        let dense_mu = Dense::from_inputs_outputs(feature_len, builder.latent_dim).with_bias(true);
        let dense_logvar =
            Dense::from_inputs_outputs(feature_len, builder.latent_dim).with_bias(true);
        let dense_decode =
            Dense::from_inputs_outputs(builder.latent_dim, feature_len).with_bias(true);
        let mut deconvs = Vec::with_capacity(builder.channels.len());
        let mut inputs = *builder.channels.last().unwrap();
        for &outputs in builder
            .channels
            .iter()
            .rev()
            .skip(1)
            .chain(std::iter::once(&builder.input_channels))
        {
            deconvs.push(
                ConvTranspose2::from_inputs_outputs_kernel(inputs, outputs, [3, 3])
                    .with_strides([2, 2])
                    .with_padding([1, 1])
                    .with_output_padding([1, 1])
                    .with_bias(true),
            );
            inputs = outputs;
        }
        Ok(Self {
            convs,
            dense_mu,
            dense_logvar,
            dense_decode,
            deconvs,
            latent_dim: builder.latent_dim,
            image_dim: builder.image_dim,
            input_channels: builder.input_channels,
            feature_shape,
        })
    }
    /// The dimensionality of the latent space.
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }
    /// Height and width of the input images.
    pub fn image_dim(&self) -> usize {
        self.image_dim
    }
    /// Channels of the input images.
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }
    /// Encodes images (\[n, c, h, w\]) into (μ, logσ²), each \[n, latent_dim\].
    pub fn encode(&self, input: &Variable) -> Result<(Variable, Variable)> {
        let mut h = input.clone();
        for conv in self.convs.iter() {
            h = conv.forward(&h)?.relu();
        }
        let h = h.flatten()?;
        let mu = self.dense_mu.forward(&h)?;
        let logvar = self.dense_logvar.forward(&h)?;
        Ok((mu, logvar))
    }
    /// Decodes latent vectors (\[n, latent_dim\]) into image logits (\[n, c, h, w\]).
    ///
    /// The output is in logit space; apply a sigmoid (or use
    /// [`generate`](Self::generate)) to obtain pixel intensities.
    pub fn decode(&self, z: &Variable) -> Result<Variable> {
        let batch_size = z.shape()[0];
        let [c, fh, fw] = self.feature_shape;
        let mut h = self
            .dense_decode
            .forward(z)?
            .relu()
            .reshape(&[batch_size, c, fh, fw])?;
        for (i, deconv) in self.deconvs.iter().enumerate() {
            h = deconv.forward(&h)?;
            if i + 1 < self.deconvs.len() {
                h = h.relu();
            }
        }
        Ok(h)
    }
    /// The full training forward pass: encode, sample z with the reparameterization
    /// trick, decode.
    pub fn forward<R: Rng>(&self, input: &Variable, rng: &mut R) -> Result<VaeOutput> {
        let (mu, logvar) = self.encode(input)?;
        let z = reparameterize(&mu, &logvar, rng)?;
        let reconstruction = self.decode(&z)?;
        Ok(VaeOutput {
            reconstruction,
            mu,
            logvar,
        })
    }
    /// Embeds images into the latent space deterministically, returning μ
    /// (\[n, latent_dim\]) without sampling.
    pub fn embed(&self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        let tape = Rc::new(Tape::new());
        let input = Variable::new(&tape, images.to_owned(), false);
        let (mu, _) = self.encode(&input)?;
        Ok(mu.into_array().into_dimensionality()?)
    }
    /// Decodes latent vectors into images with pixel intensities in \[0, 1\].
    pub fn generate(&self, latents: ArrayView2<f32>) -> Result<Array4<f32>> {
        let tape = Rc::new(Tape::new());
        let z = Variable::new(&tape, latents.to_owned(), false);
        let logits = self.decode(&z)?;
        Ok(logits.value().sigmoid().into_dimensionality()?)
    }
    /// Reconstructs images through the deterministic latent mean.
    pub fn reconstruct(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        let latents = self.embed(images)?;
        self.generate(latents.view())
    }
    /// The number of parameters.
    pub fn parameters_len(&self) -> usize {
        let convs: usize = self.convs.iter().map(Layer::parameters_len).sum();
        let deconvs: usize = self.deconvs.iter().map(Layer::parameters_len).sum();
        convs
            + deconvs
            + self.dense_mu.parameters_len()
            + self.dense_logvar.parameters_len()
            + self.dense_decode.parameters_len()
    }
    /// Enumerates mutable references to all parameters.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        for conv in self.convs.iter_mut() {
            conv.collect_parameters_mut(&mut parameters);
        }
        self.dense_mu.collect_parameters_mut(&mut parameters);
        self.dense_logvar.collect_parameters_mut(&mut parameters);
        self.dense_decode.collect_parameters_mut(&mut parameters);
        for deconv in self.deconvs.iter_mut() {
            deconv.collect_parameters_mut(&mut parameters);
        }
        parameters
    }
    /// Readies all parameters for a backward pass by zeroing their gradients.
    pub fn zero_grads(&mut self) {
        for parameter in self.parameters_mut() {
            parameter.zero_grad();
        }
    }
    /// Drops all parameter gradients.
    pub fn none_grads(&mut self) {
        for parameter in self.parameters_mut() {
            parameter.none_grad();
        }
    }
}

/// Output of the training forward pass.
#[derive(Debug)]
pub struct VaeOutput {
    /// Reconstruction logits, \[n, c, h, w\].
    pub reconstruction: Variable,
    /// Latent means, \[n, latent_dim\].
    pub mu: Variable,
    /// Latent log variances, \[n, latent_dim\].
    pub logvar: Variable,
}

/// Trains a [`Vae`] with mini-batch gradient descent.
///
/// Each training batch runs a stochastic forward pass, evaluates the [`Elbo`], runs
/// the backward pass, and applies one [`Sgd`] step. Evaluation uses the deterministic latent mean and leaves the model
/// unchanged.
pub struct VaeTrainer {
    vae: Vae,
    optimizer: Sgd,
    learning_rate: f32,
    criterion: Elbo,
    summary: Summary,
    rng: SmallRng,
}

impl From<Vae> for VaeTrainer {
    fn from(vae: Vae) -> Self {
        Self {
            vae,
            optimizer: Sgd::builder().build(),
            learning_rate: 1e-3,
            criterion: Elbo::default(),
            summary: Summary::default(),
            rng: SmallRng::from_entropy(),
        }
    }
}

impl VaeTrainer {
    /// Adds an optimizer. Defaults to plain SGD.
    pub fn with_optimizer(mut self, optimizer: Sgd) -> Self {
        self.optimizer = optimizer;
        self
    }
    /// Adds a learning rate. Defaults to 1e-3.
    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }
    /// Adds a criterion. Defaults to [`Elbo`] with β = 1.
    pub fn with_criterion(mut self, criterion: Elbo) -> Self {
        self.criterion = criterion;
        self
    }
    /// Seeds the rng used for reparameterization sampling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
    /// The model.
    pub fn vae(&self) -> &Vae {
        &self.vae
    }
    /// Unwraps the trained model.
    pub fn into_vae(self) -> Vae {
        self.vae
    }
    fn train_batch(&mut self, batch: Array4<f32>) -> Result<(usize, f32, f32, f32)> {
        let count = batch.shape()[0];
        ensure!(count > 0, "Empty batch!");
        let tape = Rc::new(Tape::new());
        self.vae.zero_grads();
        let input = Variable::new(&tape, batch.clone(), false);
        let output = self.vae.forward(&input, &mut self.rng)?;
        let target = batch.into_dyn();
        let elbo = self.criterion.eval(&output, target.view())?;
        elbo.loss.backward();
        let loss = *elbo.loss.value().first().unwrap();
        let mut parameters = self.vae.parameters_mut();
        self.optimizer.update(self.learning_rate, &mut parameters)?;
        log::debug!(
            "train batch: count {} loss {:.5} reconstruction {:.5} kl {:.5}",
            count,
            loss,
            elbo.reconstruction,
            elbo.kl,
        );
        Ok((count, loss, elbo.reconstruction, elbo.kl))
    }
    fn eval_batch(&self, batch: Array4<f32>) -> Result<(usize, f32, f32, f32)> {
        let count = batch.shape()[0];
        ensure!(count > 0, "Empty batch!");
        let tape = Rc::new(Tape::new());
        let input = Variable::new(&tape, batch.clone(), false);
        let (mu, logvar) = self.vae.encode(&input)?;
        // z = μ at evaluation, no stochastic sampling.
        let reconstruction = self.vae.decode(&mu)?;
        let output = VaeOutput {
            reconstruction,
            mu,
            logvar,
        };
        let target = batch.into_dyn();
        let elbo = self.criterion.eval(&output, target.view())?;
        let loss = *elbo.loss.value().first().unwrap();
        Ok((count, loss, elbo.reconstruction, elbo.kl))
    }
}

impl Train<Array4<f32>> for VaeTrainer {
    fn train_test<I1, I2>(&mut self, train_iter: I1, test_iter: I2) -> Result<(Stats, Stats)>
    where
        I1: IntoIterator<Item = Result<Array4<f32>>>,
        I2: IntoIterator<Item = Result<Array4<f32>>>,
    {
        let mut summary = std::mem::take(&mut self.summary);
        let mut train_iter = Some(train_iter);
        let mut test_iter = Some(test_iter);
        let result = summary.run_epoch(|_| {
            let mut train_stats = Stats::default();
            for batch in train_iter.take().unwrap() {
                let (count, loss, reconstruction, kl) = self.train_batch(batch?)?;
                train_stats.update(count, loss, reconstruction, kl);
            }
            let test_stats = self.test(test_iter.take().unwrap())?;
            Ok((train_stats, test_stats))
        });
        self.summary = summary;
        result
    }
}

impl Test<Array4<f32>> for VaeTrainer {
    fn test<I>(&self, test_iter: I) -> Result<Stats>
    where
        I: IntoIterator<Item = Result<Array4<f32>>>,
    {
        let mut stats = Stats::default();
        for batch in test_iter {
            let (count, loss, reconstruction, kl) = self.eval_batch(batch?)?;
            stats.update(count, loss, reconstruction, kl);
        }
        Ok(stats)
    }
}

impl Summarize for VaeTrainer {
    fn summarize(&self) -> Summary {
        self.summary.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;
    use rand::Rng;

    fn small_vae() -> Vae {
        Vae::builder()
            .latent_dim(2)
            .channels([4, 8])
            .image_dim(8)
            .build()
            .unwrap()
    }

    fn random_images(count: usize, dim: usize) -> Array4<f32> {
        let mut rng = SmallRng::seed_from_u64(21);
        Array4::from_shape_simple_fn((count, 1, dim, dim), || rng.gen_range(0f32..1.))
    }

    #[test]
    fn builder_validates() {
        assert!(Vae::builder().latent_dim(0).build().is_err());
        assert!(Vae::builder().channels(Vec::new()).build().is_err());
        // 7 is not divisible by 2.
        assert!(Vae::builder().image_dim(7).build().is_err());
        // 28 -> 14 -> 7 -> error on the third stage.
        assert!(Vae::builder().channels([8, 16, 32]).build().is_err());
    }

    #[test]
    fn encode_decode_shapes() {
        let vae = small_vae();
        let images = random_images(3, 8);
        let tape = Rc::new(Tape::new());
        let input = Variable::new(&tape, images, false);
        let (mu, logvar) = vae.encode(&input).unwrap();
        assert_eq!(mu.shape(), &[3, 2]);
        assert_eq!(logvar.shape(), &[3, 2]);
        let logits = vae.decode(&mu).unwrap();
        assert_eq!(logits.shape(), &[3, 1, 8, 8]);
    }

    #[test]
    fn parameters_len_matches() {
        let mut vae = small_vae();
        assert_eq!(vae.parameters_len(), vae.parameters_mut().len());
        // 2 convs + 2 deconvs + 3 dense, each with weight and bias.
        assert_eq!(vae.parameters_len(), 14);
    }

    #[test]
    fn embed_is_deterministic() {
        let vae = small_vae();
        let images = random_images(5, 8);
        let a = vae.embed(images.view()).unwrap();
        let b = vae.embed(images.view()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), (5, 2));
    }

    #[test]
    fn generate_in_unit_interval() {
        let vae = small_vae();
        let latents = Array2::from_shape_vec((4, 2), vec![0., 0., 1., -1., -2., 2., 3., 3.])
            .unwrap();
        let images = vae.generate(latents.view()).unwrap();
        assert_eq!(images.dim(), (4, 1, 8, 8));
        assert!(images.iter().all(|&x| (0. ..=1.).contains(&x)));
    }

    #[test]
    fn embed_counts_match_batches() {
        let vae = small_vae();
        let images = random_images(10, 8);
        let mut count = 0;
        for chunk in images.axis_chunks_iter(Axis(0), 3) {
            count += vae.embed(chunk).unwrap().nrows();
        }
        assert_eq!(count, 10);
    }

    #[test]
    fn trainer_runs_an_epoch() {
        let vae = small_vae();
        let mut trainer = VaeTrainer::from(vae)
            .with_learning_rate(1e-2)
            .with_seed(0);
        let images = random_images(8, 8);
        let batches: Vec<_> = images
            .axis_chunks_iter(Axis(0), 4)
            .map(|b| Ok(b.to_owned()))
            .collect();
        let test_batches: Vec<_> = images
            .axis_chunks_iter(Axis(0), 4)
            .map(|b| Ok(b.to_owned()))
            .collect();
        let (train, test) = trainer.train_test(batches, test_batches).unwrap();
        assert_eq!(train.count(), 8);
        assert_eq!(test.count(), 8);
        assert!(train.loss().unwrap().is_finite());
        assert_eq!(trainer.summarize().epoch, 1);
    }
}
