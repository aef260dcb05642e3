/*!
A variational autoencoder library for Rust.

`vaegraph` trains a convolutional [VAE](learn::vae::Vae) on image data, generates new
images by decoding a grid over the latent space, and embeds samples into the latent
space for cluster visualization.

The typical workflow has four stages:
1. Load a dataset, for example [`Mnist`](dataset::mnist::Mnist).
2. Preprocess batches with a composed [`pipeline`] (normalize to \[0, 1\], insert the
   channel axis).
3. Train with a [`VaeTrainer`](learn::vae::VaeTrainer) for a fixed number of epochs.
4. Decode a [`LatentGrid`](latent::LatentGrid) into a [`Mosaic`](latent::Mosaic) and
   collect a [`LatentEmbedding`](latent::LatentEmbedding) of the test set.

See `demos/mnist-vae` for an end to end example.
*/

/// Result type.
pub mod result;

/// Datasets.
#[cfg(feature = "dataset")]
pub mod dataset;

/// Preprocessing transforms.
pub mod pipeline;

/// Neural network building blocks: autograd, functional ops, layers, optimizers.
pub mod neural_network;

/// Training and evaluation.
pub mod learn;

/// Latent space sampling, mosaics, and embeddings.
pub mod latent;

pub use ndarray;
