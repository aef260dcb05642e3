use ndarray::{Array1, Array2, Array4, Axis};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use vaegraph::{
    latent::{LatentEmbedding, LatentGrid, Mosaic},
    learn::{
        vae::{Vae, VaeTrainer},
        Summarize, Test, Train,
    },
    neural_network::optimizer::Sgd,
    result::Result,
};

const IMAGE_DIM: usize = 8;

// Two synthetic classes: images bright in the top half vs the bottom half, with a
// little noise. Easy enough for a tiny VAE to reconstruct within a few epochs.
fn synthetic_set(count: usize, rng: &mut SmallRng) -> (Array4<f32>, Array1<u8>) {
    let classes = Array1::from_shape_fn(count, |i| (i % 2) as u8);
    let images = Array4::from_shape_fn((count, 1, IMAGE_DIM, IMAGE_DIM), |(n, _, i, _)| {
        let top = classes[n] == 0;
        let bright = if top { i < IMAGE_DIM / 2 } else { i >= IMAGE_DIM / 2 };
        let base: f32 = if bright { 0.9 } else { 0.1 };
        (base + rng.gen_range(-0.05f32..0.05)).clamp(0., 1.)
    });
    (images, classes)
}

fn batches(images: &Array4<f32>, batch_size: usize) -> Vec<Result<Array4<f32>>> {
    images
        .axis_chunks_iter(Axis(0), batch_size)
        .map(|batch| Ok(batch.to_owned()))
        .collect()
}

fn small_vae() -> Result<Vae> {
    Vae::builder()
        .latent_dim(2)
        .channels([4, 8])
        .image_dim(IMAGE_DIM)
        .build()
}

#[test]
fn training_reduces_reconstruction_loss() -> Result<()> {
    let mut rng = SmallRng::seed_from_u64(42);
    let (images, _) = synthetic_set(64, &mut rng);
    let mut trainer = VaeTrainer::from(small_vae()?)
        .with_optimizer(Sgd::builder().momentum(0.9).build())
        .with_learning_rate(5e-3)
        .with_seed(0);
    let untrained = trainer.test(batches(&images, 16))?;
    for _ in 0..25 {
        trainer.train_test(batches(&images, 16), batches(&images, 16))?;
    }
    let trained = trainer.summarize().test;
    assert!(
        trained.reconstruction().unwrap() < untrained.reconstruction().unwrap(),
        "reconstruction did not improve: {:?} -> {:?}",
        untrained.reconstruction(),
        trained.reconstruction(),
    );
    Ok(())
}

#[test]
fn workflow_produces_mosaic_and_embedding() -> Result<()> {
    let mut rng = SmallRng::seed_from_u64(7);
    let (train_images, _) = synthetic_set(32, &mut rng);
    let (test_images, test_classes) = synthetic_set(20, &mut rng);
    let mut trainer = VaeTrainer::from(small_vae()?)
        .with_learning_rate(1e-2)
        .with_seed(1);
    for _ in 0..2 {
        trainer.train_test(batches(&train_images, 8), batches(&test_images, 8))?;
    }
    assert_eq!(trainer.summarize().epoch, 2);
    let vae = trainer.into_vae();

    // Decode a latent grid into a mosaic of exactly (steps * image_dim)^2 pixels.
    let grid = LatentGrid::new(5)?;
    let tiles = vae.generate(grid.points().view())?;
    assert_eq!(tiles.dim(), (25, 1, IMAGE_DIM, IMAGE_DIM));
    let mosaic = Mosaic::from_tiles(tiles.view(), grid.steps())?;
    assert_eq!(mosaic.array().dim(), (5 * IMAGE_DIM, 5 * IMAGE_DIM));
    assert!(mosaic.array().iter().all(|&x| (0. ..=1.).contains(&x)));

    // Embed every test sample; the count must match the test set.
    let embedding = LatentEmbedding::from_batches(
        test_images
            .axis_chunks_iter(Axis(0), 8)
            .zip(test_classes.axis_chunks_iter(Axis(0), 8))
            .map(|(images, classes)| -> Result<(Array2<f32>, Array1<u8>)> {
                Ok((vae.embed(images)?, classes.to_owned()))
            }),
    )?;
    assert_eq!(embedding.len(), 20);
    assert_eq!(embedding.codes().dim(), (20, 2));
    assert!(embedding.classes().iter().all(|&class| class < 10));
    Ok(())
}
