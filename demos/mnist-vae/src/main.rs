use clap::Parser;
use image::{GrayImage, Luma};
use ndarray::{Array1, Array2, Array4, ArrayView3};
use std::path::{Path, PathBuf};
use vaegraph::{
    dataset::{mnist::Mnist, Dataset},
    latent::{LatentEmbedding, LatentGrid, Mosaic},
    learn::{
        criterion::Elbo,
        vae::{Vae, VaeTrainer},
        Summarize, Train,
    },
    neural_network::optimizer::Sgd,
    pipeline::{InsertChannelAxis, Normalize, ToClasses, Transform},
    result::Result,
};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Train a VAE on MNIST, decode a latent grid into a mosaic, and embed the test set"
)]
struct Args {
    /// Number of training epochs.
    #[arg(long, default_value_t = 10)]
    epochs: usize,
    /// Training batch size.
    #[arg(long, default_value_t = 128)]
    train_batch_size: usize,
    /// Evaluation batch size.
    #[arg(long, default_value_t = 1_000)]
    test_batch_size: usize,
    /// Learning rate.
    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f32,
    /// SGD momentum.
    #[arg(long, default_value_t = 0.9)]
    momentum: f32,
    /// Weight of the KL divergence term; 1 is the standard ELBO.
    #[arg(long, default_value_t = 1.0)]
    beta: f32,
    /// Encoder channel schedule, one entry per stride 2 stage.
    #[arg(long, value_delimiter = ',', default_values_t = [32usize, 64])]
    channels: Vec<usize>,
    /// Latent grid steps per axis for the generated mosaic.
    #[arg(long, default_value_t = 21)]
    grid_steps: usize,
    /// Folder the dataset is downloaded to. Defaults to the OS downloads directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Folder the mosaic and plots are written to.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
    /// Seed for reparameterization sampling.
    #[arg(long)]
    seed: Option<u64>,
    /// Also write the training summary as summary.json.
    #[arg(long)]
    summary: bool,
}

// Stream normalized, channel first batches from raw image views.
fn batch_iter<'a>(
    images: &'a ArrayView3<'a, u8>,
    batch_size: usize,
    shuffle: bool,
) -> impl Iterator<Item = Result<Array4<f32>>> + 'a {
    let pipeline = Normalize::default().then(InsertChannelAxis);
    images
        .batches(batch_size, shuffle)
        .map(move |batch| pipeline.apply(batch?.view()))
}

fn save_grayscale(pixels: &Array2<u8>, path: &Path) -> Result<()> {
    let (height, width) = pixels.dim();
    let mut img = GrayImage::new(width as u32, height as u32);
    for ((row, col), &value) in pixels.indexed_iter() {
        img.put_pixel(col as u32, row as u32, Luma([value]));
    }
    img.save(path)?;
    Ok(())
}

// Utility function used for rendering the latent scatter plot.
#[cfg(feature = "plotters")]
fn plot(embedding: &LatentEmbedding, fpath: &Path) -> Result<()> {
    use plotters::prelude::*;
    let (width, height) = (1024, 760);
    let root = BitMapBackend::new(fpath, (width, height)).into_drawing_area();
    root.fill(&WHITE)?;
    let root = root.titled(
        "Latent space of the MNIST test set",
        ("sans-serif", 40).into_font(),
    )?;
    let codes = embedding.codes();
    let bound = |axis: usize, init: f32, f: &dyn Fn(f32, f32) -> f32| {
        codes.column(axis).iter().copied().fold(init, |a, x| f(a, x))
    };
    let (x0, x1) = (
        bound(0, f32::INFINITY, &f32::min) - 0.5,
        bound(0, f32::NEG_INFINITY, &f32::max) + 0.5,
    );
    let (y0, y1) = (
        bound(1, f32::INFINITY, &f32::min) - 0.5,
        bound(1, f32::NEG_INFINITY, &f32::max) + 0.5,
    );
    let mut chart = ChartBuilder::on(&root)
        .margin(40)
        .x_label_area_size(40)
        .y_label_area_size(40)
        .build_cartesian_2d(x0..x1, y0..y1)?;
    chart.configure_mesh().draw()?;
    chart.draw_series(
        codes
            .outer_iter()
            .zip(embedding.classes().iter())
            .map(|(code, &class)| {
                Circle::new(
                    (code[0], code[1]),
                    2,
                    Palette99::pick(class as usize).filled(),
                )
            }),
    )?;
    root.present()?;
    println!("latent scatter saved to {:?}", fpath);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    // Stage 1: data acquisition. Files already present are not downloaded again.
    let mnist = match args.data_dir.as_deref() {
        Some(dir) => Mnist::builder().path(dir).download(true).build()?,
        None => Mnist::builder().download(true).build()?,
    };
    println!(
        "loaded {} train / {} test samples",
        mnist.train_count(),
        mnist.test_count(),
    );

    // Stage 3: model training.
    let vae = Vae::builder()
        .latent_dim(2)
        .channels(args.channels.clone())
        .image_dim(28)
        .build()?;
    let optimizer = Sgd::builder().momentum(args.momentum).build();
    let mut trainer = VaeTrainer::from(vae)
        .with_optimizer(optimizer)
        .with_learning_rate(args.learning_rate)
        .with_criterion(Elbo::new(args.beta));
    if let Some(seed) = args.seed {
        trainer = trainer.with_seed(seed);
    }
    let train_images = mnist.train_images();
    let test_images = mnist.test_images();
    while trainer.summarize().epoch < args.epochs {
        let train_iter = batch_iter(&train_images, args.train_batch_size, true);
        let test_iter = batch_iter(&test_images, args.test_batch_size, false);
        trainer.train_test(train_iter, test_iter)?;
        let summary = trainer.summarize();
        let nan = f32::NAN;
        println!(
            "epoch: {} elapsed: {:.0?} train_loss: {:.5} (recon {:.5} kl {:.5}) test_loss: {:.5}",
            summary.epoch,
            summary.total_time,
            summary.train.loss().unwrap_or(nan),
            summary.train.reconstruction().unwrap_or(nan),
            summary.train.kl().unwrap_or(nan),
            summary.test.loss().unwrap_or(nan),
        );
    }
    let summary = trainer.summarize();
    let vae = trainer.into_vae();

    // Stage 4a: decode a latent grid into one mosaic image.
    let grid = LatentGrid::new(args.grid_steps)?;
    let tiles = vae.generate(grid.points().view())?;
    let mosaic = Mosaic::from_tiles(tiles.view(), grid.steps())?;
    let mosaic_path = args.output_dir.join("mosaic.png");
    save_grayscale(&mosaic.to_pixels(), &mosaic_path)?;
    println!(
        "{}x{} mosaic saved to {:?}",
        mosaic.array().nrows(),
        mosaic.array().ncols(),
        mosaic_path,
    );

    // Stage 4b: embed every test sample at its deterministic latent mean.
    let pipeline = Normalize::default().then(InsertChannelAxis);
    let label_pipeline = ToClasses::default();
    let test_set = (test_images, mnist.test_classes());
    let embedding = LatentEmbedding::from_batches(
        test_set
            .batches(args.test_batch_size, false)
            .map(|batch| -> Result<(Array2<f32>, Array1<u8>)> {
                let (images, classes) = batch?;
                let images = pipeline.apply(images.view())?;
                let codes = vae.embed(images.view())?;
                let classes = label_pipeline.apply(classes.view())?;
                Ok((codes, classes))
            }),
    )?;
    println!("embedded {} test samples", embedding.len());

    if args.summary {
        let summary_path = args.output_dir.join("summary.json");
        serde_json::to_writer_pretty(std::fs::File::create(&summary_path)?, &summary)?;
        println!("summary saved to {:?}", summary_path);
    }

    if !cfg!(feature = "plotters") {
        println!(
            "Feature plotters not enabled, scatter not generated. Try running with:\n\tcargo run --features plotters"
        );
    }
    #[cfg(feature = "plotters")]
    plot(&embedding, &args.output_dir.join("latent.png"))?;
    Ok(())
}
