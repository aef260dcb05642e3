use super::Split;
use crate::result::Result;
use anyhow::ensure;
use byteorder::{BigEndian, ReadBytesExt};
use downloader::{Download, Downloader};
use flate2::read::GzDecoder;
use http::StatusCode;
use ndarray::{ArcArray, ArcArray1, ArrayView1, ArrayView3, Axis, Ix3};
use std::{
    fs::{self, File},
    path::Path,
};

/// The kind of Mnist.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MnistKind {
    /// [MNIST](<http://yann.lecun.com/exdb/mnist/>)
    Digits,
    /// [FashionMNIST](<https://github.com/zalandoresearch/fashion-mnist>)
    Fashion,
}

/// Mnist builder.
pub mod builders {
    use super::{Mnist, MnistKind, Result};
    use std::path::Path;

    /// Mnist builder.
    #[derive(Debug)]
    pub struct MnistBuilder<'a> {
        pub(super) path: Option<&'a Path>,
        pub(super) kind: MnistKind,
        pub(super) download: bool,
    }

    impl Default for MnistBuilder<'_> {
        fn default() -> Self {
            Self {
                path: None,
                kind: MnistKind::Digits,
                download: false,
            }
        }
    }

    impl MnistBuilder<'_> {
        /// The path to load the dataset from.
        ///
        /// This is the folder the files will be downloaded to / loaded from. If not
        /// specified, uses the OS specific "Downloads" directory or the "Temp"
        /// directory.
        pub fn path(self, path: &Path) -> MnistBuilder {
            MnistBuilder {
                path: Some(path),
                kind: self.kind,
                download: self.download,
            }
        }
        /// The kind of Mnist to use. Defaults to [`MnistKind::Digits`] (ie the
        /// original MNIST dataset).
        pub fn kind(self, kind: MnistKind) -> Self {
            Self { kind, ..self }
        }
        /// Whether to download the data. Defaults to false.
        pub fn download(self, download: bool) -> Self {
            Self { download, ..self }
        }
        /// Builds the dataset.
        ///
        /// **Errors**
        /// - The download failed.
        /// - The files were not found.
        /// - Decompressing / loading the data failed.
        pub fn build(&self) -> Result<Mnist> {
            Mnist::build(self)
        }
    }
}
use builders::MnistBuilder;

/// The MNIST dataset of 28×28 grayscale digit images.
///
/// The train and test splits are concatenated, train first; the per sample
/// provenance is preserved and can be queried with [`split_of`](Mnist::split_of) or
/// via the split accessors.
#[derive(Clone)]
pub struct Mnist {
    kind: MnistKind,
    images: ArcArray<u8, Ix3>,
    classes: ArcArray1<u8>,
    train_count: usize,
    test_count: usize,
}

impl Mnist {
    /// Returns an [`MnistBuilder`] used to specify options.
    ///
    /// ```no_run
    /// # use vaegraph::{dataset::mnist::Mnist, result::Result};
    /// # fn main() -> Result<()> {
    /// let mnist = Mnist::builder().download(true).build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> MnistBuilder<'static> {
        MnistBuilder::default()
    }
    fn build(builder: &MnistBuilder) -> Result<Self> {
        use std::io::Read;
        let mnist_name = match builder.kind {
            MnistKind::Digits => "mnist",
            MnistKind::Fashion => "fashion-mnist",
        };
        let mnist_path = builder
            .path
            .map(Path::to_owned)
            .unwrap_or_else(|| dirs::download_dir().unwrap_or_else(std::env::temp_dir))
            .join(mnist_name);
        let names = &[
            "train-images-idx3-ubyte",
            "train-labels-idx1-ubyte",
            "t10k-images-idx3-ubyte",
            "t10k-labels-idx1-ubyte",
        ];
        if builder.download {
            fs::create_dir_all(&mnist_path)?;
            let names: Vec<_> = names
                .iter()
                .filter(|name| !mnist_path.join(name).with_extension("gz").exists())
                .collect();
            if !names.is_empty() {
                let downloads: Vec<_> = names
                    .iter()
                    .map(|name| {
                        let path = mnist_path.join(name).with_extension("gz");
                        let url = match builder.kind {
                            MnistKind::Digits => {
                                format!("http://yann.lecun.com/exdb/mnist/{}.gz", name)
                            }
                            MnistKind::Fashion => format!(
                                "http://fashion-mnist.s3-website.eu-central-1.amazonaws.com/{}.gz",
                                name
                            ),
                        };
                        log::info!("downloading {}", url);
                        Download::new(&url).file_name(&path)
                    })
                    .collect();
                let mut downloader = Downloader::builder()
                    .download_folder(&mnist_path)
                    .retries(10)
                    .build()?;
                let summaries = std::thread::spawn(move || downloader.download(&downloads))
                    .join()
                    .unwrap()?;
                for summary in summaries {
                    match summary {
                        Ok(_) => (),
                        Err(downloader::Error::Download(summary)) => {
                            if let Some((_, status)) = summary.status.last() {
                                let status = StatusCode::from_u16(*status)?;
                                ensure!(
                                    status.is_success(),
                                    "Download failed with status code {}!",
                                    status,
                                );
                            }
                        }
                        _ => {
                            summary?;
                        }
                    }
                }
            }
        }
        let mut images = Vec::new();
        let mut labels = Vec::new();
        let mut image_counts = [0, 0];
        let mut label_counts = [0, 0];
        for &name in names.iter() {
            let (train, image) = match name {
                "train-images-idx3-ubyte" => (true, true),
                "train-labels-idx1-ubyte" => (true, false),
                "t10k-images-idx3-ubyte" => (false, true),
                "t10k-labels-idx1-ubyte" => (false, false),
                _ => unreachable!(),
            };
            let magic = if image { 2_051 } else { 2_049 };
            let gz_path = mnist_path.join(name).with_extension("gz");
            let mut data = Vec::new();
            let mut decoder = GzDecoder::new(File::open(&gz_path)?);
            ensure!(
                decoder.read_i32::<BigEndian>()? == magic,
                "{:?} has the wrong magic number!",
                gz_path,
            );
            let count = decoder.read_i32::<BigEndian>()?;
            ensure!(count >= 0, "{:?} has a negative sample count!", gz_path);
            let count = count as usize;
            if image {
                ensure!(decoder.read_i32::<BigEndian>()? == 28, "{:?}", gz_path);
                ensure!(decoder.read_i32::<BigEndian>()? == 28, "{:?}", gz_path);
            }
            decoder.read_to_end(&mut data)?;
            if image {
                ensure!(
                    data.len() == count * 28 * 28,
                    "{:?} is truncated!",
                    gz_path,
                );
                image_counts[!train as usize] = count;
                images.extend(&data);
            } else {
                ensure!(data.len() == count, "{:?} is truncated!", gz_path);
                label_counts[!train as usize] = count;
                labels.extend(&data);
            }
        }
        ensure!(
            image_counts == label_counts,
            "Image counts {:?} do not match label counts {:?}!",
            image_counts,
            label_counts,
        );
        ensure!(
            labels.iter().all(|&class| class < 10),
            "Found a class outside 0..10!",
        );
        let [train_count, test_count] = image_counts;
        let images = ArcArray::from_shape_vec([train_count + test_count, 28, 28], images)?;
        let classes = ArcArray::from_shape_vec([train_count + test_count], labels)?;
        Ok(Self {
            kind: builder.kind,
            images,
            classes,
            train_count,
            test_count,
        })
    }
    /// The kind of Mnist.
    pub fn kind(&self) -> MnistKind {
        self.kind
    }
    /// The images, train split first.
    ///
    /// Shape = \[train_count + test_count, 28, 28\].
    pub fn images(&self) -> &ArcArray<u8, Ix3> {
        &self.images
    }
    /// The classes, train split first.
    ///
    /// Shape = \[train_count + test_count\].
    ///
    /// The classes range from 0 to 9 inclusive.
    pub fn classes(&self) -> &ArcArray1<u8> {
        &self.classes
    }
    /// The number of training samples.
    pub fn train_count(&self) -> usize {
        self.train_count
    }
    /// The number of testing samples.
    pub fn test_count(&self) -> usize {
        self.test_count
    }
    /// The split the sample at `index` came from, or [`None`] if out of range.
    pub fn split_of(&self, index: usize) -> Option<Split> {
        if index < self.train_count {
            Some(Split::Train)
        } else if index < self.train_count + self.test_count {
            Some(Split::Test)
        } else {
            None
        }
    }
    /// The training images.
    pub fn train_images(&self) -> ArrayView3<u8> {
        self.images
            .slice_axis(Axis(0), ndarray::Slice::from(..self.train_count))
    }
    /// The training classes.
    pub fn train_classes(&self) -> ArrayView1<u8> {
        self.classes
            .slice_axis(Axis(0), ndarray::Slice::from(..self.train_count))
    }
    /// The testing images.
    pub fn test_images(&self) -> ArrayView3<u8> {
        self.images
            .slice_axis(Axis(0), ndarray::Slice::from(self.train_count..))
    }
    /// The testing classes.
    pub fn test_classes(&self) -> ArrayView1<u8> {
        self.classes
            .slice_axis(Axis(0), ndarray::Slice::from(self.train_count..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn write_images(path: &Path, count: usize) {
        let file = File::create(path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_i32::<BigEndian>(2_051).unwrap();
        encoder.write_i32::<BigEndian>(count as i32).unwrap();
        encoder.write_i32::<BigEndian>(28).unwrap();
        encoder.write_i32::<BigEndian>(28).unwrap();
        let pixels: Vec<u8> = (0..count * 28 * 28).map(|i| (i % 251) as u8).collect();
        encoder.write_all(&pixels).unwrap();
        encoder.finish().unwrap();
    }

    fn write_labels(path: &Path, labels: &[u8]) {
        let file = File::create(path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_i32::<BigEndian>(2_049).unwrap();
        encoder.write_i32::<BigEndian>(labels.len() as i32).unwrap();
        encoder.write_all(labels).unwrap();
        encoder.finish().unwrap();
    }

    fn write_fixture(dir: &Path, train: usize, test: usize, bad_label: bool) {
        let mnist_dir = dir.join("mnist");
        fs::create_dir_all(&mnist_dir).unwrap();
        write_images(&mnist_dir.join("train-images-idx3-ubyte.gz"), train);
        write_images(&mnist_dir.join("t10k-images-idx3-ubyte.gz"), test);
        let train_labels: Vec<u8> = (0..train).map(|i| (i % 10) as u8).collect();
        let mut test_labels: Vec<u8> = (0..test).map(|i| (i % 10) as u8).collect();
        if bad_label {
            test_labels[0] = 12;
        }
        write_labels(&mnist_dir.join("train-labels-idx1-ubyte.gz"), &train_labels);
        write_labels(&mnist_dir.join("t10k-labels-idx1-ubyte.gz"), &test_labels);
    }

    #[test]
    fn builds_from_local_files() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), 6, 4, false);
        let mnist = Mnist::builder().path(dir.path()).build().unwrap();
        assert_eq!(mnist.train_count(), 6);
        assert_eq!(mnist.test_count(), 4);
        assert_eq!(mnist.images().shape(), &[10, 28, 28]);
        assert_eq!(mnist.classes().len(), 10);
        assert_eq!(mnist.split_of(5), Some(Split::Train));
        assert_eq!(mnist.split_of(6), Some(Split::Test));
        assert_eq!(mnist.split_of(10), None);
        assert_eq!(mnist.train_images().shape(), &[6, 28, 28]);
        assert_eq!(mnist.test_classes().len(), 4);
        assert!(mnist.classes().iter().all(|&class| class < 10));
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), 4, 2, true);
        assert!(Mnist::builder().path(dir.path()).build().is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let mnist_dir = dir.path().join("mnist");
        fs::create_dir_all(&mnist_dir).unwrap();
        // Labels written where images are expected.
        write_labels(&mnist_dir.join("train-images-idx3-ubyte.gz"), &[0, 1]);
        write_images(&mnist_dir.join("t10k-images-idx3-ubyte.gz"), 2);
        write_labels(&mnist_dir.join("train-labels-idx1-ubyte.gz"), &[0, 1]);
        write_labels(&mnist_dir.join("t10k-labels-idx1-ubyte.gz"), &[0, 1]);
        assert!(Mnist::builder().path(dir.path()).build().is_err());
    }

    #[ignore]
    #[test]
    fn downloads_digits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mnist = Mnist::builder()
            .path(dir.path())
            .download(true)
            .build()?;
        assert_eq!(mnist.train_count(), 60_000);
        assert_eq!(mnist.test_count(), 10_000);
        Ok(())
    }
}
