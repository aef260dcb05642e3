use crate::result::Result;
use anyhow::ensure;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView4, Axis};

// Inverse CDF of the standard normal, Acklam's rational approximation.
// Absolute error is below 1.15e-9 over (0, 1).
fn probit(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;
    debug_assert!(p > 0. && p < 1.);
    if p < P_LOW {
        let q = (-2. * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.)
    } else if p <= 1. - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.)
    } else {
        let q = (-2. * (1. - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.)
    }
}

/// A regular grid over a 2 dimensional latent space.
///
/// Grid coordinates are standard normal quantiles at evenly spaced probabilities, so
/// the grid covers the region the prior actually puts mass on. Both axes are strictly
/// increasing.
#[derive(Clone, Debug)]
pub struct LatentGrid {
    z0: Array1<f32>,
    z1: Array1<f32>,
}

impl LatentGrid {
    /// Creates a grid of `steps` × `steps` points at quantiles evenly spaced over
    /// \[0.001, 0.999\].
    ///
    /// **Errors**
    ///
    /// `steps` must be at least 2.
    pub fn new(steps: usize) -> Result<Self> {
        Self::with_quantiles(steps, 0.001, 0.999)
    }
    /// Creates a grid at quantiles evenly spaced over \[`lo`, `hi`\].
    ///
    /// **Errors**
    ///
    /// `steps` must be at least 2 and 0 < `lo` < `hi` < 1.
    pub fn with_quantiles(steps: usize, lo: f64, hi: f64) -> Result<Self> {
        ensure!(steps >= 2, "A grid needs at least 2 steps per axis!");
        ensure!(
            0. < lo && lo < hi && hi < 1.,
            "Quantiles must satisfy 0 < {} < {} < 1!",
            lo,
            hi,
        );
        let axis = Array1::from_shape_fn(steps, |i| {
            let q = lo + (hi - lo) * i as f64 / (steps - 1) as f64;
            probit(q) as f32
        });
        Ok(Self {
            z0: axis.clone(),
            z1: axis,
        })
    }
    /// The number of steps per axis.
    pub fn steps(&self) -> usize {
        self.z0.len()
    }
    /// The first axis, strictly increasing.
    pub fn z0(&self) -> ArrayView1<f32> {
        self.z0.view()
    }
    /// The second axis, strictly increasing.
    pub fn z1(&self) -> ArrayView1<f32> {
        self.z1.view()
    }
    /// All grid points as \[steps², 2\], in row major order: the point at
    /// (`row`, `col`) is (z0\[`col`\], z1\[`row`\]).
    pub fn points(&self) -> Array2<f32> {
        let steps = self.steps();
        Array2::from_shape_fn((steps * steps, 2), |(index, axis)| {
            if axis == 0 {
                self.z0[index % steps]
            } else {
                self.z1[index / steps]
            }
        })
    }
}

/// A mosaic of equally sized grayscale tiles, ordered by grid position.
#[derive(Clone, Debug)]
pub struct Mosaic {
    data: Array2<f32>,
    tile_dim: usize,
    steps: usize,
}

impl Mosaic {
    /// Assembles `tiles` (\[steps², 1, tile, tile\]) into a single
    /// (steps·tile) × (steps·tile) image, row major: tile k lands at row k / steps,
    /// column k % steps.
    ///
    /// **Errors**
    ///
    /// The number of tiles must be steps², with square single channel tiles.
    pub fn from_tiles(tiles: ArrayView4<f32>, steps: usize) -> Result<Self> {
        let (count, channels, th, tw) = tiles.dim();
        ensure!(
            count == steps * steps,
            "Expected {} tiles, found {}!",
            steps * steps,
            count,
        );
        ensure!(
            channels == 1 && th == tw,
            "Tiles must be square and single channel, found {:?}!",
            tiles.shape(),
        );
        let tile_dim = th;
        let mut data = Array2::zeros((steps * tile_dim, steps * tile_dim));
        for (k, tile) in tiles.axis_iter(Axis(0)).enumerate() {
            let row = (k / steps) * tile_dim;
            let col = (k % steps) * tile_dim;
            data.slice_mut(ndarray::s![row..row + tile_dim, col..col + tile_dim])
                .assign(&tile.index_axis(Axis(0), 0));
        }
        Ok(Self {
            data,
            tile_dim,
            steps,
        })
    }
    /// The assembled image.
    pub fn array(&self) -> &Array2<f32> {
        &self.data
    }
    /// Height and width of a single tile.
    pub fn tile_dim(&self) -> usize {
        self.tile_dim
    }
    /// The number of tiles per axis.
    pub fn steps(&self) -> usize {
        self.steps
    }
    /// The assembled image as 8 bit grayscale pixels, \[0, 1\] scaled to \[0, 255\].
    pub fn to_pixels(&self) -> Array2<u8> {
        self.data
            .map(|&x| (x * 255.).clamp(0., 255.).round() as u8)
    }
}

/// Latent coordinates of a labeled sample set.
///
/// Pairs each sample's deterministic latent mean with its true class, for scatter
/// plotting the cluster structure of the latent space.
#[derive(Clone, Debug, Default)]
pub struct LatentEmbedding {
    codes: Array2<f32>,
    classes: Array1<u8>,
}

impl LatentEmbedding {
    /// Collects (codes, classes) batches into a single embedding.
    ///
    /// **Errors**
    ///
    /// Every batch must pair as many codes as classes, with a consistent latent dim.
    pub fn from_batches<I>(batches: I) -> Result<Self>
    where
        I: IntoIterator<Item = Result<(Array2<f32>, Array1<u8>)>>,
    {
        let mut codes: Vec<f32> = Vec::new();
        let mut classes: Vec<u8> = Vec::new();
        let mut latent_dim = None;
        for batch in batches {
            let (batch_codes, batch_classes) = batch?;
            ensure!(
                batch_codes.nrows() == batch_classes.len(),
                "Found {} codes for {} classes!",
                batch_codes.nrows(),
                batch_classes.len(),
            );
            let dim = *latent_dim.get_or_insert(batch_codes.ncols());
            ensure!(
                dim == batch_codes.ncols(),
                "Latent dim changed from {} to {}!",
                dim,
                batch_codes.ncols(),
            );
            codes.extend(batch_codes.iter());
            classes.extend(batch_classes.iter());
        }
        let latent_dim = latent_dim.unwrap_or(0);
        let count = classes.len();
        let codes = Array2::from_shape_vec((count, latent_dim), codes)?;
        Ok(Self {
            codes,
            classes: Array1::from(classes),
        })
    }
    /// The number of samples.
    pub fn len(&self) -> usize {
        self.classes.len()
    }
    /// Whether the embedding is empty.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
    /// Latent coordinates, \[len, latent_dim\].
    pub fn codes(&self) -> ArrayView2<f32> {
        self.codes.view()
    }
    /// True classes, \[len\].
    pub fn classes(&self) -> ArrayView1<u8> {
        self.classes.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array4;

    #[test]
    fn probit_matches_reference() {
        assert_relative_eq!(probit(0.5), 0.);
        assert_relative_eq!(probit(0.975), 1.9600, epsilon = 1e-3);
        assert_relative_eq!(probit(0.025), -1.9600, epsilon = 1e-3);
        assert_relative_eq!(probit(0.001), -3.0902, epsilon = 1e-3);
        assert_relative_eq!(probit(0.999), 3.0902, epsilon = 1e-3);
    }

    #[test]
    fn probit_is_odd() {
        for &p in &[0.0005, 0.01, 0.2, 0.4] {
            assert_relative_eq!(probit(p), -probit(1. - p), epsilon = 1e-8);
        }
    }

    #[test]
    fn grid_axes_strictly_increasing() {
        let grid = LatentGrid::new(21).unwrap();
        assert_eq!(grid.steps(), 21);
        for axis in [grid.z0(), grid.z1()] {
            for pair in axis.to_vec().windows(2) {
                assert!(pair[0] < pair[1]);
            }
        }
    }

    #[test]
    fn grid_points_layout() {
        let grid = LatentGrid::new(3).unwrap();
        let points = grid.points();
        assert_eq!(points.dim(), (9, 2));
        // Row 1, col 2 is index 5: (z0[2], z1[1]).
        assert_eq!(points[[5, 0]], grid.z0()[2]);
        assert_eq!(points[[5, 1]], grid.z1()[1]);
    }

    #[test]
    fn grid_validates() {
        assert!(LatentGrid::new(1).is_err());
        assert!(LatentGrid::with_quantiles(5, 0., 0.999).is_err());
        assert!(LatentGrid::with_quantiles(5, 0.9, 0.1).is_err());
    }

    #[test]
    fn mosaic_dims() {
        // 21 tiles of 28 pixels per side make a 588 pixel mosaic.
        let tiles = Array4::<f32>::zeros((21 * 21, 1, 28, 28));
        let mosaic = Mosaic::from_tiles(tiles.view(), 21).unwrap();
        assert_eq!(mosaic.array().dim(), (588, 588));
    }

    #[test]
    fn mosaic_orders_tiles_by_grid_position() {
        let mut tiles = Array4::<f32>::zeros((4, 1, 2, 2));
        for k in 0..4 {
            tiles.index_axis_mut(Axis(0), k).fill(k as f32);
        }
        let mosaic = Mosaic::from_tiles(tiles.view(), 2).unwrap();
        let data = mosaic.array();
        assert_eq!(data[[0, 0]], 0.);
        assert_eq!(data[[0, 2]], 1.);
        assert_eq!(data[[2, 0]], 2.);
        assert_eq!(data[[2, 2]], 3.);
    }

    #[test]
    fn mosaic_rejects_wrong_count() {
        let tiles = Array4::<f32>::zeros((5, 1, 2, 2));
        assert!(Mosaic::from_tiles(tiles.view(), 2).is_err());
    }

    #[test]
    fn mosaic_pixels_clamp() {
        let tiles = Array4::from_elem((1, 1, 2, 2), 1.5f32);
        let mosaic = Mosaic::from_tiles(tiles.view(), 1).unwrap();
        assert!(mosaic.to_pixels().iter().all(|&p| p == 255));
    }

    #[test]
    fn embedding_counts() {
        let batches = (0..4).map(|_| {
            Ok((
                Array2::<f32>::zeros((25, 2)),
                Array1::<u8>::zeros(25),
            ))
        });
        let embedding = LatentEmbedding::from_batches(batches).unwrap();
        assert_eq!(embedding.len(), 100);
        assert_eq!(embedding.codes().dim(), (100, 2));
    }

    #[test]
    fn embedding_rejects_mismatched_batch() {
        let batches = vec![Ok((Array2::<f32>::zeros((3, 2)), Array1::<u8>::zeros(4)))];
        assert!(LatentEmbedding::from_batches(batches).is_err());
    }
}
