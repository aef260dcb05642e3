use crate::result::Result;
use anyhow::ensure;
use ndarray::{Array1, Array3, Array4, ArrayView1, ArrayView3, Axis};

/// A deterministic, composable preprocessing transform.
///
/// Transforms chain with [`then`](Transform::then); the same pipeline is applied to
/// every batch, for both training and evaluation.
pub trait Transform<X> {
    type Output;
    /// Applies the transform.
    fn apply(&self, input: X) -> Result<Self::Output>;
    /// Chains `transform` after this one.
    fn then<T>(self, transform: T) -> Compose<Self, T>
    where
        Self: Sized,
        T: Transform<Self::Output>,
    {
        Compose {
            first: self,
            second: transform,
        }
    }
}

/// Two transforms applied in sequence.
///
/// See [`Transform::then`].
#[derive(Default, Clone, Copy, Debug)]
pub struct Compose<A, B> {
    first: A,
    second: B,
}

impl<X, A, B> Transform<X> for Compose<A, B>
where
    A: Transform<X>,
    B: Transform<A::Output>,
{
    type Output = B::Output;
    fn apply(&self, input: X) -> Result<Self::Output> {
        self.second.apply(self.first.apply(input)?)
    }
}

/// Min-max normalization of raw 8 bit pixels into \[0, scale\].
///
/// The default scale of 1 maps the full u8 range onto \[0, 1\].
#[derive(Clone, Copy, Debug)]
pub struct Normalize {
    scale: f32,
}

impl Default for Normalize {
    fn default() -> Self {
        Self { scale: 1. }
    }
}

impl Normalize {
    /// Creates a [`Normalize`] mapping the u8 range onto \[0, `scale`\].
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }
}

impl<'a> Transform<ArrayView3<'a, u8>> for Normalize {
    type Output = Array3<f32>;
    fn apply(&self, input: ArrayView3<'a, u8>) -> Result<Self::Output> {
        let scale = self.scale / 255.;
        Ok(input.map(|&x| x as f32 * scale))
    }
}

/// Inserts a leading channel axis, \[n, h, w\] -> \[n, 1, h, w\].
///
/// The training components expect channel first tensors.
#[derive(Default, Clone, Copy, Debug)]
pub struct InsertChannelAxis;

impl Transform<Array3<f32>> for InsertChannelAxis {
    type Output = Array4<f32>;
    fn apply(&self, input: Array3<f32>) -> Result<Self::Output> {
        Ok(input.insert_axis(Axis(1)))
    }
}

/// The label pipeline: validates that every label is one of `classes` mutually
/// exclusive classes and passes it through unchanged.
#[derive(Clone, Copy, Debug)]
pub struct ToClasses {
    classes: u8,
}

impl Default for ToClasses {
    fn default() -> Self {
        Self { classes: 10 }
    }
}

impl ToClasses {
    /// Creates a [`ToClasses`] for `classes` classes.
    pub fn new(classes: u8) -> Self {
        Self { classes }
    }
}

impl<'a> Transform<ArrayView1<'a, u8>> for ToClasses {
    type Output = Array1<u8>;
    fn apply(&self, input: ArrayView1<'a, u8>) -> Result<Self::Output> {
        ensure!(
            input.iter().all(|&t| t < self.classes),
            "Found a label outside 0..{}!",
            self.classes,
        );
        Ok(input.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3 as A3;

    #[test]
    fn normalize_into_unit_interval() {
        let raw = A3::from_shape_fn((2, 4, 4), |(n, i, j)| (n * 16 + i * 4 + j) as u8 * 8);
        let normalized = Normalize::default().apply(raw.view()).unwrap();
        assert!(normalized.iter().all(|&x| (0. ..=1.).contains(&x)));
        assert_eq!(normalized[[0, 0, 0]], 0.);
        assert_eq!(normalized[[0, 0, 1]], 8. / 255.);
    }

    #[test]
    fn pipeline_composes() {
        let pipeline = Normalize::default().then(InsertChannelAxis);
        let raw = A3::from_elem((3, 28, 28), 255u8);
        let batch = pipeline.apply(raw.view()).unwrap();
        assert_eq!(batch.dim(), (3, 1, 28, 28));
        assert!(batch.iter().all(|&x| x == 1.));
    }

    #[test]
    fn pipeline_is_deterministic() {
        let pipeline = Normalize::default().then(InsertChannelAxis);
        let raw = A3::from_shape_fn((1, 8, 8), |(_, i, j)| (i * 8 + j) as u8);
        let a = pipeline.apply(raw.view()).unwrap();
        let b = pipeline.apply(raw.view()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn to_classes_passes_valid_labels() {
        let labels = ndarray::Array1::from(vec![0u8, 3, 9]);
        let classes = ToClasses::default().apply(labels.view()).unwrap();
        assert_eq!(classes, labels);
    }

    #[test]
    fn to_classes_rejects_out_of_range() {
        let labels = ndarray::Array1::from(vec![0u8, 10]);
        assert!(ToClasses::default().apply(labels.view()).is_err());
    }
}
