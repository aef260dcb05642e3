use crate::result::Result;
use anyhow::anyhow;
use ndarray::{Array, ArrayBase, Axis, Data as ArrayData, Dimension};
use rand::prelude::SliceRandom;
use std::{
    ops::{Bound, Range, RangeBounds},
    vec::IntoIter as VecIntoIter,
};

/// The MNIST dataset.
#[cfg(feature = "mnist")]
pub mod mnist;

/// A dataset of samples, fixed at load time.
pub trait Dataset {
    type Item;
    /// The number of samples.
    fn sample_count(&self) -> usize;
    /// Loads the batch of `batch_size` samples starting at `index`.
    ///
    /// Returns [`None`] if the batch is out of range.
    fn sample(&self, index: usize, batch_size: usize) -> Option<Result<Self::Item>>;
    /// A view of a sub range of the dataset.
    fn slice(&self, bounds: impl RangeBounds<usize>) -> Slice<'_, Self> {
        let start = match bounds.start_bound() {
            Bound::Included(start) => *start,
            Bound::Excluded(start) => *start + 1,
            Bound::Unbounded => 0,
        };
        let end = match bounds.end_bound() {
            Bound::Included(end) => *end + 1,
            Bound::Excluded(end) => *end,
            Bound::Unbounded => self.sample_count(),
        };
        Slice {
            dataset: self,
            range: start..end,
        }
    }
    /// Iterates the dataset in batches of `batch_size` (the last batch may be
    /// smaller).
    ///
    /// If `shuffle`, the batch order is randomized; otherwise batches are yielded in
    /// deterministic index order. Training typically shuffles, evaluation does not.
    fn batches(&self, batch_size: usize, shuffle: bool) -> Batches<'_, Self> {
        let sample_count = self.sample_count();
        let mut indices: Vec<usize> = (0..sample_count).step_by(batch_size.max(1)).collect();
        if shuffle {
            indices.shuffle(&mut rand::thread_rng());
        }
        Batches {
            dataset: self,
            sample_count,
            indices: indices.into_iter(),
            batch_size,
        }
    }
}

/// Splits `dataset` into a training and a testing slice.
pub fn train_test_split<A>(dataset: &A, test_ratio: f32) -> (Slice<'_, A>, Slice<'_, A>)
where
    A: Dataset,
{
    let sample_count = dataset.sample_count();
    let test_offset =
        sample_count - ((test_ratio * sample_count as f32).round() as usize).min(sample_count);
    let train = dataset.slice(..test_offset);
    let test = dataset.slice(test_offset..);
    (train, test)
}

/// A sub range of a dataset.
///
/// See [`Dataset::slice`].
pub struct Slice<'a, A: ?Sized> {
    dataset: &'a A,
    range: Range<usize>,
}

impl<A: Dataset> Dataset for Slice<'_, A> {
    type Item = A::Item;
    fn sample_count(&self) -> usize {
        self.range.len()
    }
    fn sample(&self, index: usize, batch_size: usize) -> Option<Result<Self::Item>> {
        if index < self.range.len() && index + batch_size <= self.range.len() {
            self.dataset.sample(self.range.start + index, batch_size)
        } else {
            None
        }
    }
}

/// An iterator of dataset batches.
///
/// See [`Dataset::batches`].
pub struct Batches<'a, A: ?Sized> {
    dataset: &'a A,
    sample_count: usize,
    indices: VecIntoIter<usize>,
    batch_size: usize,
}

impl<A: Dataset> Iterator for Batches<'_, A> {
    type Item = Result<A::Item>;
    fn next(&mut self) -> Option<Self::Item> {
        let index = self.indices.next()?;
        let batch_size = (self.sample_count - index).min(self.batch_size);
        self.dataset.sample(index, batch_size)
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.indices.size_hint()
    }
}

impl<A: Dataset> ExactSizeIterator for Batches<'_, A> {}

impl<T: Clone, S: ArrayData<Elem = T>, D: Dimension> Dataset for ArrayBase<S, D> {
    type Item = Array<T, D>;
    fn sample_count(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }
    fn sample(&self, index: usize, batch_size: usize) -> Option<Result<Self::Item>> {
        let sample_count = self.sample_count();
        if index < sample_count && index + batch_size <= sample_count {
            let batch = self
                .slice_axis(Axis(0), ndarray::Slice::from(index..index + batch_size))
                .to_owned();
            Some(Ok(batch))
        } else {
            None
        }
    }
}

impl<A: Dataset, B: Dataset> Dataset for (A, B) {
    type Item = (A::Item, B::Item);
    fn sample_count(&self) -> usize {
        self.0.sample_count().min(self.1.sample_count())
    }
    fn sample(&self, index: usize, batch_size: usize) -> Option<Result<Self::Item>> {
        self.0
            .sample(index, batch_size)
            .zip(self.1.sample(index, batch_size))
            .map(|(a, b)| Ok((a?, b?)))
    }
}

/// Which side of a train / test partition a sample came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Split {
    Train,
    Test,
}

/// A train set and a test set joined into one dataset, preserving per item
/// provenance.
///
/// Items are tagged with their [`Split`]; [`split_of`](Concat::split_of) answers the
/// same question by index. Batches must not straddle the boundary between the two
/// sets; pick a batch size that divides the training set length, or iterate the sets
/// separately.
pub struct Concat<A, B> {
    train: A,
    test: B,
}

impl<A: Dataset, B: Dataset<Item = A::Item>> Concat<A, B> {
    /// Joins `train` and `test`.
    pub fn new(train: A, test: B) -> Self {
        Self { train, test }
    }
    /// The training set.
    pub fn train(&self) -> &A {
        &self.train
    }
    /// The testing set.
    pub fn test(&self) -> &B {
        &self.test
    }
    /// The split the sample at `index` came from, or [`None`] if out of range.
    pub fn split_of(&self, index: usize) -> Option<Split> {
        if index < self.train.sample_count() {
            Some(Split::Train)
        } else if index < self.sample_count() {
            Some(Split::Test)
        } else {
            None
        }
    }
}

impl<A: Dataset, B: Dataset<Item = A::Item>> Dataset for Concat<A, B> {
    type Item = (Split, A::Item);
    fn sample_count(&self) -> usize {
        self.train.sample_count() + self.test.sample_count()
    }
    fn sample(&self, index: usize, batch_size: usize) -> Option<Result<Self::Item>> {
        let boundary = self.train.sample_count();
        if index + batch_size <= boundary {
            self.train
                .sample(index, batch_size)
                .map(|batch| Ok((Split::Train, batch?)))
        } else if index >= boundary {
            self.test
                .sample(index - boundary, batch_size)
                .map(|batch| Ok((Split::Test, batch?)))
        } else {
            Some(Err(anyhow!(
                "Batch {}..{} straddles the split boundary at {}!",
                index,
                index + batch_size,
                boundary,
            )))
        }
    }
}
