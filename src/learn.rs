use crate::result::Result;
use serde::{Deserialize, Serialize};
use std::{
    iter::empty,
    time::{Duration, Instant},
};

/// Loss criteria.
pub mod criterion;

/// Variational autoencoders.
pub mod vae;

/// Training / Testing statistics.
///
/// Losses are accumulated per sample; the accessors return means.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    loss: f32,
    reconstruction: f32,
    kl: f32,
}

impl Stats {
    /// Accumulates a batch of `count` samples with per sample mean losses.
    pub fn update(&mut self, count: usize, loss: f32, reconstruction: f32, kl: f32) {
        self.count += count;
        self.loss += loss * count as f32;
        self.reconstruction += reconstruction * count as f32;
        self.kl += kl * count as f32;
    }
    /// The number of samples.
    pub fn count(&self) -> usize {
        self.count
    }
    fn mean(&self, sum: f32) -> Option<f32> {
        if self.count > 0 {
            Some(sum / self.count as f32)
        } else {
            None
        }
    }
    /// Mean total loss per sample.
    pub fn loss(&self) -> Option<f32> {
        self.mean(self.loss)
    }
    /// Mean reconstruction loss per sample.
    pub fn reconstruction(&self) -> Option<f32> {
        self.mean(self.reconstruction)
    }
    /// Mean KL divergence per sample.
    pub fn kl(&self) -> Option<f32> {
        self.mean(self.kl)
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    /// The number of completed epochs.
    pub epoch: usize,
    /// Duration of the last epoch.
    pub epoch_time: Duration,
    /// Total duration of training.
    pub total_time: Duration,
    /// Stats of the last training epoch.
    pub train: Stats,
    /// Stats of the last test evaluation.
    pub test: Stats,
}

impl Summary {
    /// Runs an epoch with `f`.
    ///
    /// Times `f`. If `f` returns `Ok`, updates the epoch time, accumulates the total
    /// time, and increments the epoch. Otherwise returns the error.
    pub fn run_epoch<F>(&mut self, mut f: F) -> Result<(Stats, Stats)>
    where
        F: FnMut(&Self) -> Result<(Stats, Stats)>,
    {
        let start = Instant::now();
        let (train, test) = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.train = train;
        self.test = test;
        Ok((train, test))
    }
}

/// Summarizes the trainer.
pub trait Summarize {
    /// Returns a summary.
    fn summarize(&self) -> Summary;
}

/// Training.
///
/// [`Train`] is a general purpose trait for machine learning trainers that train a
/// model, potentially iteratively with several epochs.
///
/// # Summary
/// Implement [`Summarize`], as the trainer is expected to compute a summary on each
/// call to [`.train_test()`](Train::train_test()). Use [`Summary::run_epoch()`] to
/// compute the next summary.
pub trait Train<X> {
    /// Trains the model with the training and testing sets.
    ///
    /// Returns (`train_stats`, `test_stats`).
    ///
    /// **Errors**
    /// Returns an error if training / testing could not be performed. The trainer may
    /// be modified even when returning an error.
    fn train_test<I1, I2>(&mut self, train_iter: I1, test_iter: I2) -> Result<(Stats, Stats)>
    where
        I1: IntoIterator<Item = Result<X>>,
        I2: IntoIterator<Item = Result<X>>;
    /// Trains the model with the training set.
    ///
    /// Returns the training stats.
    ///
    /// **Errors**
    /// Returns an error if training could not be performed. The trainer may be
    /// modified even when returning an error.
    fn train<I>(&mut self, train_iter: I) -> Result<Stats>
    where
        I: IntoIterator<Item = Result<X>>,
    {
        Ok(self.train_test(train_iter, empty())?.0)
    }
}

/// Testing / Evaluation.
pub trait Test<X> {
    /// Tests the model with the test data.
    ///
    /// Unlike [`Train::train_test()`], this method does not require mutable
    /// (exclusive) access.
    ///
    /// **Errors**
    /// Returns an error if testing could not be performed.
    fn test<I>(&self, test_iter: I) -> Result<Stats>
    where
        I: IntoIterator<Item = Result<X>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_means() {
        let mut stats = Stats::default();
        assert!(stats.loss().is_none());
        stats.update(2, 1., 0.75, 0.25);
        stats.update(6, 2., 1.5, 0.5);
        assert_eq!(stats.count(), 8);
        let loss = stats.loss().unwrap();
        assert!((loss - (2. + 12.) / 8.).abs() < 1e-6);
    }

    #[test]
    fn summary_run_epoch() {
        let mut summary = Summary::default();
        let mut train = Stats::default();
        train.update(4, 1., 1., 0.);
        summary
            .run_epoch(|summary| {
                assert_eq!(summary.epoch, 0);
                Ok((train, Stats::default()))
            })
            .unwrap();
        assert_eq!(summary.epoch, 1);
        assert_eq!(summary.train.count(), 4);
        assert!(summary.total_time >= summary.epoch_time);
    }

    #[test]
    fn summary_serializes() {
        let summary = Summary::default();
        let json = serde_json::to_string(&summary).unwrap();
        let back: Summary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.epoch, 0);
    }
}
