use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use resources::objects::checkpoint::HistogramCheckpoint;

use crate::error::RecommenderError;

/// Largest bucket weight stored in a checkpoint,
/// all other buckets are scaled relatively to it.
pub const MAX_CHECKPOINT_WEIGHT: u32 = 10000;

/// Decay exponent at which the reference timestamp is moved forward.
const MAX_DECAY_EXPONENT: i32 = 100;

/// Bucket layout where bucket sizes grow exponentially:
/// bucket `n` starts at `first_bucket_size * (ratio^n - 1) / (ratio - 1)`.
#[derive(Debug, PartialEq)]
pub struct ExponentialHistogramOptions {
    num_buckets: usize,
    first_bucket_size: f64,
    ratio: f64,
    epsilon: f64,
}

impl ExponentialHistogramOptions {
    /// Smallest number of buckets which covers `[0, max_value]`.
    pub fn new(max_value: f64, first_bucket_size: f64, ratio: f64, epsilon: f64) -> Self {
        let num_buckets =
            ((max_value * (ratio - 1.0) / first_bucket_size + 1.0).log(ratio)).ceil() as usize + 1;
        ExponentialHistogramOptions {
            num_buckets,
            first_bucket_size,
            ratio,
            epsilon,
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    /// Weights below epsilon are treated as zero.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn find_bucket(&self, value: f64) -> usize {
        if value < self.first_bucket_size {
            return 0;
        }
        let bucket = (value * (self.ratio - 1.0) / self.first_bucket_size + 1.0).log(self.ratio);
        (bucket as usize).min(self.num_buckets - 1)
    }

    pub fn bucket_start(&self, bucket: usize) -> f64 {
        if bucket == 0 {
            return 0.0;
        }
        self.first_bucket_size * (self.ratio.powi(bucket as i32) - 1.0) / (self.ratio - 1.0)
    }
}

/// A distribution of weighted samples.
pub trait Histogram {
    /// Add a sample with the given weight.
    fn add_sample(&mut self, value: f64, weight: f64, time: NaiveDateTime);
    /// Remove a sample added before. The weight of its bucket never drops below zero.
    fn subtract_sample(&mut self, value: f64, weight: f64, time: NaiveDateTime);
    fn merge(&mut self, other: &Self);
    /// Approximate value below which `percentile` of the total weight lies.
    /// Returns 0 for an empty histogram.
    fn percentile(&self, percentile: f64) -> f64;
    fn is_empty(&self) -> bool;
    fn save_to_checkpoint(&self) -> HistogramCheckpoint;
    fn load_from_checkpoint(&mut self, checkpoint: &HistogramCheckpoint)
        -> Result<(), RecommenderError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicHistogram {
    options: &'static ExponentialHistogramOptions,
    bucket_weight: Vec<f64>,
    total_weight: f64,
    /// Index of the first bucket with weight above epsilon,
    /// or the last bucket if all are empty.
    min_bucket: usize,
    /// Index of the last bucket with weight above epsilon,
    /// or 0 if all are empty.
    max_bucket: usize,
}

impl BasicHistogram {
    pub fn new(options: &'static ExponentialHistogramOptions) -> Self {
        BasicHistogram {
            options,
            bucket_weight: vec![0.0; options.num_buckets()],
            total_weight: 0.0,
            min_bucket: options.num_buckets() - 1,
            max_bucket: 0,
        }
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    fn scale(&mut self, factor: f64) {
        for bucket in self.min_bucket..=self.max_bucket {
            self.bucket_weight[bucket] *= factor;
        }
        self.total_weight *= factor;
        self.update_min_and_max_bucket();
    }

    fn update_min_and_max_bucket(&mut self) {
        let last_bucket = self.options.num_buckets() - 1;
        let epsilon = self.options.epsilon();
        while self.bucket_weight[self.min_bucket] < epsilon && self.min_bucket < last_bucket {
            self.min_bucket += 1;
        }
        while self.bucket_weight[self.max_bucket] < epsilon && self.max_bucket > 0 {
            self.max_bucket -= 1;
        }
    }
}

impl Histogram for BasicHistogram {
    fn add_sample(&mut self, value: f64, weight: f64, _time: NaiveDateTime) {
        if weight < 0.0 {
            tracing::warn!("Ignoring sample with negative weight {}", weight);
            return;
        }
        let bucket = self.options.find_bucket(value);
        self.bucket_weight[bucket] += weight;
        self.total_weight += weight;
        if self.bucket_weight[bucket] >= self.options.epsilon() {
            self.min_bucket = self.min_bucket.min(bucket);
            self.max_bucket = self.max_bucket.max(bucket);
        }
    }

    fn subtract_sample(&mut self, value: f64, weight: f64, _time: NaiveDateTime) {
        if weight < 0.0 {
            tracing::warn!("Ignoring sample with negative weight {}", weight);
            return;
        }
        let bucket = self.options.find_bucket(value);
        let weight = weight.min(self.bucket_weight[bucket]);
        self.bucket_weight[bucket] -= weight;
        self.total_weight -= weight;
        if self.bucket_weight[bucket] < self.options.epsilon() {
            self.update_min_and_max_bucket();
        }
    }

    fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        for bucket in other.min_bucket..=other.max_bucket {
            self.bucket_weight[bucket] += other.bucket_weight[bucket];
        }
        self.total_weight += other.total_weight;
        self.min_bucket = self.min_bucket.min(other.min_bucket);
        self.max_bucket = self.max_bucket.max(other.max_bucket);
    }

    fn percentile(&self, percentile: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let threshold = percentile * self.total_weight;
        let mut partial_sum = 0.0;
        let mut bucket = self.min_bucket;
        while bucket < self.max_bucket {
            partial_sum += self.bucket_weight[bucket];
            if partial_sum >= threshold {
                break;
            }
            bucket += 1;
        }
        if bucket < self.options.num_buckets() - 1 {
            // End of the bucket
            self.options.bucket_start(bucket + 1)
        } else {
            // The last bucket has no upper bound
            self.options.bucket_start(bucket)
        }
    }

    fn is_empty(&self) -> bool {
        self.bucket_weight[self.min_bucket] < self.options.epsilon()
    }

    fn save_to_checkpoint(&self) -> HistogramCheckpoint {
        let mut checkpoint = HistogramCheckpoint {
            reference_timestamp: None,
            bucket_weights: BTreeMap::new(),
            total_weight: self.total_weight,
        };
        if self.min_bucket > self.max_bucket {
            return checkpoint;
        }
        let max = self.bucket_weight[self.min_bucket..=self.max_bucket]
            .iter()
            .cloned()
            .fold(0.0, f64::max);
        if max <= 0.0 {
            return checkpoint;
        }
        let ratio = MAX_CHECKPOINT_WEIGHT as f64 / max;
        for bucket in self.min_bucket..=self.max_bucket {
            let weight = (self.bucket_weight[bucket] * ratio).round() as u32;
            if weight > 0 {
                checkpoint.bucket_weights.insert(bucket, weight);
            }
        }
        checkpoint
    }

    fn load_from_checkpoint(
        &mut self,
        checkpoint: &HistogramCheckpoint,
    ) -> Result<(), RecommenderError> {
        if checkpoint.total_weight < 0.0 {
            return Err(RecommenderError::CheckpointNegativeWeight);
        }
        let mut sum = 0u64;
        for (&bucket, &weight) in &checkpoint.bucket_weights {
            if bucket >= self.options.num_buckets() {
                return Err(RecommenderError::CheckpointBucketOverflow {
                    bucket,
                    num_buckets: self.options.num_buckets(),
                });
            }
            sum += weight as u64;
        }
        if sum == 0 {
            return Ok(());
        }
        let ratio = checkpoint.total_weight / sum as f64;
        for (&bucket, &weight) in &checkpoint.bucket_weights {
            self.min_bucket = self.min_bucket.min(bucket);
            self.max_bucket = self.max_bucket.max(bucket);
            self.bucket_weight[bucket] += weight as f64 * ratio;
        }
        self.total_weight += checkpoint.total_weight;
        Ok(())
    }
}

/// A histogram where the weight of each sample decays exponentially with its age,
/// halving every `half_life`.
///
/// Weights are stored relative to a reference timestamp, so a sample added at
/// `reference + k * half_life` gets `2^k` times the weight of one at the reference.
/// The reference is moved forward when that factor would grow too large.
#[derive(Debug, Clone, PartialEq)]
pub struct DecayingHistogram {
    histogram: BasicHistogram,
    half_life: Duration,
    reference_timestamp: Option<NaiveDateTime>,
}

impl DecayingHistogram {
    pub fn new(options: &'static ExponentialHistogramOptions, half_life: Duration) -> Self {
        DecayingHistogram {
            histogram: BasicHistogram::new(options),
            half_life,
            reference_timestamp: None,
        }
    }

    pub fn reference_timestamp(&self) -> Option<NaiveDateTime> {
        self.reference_timestamp
    }

    fn decay_factor(&mut self, time: NaiveDateTime) -> f64 {
        let reference = match self.reference_timestamp {
            Some(reference) if time <= reference + self.half_life * MAX_DECAY_EXPONENT => {
                reference
            },
            _ => self.shift_reference_timestamp(time),
        };
        let elapsed = (time - reference).num_milliseconds() as f64;
        (elapsed / self.half_life.num_milliseconds() as f64).exp2()
    }

    /// Move the reference to `time` rounded to a multiple of the half life,
    /// rescaling stored weights accordingly.
    fn shift_reference_timestamp(&mut self, time: NaiveDateTime) -> NaiveDateTime {
        let new_reference = round_to(time, self.half_life);
        if let Some(old_reference) = self.reference_timestamp {
            let exponent = ((old_reference - new_reference).num_milliseconds() as f64
                / self.half_life.num_milliseconds() as f64)
                .round() as i32;
            self.histogram.scale(2f64.powi(exponent));
        }
        self.reference_timestamp = Some(new_reference);
        new_reference
    }
}

impl Histogram for DecayingHistogram {
    fn add_sample(&mut self, value: f64, weight: f64, time: NaiveDateTime) {
        let factor = self.decay_factor(time);
        self.histogram.add_sample(value, weight * factor, time);
    }

    fn subtract_sample(&mut self, value: f64, weight: f64, time: NaiveDateTime) {
        let factor = self.decay_factor(time);
        self.histogram.subtract_sample(value, weight * factor, time);
    }

    fn merge(&mut self, other: &Self) {
        match (self.reference_timestamp, other.reference_timestamp) {
            (_, None) => {},
            (None, Some(reference)) => {
                self.reference_timestamp = Some(reference);
                self.histogram.merge(&other.histogram);
            },
            (Some(mine), Some(theirs)) if mine < theirs => {
                self.shift_reference_timestamp(theirs);
                self.histogram.merge(&other.histogram);
            },
            (Some(mine), Some(theirs)) if theirs < mine => {
                let mut other = other.clone();
                other.shift_reference_timestamp(mine);
                self.histogram.merge(&other.histogram);
            },
            _ => self.histogram.merge(&other.histogram),
        }
    }

    fn percentile(&self, percentile: f64) -> f64 {
        self.histogram.percentile(percentile)
    }

    fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    fn save_to_checkpoint(&self) -> HistogramCheckpoint {
        let mut checkpoint = self.histogram.save_to_checkpoint();
        checkpoint.reference_timestamp = self.reference_timestamp;
        checkpoint
    }

    fn load_from_checkpoint(
        &mut self,
        checkpoint: &HistogramCheckpoint,
    ) -> Result<(), RecommenderError> {
        self.histogram.load_from_checkpoint(checkpoint)?;
        self.reference_timestamp = checkpoint.reference_timestamp;
        Ok(())
    }
}

/// Round to the nearest multiple of `unit` since the Unix epoch, halfway values round up.
fn round_to(time: NaiveDateTime, unit: Duration) -> NaiveDateTime {
    let unit_ms = unit.num_milliseconds();
    if unit_ms <= 0 {
        return time;
    }
    let millis = time.timestamp_millis();
    let remainder = millis.rem_euclid(unit_ms);
    let mut rounded = millis - remainder;
    if remainder * 2 >= unit_ms {
        rounded += unit_ms;
    }
    NaiveDateTime::from_timestamp_opt(
        rounded.div_euclid(1000),
        (rounded.rem_euclid(1000) * 1_000_000) as u32,
    )
    .unwrap_or(time)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    lazy_static! {
        static ref OPTIONS: ExponentialHistogramOptions =
            ExponentialHistogramOptions::new(100.0, 1.0, 1.5, 0.001);
    }

    fn time(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 6, 1)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .unwrap()
    }

    #[test]
    fn exponential_buckets() {
        // 1 * (1.5^n - 1) / 0.5 >= 100 first holds for n = 10
        assert_eq!(OPTIONS.num_buckets(), 11);
        assert_eq!(OPTIONS.find_bucket(0.5), 0);
        assert_eq!(OPTIONS.find_bucket(1.0), 1);
        assert_eq!(OPTIONS.bucket_start(1), 1.0);
        assert_eq!(OPTIONS.bucket_start(2), 2.5);
        assert_eq!(OPTIONS.find_bucket(1e9), 10);
    }

    #[test]
    fn empty_histogram() {
        let histogram = BasicHistogram::new(&OPTIONS);
        assert!(histogram.is_empty());
        assert_eq!(histogram.percentile(0.5), 0.0);
    }

    #[test]
    fn percentile_returns_bucket_end() {
        let mut histogram = BasicHistogram::new(&OPTIONS);
        histogram.add_sample(1.5, 1.0, time(0));
        histogram.add_sample(3.0, 1.0, time(0));
        histogram.add_sample(60.0, 2.0, time(0));
        // Buckets: [1, 2.5), [2.5, 4.75), ...
        assert_eq!(histogram.percentile(0.2), 2.5);
        assert_eq!(histogram.percentile(0.5), 4.75);
        assert_eq!(histogram.percentile(1.0), OPTIONS.bucket_start(9));
    }

    #[test]
    fn subtract_clamps_to_bucket_weight() {
        let mut histogram = BasicHistogram::new(&OPTIONS);
        histogram.add_sample(3.0, 1.0, time(0));
        histogram.subtract_sample(3.0, 5.0, time(0));
        assert!(histogram.is_empty());
        assert_eq!(histogram.total_weight(), 0.0);
    }

    #[test]
    fn checkpoint_keeps_percentiles() {
        let mut histogram = BasicHistogram::new(&OPTIONS);
        histogram.add_sample(1.5, 3.0, time(0));
        histogram.add_sample(30.0, 1.0, time(0));
        let checkpoint = histogram.save_to_checkpoint();
        assert_eq!(checkpoint.bucket_weights.values().max(), Some(&MAX_CHECKPOINT_WEIGHT));

        let mut restored = BasicHistogram::new(&OPTIONS);
        restored.load_from_checkpoint(&checkpoint).unwrap();
        for p in [0.5, 0.75, 0.9, 0.99] {
            assert_eq!(restored.percentile(p), histogram.percentile(p));
        }
        assert!((restored.total_weight() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn checkpoint_with_foreign_bucket_is_rejected() {
        let checkpoint = HistogramCheckpoint {
            reference_timestamp: None,
            bucket_weights: BTreeMap::from([(100, 1)]),
            total_weight: 1.0,
        };
        let mut histogram = BasicHistogram::new(&OPTIONS);
        assert_eq!(
            histogram.load_from_checkpoint(&checkpoint),
            Err(RecommenderError::CheckpointBucketOverflow {
                bucket: 100,
                num_buckets: 11
            })
        );
    }

    #[test]
    fn newer_samples_weigh_more() {
        let mut histogram = DecayingHistogram::new(&OPTIONS, Duration::hours(1));
        // Two samples two half lives apart: the newer one weighs 4x as much.
        histogram.add_sample(2.0, 1.0, time(0));
        histogram.add_sample(50.0, 1.0, time(2));
        assert_eq!(histogram.percentile(0.2), OPTIONS.bucket_start(2));
        assert_eq!(histogram.percentile(0.3), OPTIONS.bucket_start(9));
    }

    #[test]
    fn reference_is_rounded_to_half_life() {
        let mut histogram = DecayingHistogram::new(&OPTIONS, Duration::hours(1));
        let sample_time = time(5) + Duration::minutes(40);
        histogram.add_sample(2.0, 1.0, sample_time);
        assert_eq!(histogram.reference_timestamp(), Some(time(6)));
    }

    #[test]
    fn reference_moves_after_hundred_half_lives() {
        let mut histogram = DecayingHistogram::new(&OPTIONS, Duration::hours(1));
        histogram.add_sample(2.0, 1.0, time(0));
        // Exactly 100 half lives later the reference still holds
        histogram.add_sample(3.0, 1.0, time(0) + Duration::hours(100));
        assert_eq!(histogram.reference_timestamp(), Some(time(0)));
        assert_eq!(histogram.percentile(0.5), OPTIONS.bucket_start(3));

        let last = time(0) + Duration::hours(150);
        histogram.add_sample(60.0, 1.0, last);
        assert_eq!(histogram.reference_timestamp(), Some(last));
        let first_bucket = OPTIONS.find_bucket(2.0);
        assert!(histogram.histogram.bucket_weight[first_bucket] < OPTIONS.epsilon());
        assert!((histogram.histogram.total_weight() - 1.0).abs() < 1e-9);
        assert_eq!(histogram.percentile(0.5), OPTIONS.bucket_start(9));
    }

    #[test]
    fn merge_aligns_reference() {
        let mut older = DecayingHistogram::new(&OPTIONS, Duration::hours(1));
        older.add_sample(2.0, 1.0, time(0));
        let mut newer = DecayingHistogram::new(&OPTIONS, Duration::hours(1));
        newer.add_sample(50.0, 1.0, time(1));

        let mut merged = older.clone();
        merged.merge(&newer);
        assert_eq!(merged.reference_timestamp(), Some(time(1)));
        // The older sample was halved while shifting: 0.5 vs 1.0
        assert_eq!(merged.percentile(0.3), OPTIONS.bucket_start(2));
        assert_eq!(merged.percentile(0.4), OPTIONS.bucket_start(9));

        let mut merged = newer.clone();
        merged.merge(&older);
        assert_eq!(merged.reference_timestamp(), Some(time(1)));
        assert_eq!(merged.percentile(0.3), OPTIONS.bucket_start(2));
        assert_eq!(merged.percentile(0.4), OPTIONS.bucket_start(9));
    }

    #[test]
    fn decaying_checkpoint_keeps_reference() {
        let mut histogram = DecayingHistogram::new(&OPTIONS, Duration::hours(1));
        histogram.add_sample(2.0, 1.0, time(3));
        let checkpoint = histogram.save_to_checkpoint();
        assert_eq!(checkpoint.reference_timestamp, Some(time(3)));
        let mut restored = DecayingHistogram::new(&OPTIONS, Duration::hours(1));
        restored.load_from_checkpoint(&checkpoint).unwrap();
        assert_eq!(restored, histogram);
    }
}
