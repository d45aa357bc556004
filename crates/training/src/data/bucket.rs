//! Length-bucketed, worker-sharded batch planning.
//!
//! Every worker derives the same global plan from `(seed, epoch)` and keeps
//! the batches at positions `rank, rank + W, rank + 2W, ...`. Examples are
//! never repeated or dropped, so the union over all workers covers the
//! dataset exactly once. The global batch count is made divisible by `W` by
//! halving the largest batches, which keeps step counts identical across
//! workers.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::debug;

use crate::TrainingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    pub bucket: usize,
    pub indices: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct BucketedBatchSource {
    boundaries: Vec<usize>,
    buckets: Vec<Vec<usize>>,
    batch_size: usize,
    world_size: usize,
    seed: u64,
    batches_per_epoch: usize,
}

impl BucketedBatchSource {
    pub fn new(
        lengths: &[usize],
        boundaries: &[usize],
        batch_size: usize,
        world_size: usize,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        if boundaries.is_empty() {
            return Err(TrainingError::initialization(
                "bucketed sampling requires at least one boundary",
            ));
        }
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if world_size == 0 {
            return Err(TrainingError::initialization(
                "world size must be greater than zero",
            ));
        }
        if lengths.len() < world_size {
            return Err(TrainingError::initialization(format!(
                "dataset has {} examples but {} workers need at least one batch each",
                lengths.len(),
                world_size
            )));
        }

        let mut buckets = vec![Vec::new(); boundaries.len()];
        for (index, &length) in lengths.iter().enumerate() {
            buckets[bucket_index(boundaries, length)].push(index);
        }

        let natural: usize = buckets
            .iter()
            .map(|bucket| bucket.len().div_ceil(batch_size))
            .sum();
        let batches_per_epoch = natural.div_ceil(world_size) * world_size;
        if batches_per_epoch > lengths.len() {
            return Err(TrainingError::initialization(format!(
                "cannot split {} examples into {} equal shards of whole batches",
                lengths.len(),
                world_size
            )));
        }

        debug!(
            buckets = ?buckets.iter().map(Vec::len).collect::<Vec<_>>(),
            batches_per_epoch,
            world_size,
            "planned bucketed sampling"
        );

        Ok(Self {
            boundaries: boundaries.to_vec(),
            buckets,
            batch_size,
            world_size,
            seed,
            batches_per_epoch,
        })
    }

    /// First boundary at or above `length`; overlong lengths use the last.
    pub fn bucket_for(&self, length: usize) -> usize {
        bucket_index(&self.boundaries, length)
    }

    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(Vec::len).collect()
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn batches_per_worker(&self) -> usize {
        self.batches_per_epoch / self.world_size
    }

    /// Global batch list for `epoch`, identical on every worker.
    pub fn epoch_plan(&self, epoch: u64) -> Vec<PlannedBatch> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
        let mut batches = Vec::with_capacity(self.batches_per_epoch);
        for (bucket, members) in self.buckets.iter().enumerate() {
            if members.is_empty() {
                continue;
            }
            let mut shuffled = members.clone();
            shuffled.shuffle(&mut rng);
            for chunk in shuffled.chunks(self.batch_size) {
                batches.push(PlannedBatch {
                    bucket,
                    indices: chunk.to_vec(),
                });
            }
        }

        while batches.len() < self.batches_per_epoch {
            let Some(largest) = largest_splittable(&batches) else {
                break;
            };
            let mid = batches[largest].indices.len() / 2;
            let tail = batches[largest].indices.split_off(mid);
            let bucket = batches[largest].bucket;
            batches.insert(
                largest + 1,
                PlannedBatch {
                    bucket,
                    indices: tail,
                },
            );
        }

        batches.shuffle(&mut rng);
        batches
    }

    /// Batches owned by worker `rank` for `epoch`.
    pub fn batches_for(&self, epoch: u64, rank: usize) -> Result<Vec<PlannedBatch>, TrainingError> {
        if rank >= self.world_size {
            return Err(TrainingError::runtime(format!(
                "rank {rank} outside world of {} workers",
                self.world_size
            )));
        }
        Ok(self
            .epoch_plan(epoch)
            .into_iter()
            .skip(rank)
            .step_by(self.world_size)
            .collect())
    }
}

fn bucket_index(boundaries: &[usize], length: usize) -> usize {
    boundaries
        .iter()
        .position(|&boundary| length <= boundary)
        .unwrap_or(boundaries.len() - 1)
}

fn largest_splittable(batches: &[PlannedBatch]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, batch) in batches.iter().enumerate() {
        if batch.indices.len() < 2 {
            continue;
        }
        match best {
            Some(current) if batches[current].indices.len() >= batch.indices.len() => {}
            _ => best = Some(idx),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn scenario_lengths() -> Vec<usize> {
        let mut lengths = vec![10; 10];
        lengths.extend(vec![300; 10]);
        lengths
    }

    #[test]
    fn buckets_never_mix_lengths() {
        let source = BucketedBatchSource::new(&scenario_lengths(), &[32, 300, 400], 4, 1, 7).unwrap();
        assert_eq!(source.bucket_sizes(), vec![10, 10, 0]);

        let plan = source.batches_for(0, 0).unwrap();
        let mut seen = BTreeSet::new();
        for batch in &plan {
            assert!(batch.indices.len() <= 4);
            for &idx in &batch.indices {
                let expected_bucket = if idx < 10 { 0 } else { 1 };
                assert_eq!(batch.bucket, expected_bucket, "batch {batch:?}");
                assert!(seen.insert(idx));
            }
        }
        assert_eq!(seen.len(), 20);
        // 10 -> 4 + 4 + 2 per bucket
        assert_eq!(plan.len(), 6);
    }

    #[test]
    fn overlong_examples_join_last_bucket() {
        let source = BucketedBatchSource::new(&[5, 5000, 350], &[32, 300, 400], 2, 1, 0).unwrap();
        assert_eq!(source.bucket_for(5000), 2);
        assert_eq!(source.bucket_for(32), 0);
        assert_eq!(source.bucket_for(33), 1);
        assert_eq!(source.bucket_sizes(), vec![1, 0, 2]);
    }

    #[test]
    fn workers_receive_equal_batch_counts() {
        // 7 natural batches across 3 workers: two splits bring it to 9.
        let lengths = vec![10; 25];
        let source = BucketedBatchSource::new(&lengths, &[32], 4, 3, 1).unwrap();
        assert_eq!(source.batches_per_worker(), 3);
        for rank in 0..3 {
            assert_eq!(source.batches_for(2, rank).unwrap().len(), 3);
        }
    }

    #[test]
    fn impossible_sharding_is_rejected() {
        assert!(BucketedBatchSource::new(&[10, 10, 10], &[32], 1, 2, 0).is_err());
        assert!(BucketedBatchSource::new(&[10], &[32], 1, 2, 0).is_err());
    }

    #[test]
    fn new_epoch_reshuffles() {
        let lengths = vec![100; 64];
        let source = BucketedBatchSource::new(&lengths, &[300], 8, 1, 3).unwrap();
        assert_eq!(source.epoch_plan(1), source.epoch_plan(1));
        assert_ne!(source.epoch_plan(1), source.epoch_plan(2));
    }

    proptest! {
        #[test]
        fn every_example_seen_exactly_once(
            lengths in proptest::collection::vec(1usize..600, 8..80),
            batch_size in 1usize..6,
            world_size in 1usize..4,
            epoch in 0u64..4,
        ) {
            let source = match BucketedBatchSource::new(&lengths, &[32, 300, 400], batch_size, world_size, 11) {
                Ok(source) => source,
                Err(_) => return Ok(()),
            };
            let mut seen = Vec::new();
            let mut counts = BTreeSet::new();
            for rank in 0..world_size {
                let batches = source.batches_for(epoch, rank).unwrap();
                counts.insert(batches.len());
                for batch in batches {
                    prop_assert!(!batch.indices.is_empty());
                    for idx in batch.indices {
                        prop_assert_eq!(source.bucket_for(lengths[idx]), batch.bucket);
                        seen.push(idx);
                    }
                }
            }
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..lengths.len()).collect::<Vec<_>>());
            prop_assert_eq!(counts.len(), 1);
        }
    }
}
