//! Epoch iteration: sampler blocks -> fetched rows -> collated batches.

use crate::collate::{collate, Batch};
use crate::dataset::{DialDataset, Split};
use crate::sampler::DistributedSampler;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Rows per batch before filtering; rounded down to whole blocks
    pub batch_size: usize,
    pub shuffle: bool,
    pub world_size: usize,
    pub rank: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            world_size: 1,
            rank: 0,
        }
    }
}

/// Serves one replica's share of a dataset, one epoch at a time.
///
/// Only the training split is partitioned across replicas; validation and
/// test splits are read whole by every replica.
pub struct BatchLoader<'a> {
    dataset: &'a DialDataset,
    sampler: DistributedSampler,
    blocks_per_batch: usize,
}

impl<'a> BatchLoader<'a> {
    pub fn new(dataset: &'a DialDataset, options: LoaderOptions) -> Result<Self> {
        let (replicas, rank) = match dataset.split() {
            Split::Train => (options.world_size, options.rank),
            Split::Valid | Split::Test => (1, 0),
        };
        let block = dataset.batch_access();
        let sampler = DistributedSampler::new(dataset.len(), replicas, rank, block, options.shuffle)?;
        Ok(Self {
            dataset,
            sampler,
            blocks_per_batch: (options.batch_size / block).max(1),
        })
    }

    pub fn sampler(&self) -> &DistributedSampler {
        &self.sampler
    }

    /// Upper bound on the batches of one epoch.
    pub fn batches_per_epoch(&self) -> usize {
        self.sampler.blocks_per_replica().div_ceil(self.blocks_per_batch)
    }

    /// Batches of `epoch`. Batches left empty by the degeneracy filter are
    /// skipped.
    pub fn epoch(&self, epoch: u64) -> impl Iterator<Item = Result<Batch>> + '_ {
        let blocks = self.sampler.blocks(epoch);
        let groups: Vec<Vec<Vec<usize>>> = blocks
            .chunks(self.blocks_per_batch)
            .map(<[Vec<usize>]>::to_vec)
            .collect();
        groups
            .into_iter()
            .map(move |group| {
                let fetched = group
                    .iter()
                    .map(|rows| self.dataset.fetch_rows(rows))
                    .collect::<Result<Vec<_>>>()?;
                Ok(collate(fetched)?)
            })
            .filter(|batch| !matches!(batch, Ok(b) if b.is_empty()))
    }
}
