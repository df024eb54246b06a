//! Deterministic distributed sampling over blocks of rows.
//!
//! For epoch `e`, every replica independently:
//!
//! 1. seeds a ChaCha20 generator with `e` and permutes `0..N` (or keeps the
//!    identity order when not shuffling),
//! 2. pads the permutation to `total = ceil(N / (R * B)) * R * B` by repeating
//!    it from the start,
//! 3. cuts it into blocks of `B` consecutive indices and takes every `R`-th
//!    block, starting at its own rank.
//!
//! No coordination is needed: the shared epoch number makes all replicas
//! compute the same permutation. Padding repeats a few rows when `N` is not a
//! multiple of `R * B`, which keeps the batch count identical on every
//! replica.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use crate::{DataError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSampler {
    num_rows: usize,
    replicas: usize,
    rank: usize,
    block: usize,
    shuffle: bool,
}

impl DistributedSampler {
    pub fn new(num_rows: usize, replicas: usize, rank: usize, block: usize, shuffle: bool) -> Result<Self> {
        if replicas == 0 || block == 0 {
            return Err(DataError::Config(format!(
                "sampler needs at least one replica and a positive block size (got {replicas}, {block})"
            )));
        }
        if rank >= replicas {
            return Err(DataError::Config(format!(
                "rank {rank} out of range for {replicas} replicas"
            )));
        }
        Ok(Self {
            num_rows,
            replicas,
            rank,
            block,
            shuffle,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn block_size(&self) -> usize {
        self.block
    }

    /// Blocks each replica receives per epoch.
    pub fn blocks_per_replica(&self) -> usize {
        self.num_rows.div_ceil(self.replicas * self.block)
    }

    /// Length of the padded permutation shared by all replicas.
    pub fn total_size(&self) -> usize {
        self.blocks_per_replica() * self.replicas * self.block
    }

    /// The full padded ordering for `epoch`, identical on every replica.
    pub fn permutation(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.num_rows).collect();
        if self.shuffle {
            let mut rng = ChaCha20Rng::seed_from_u64(epoch);
            order.shuffle(&mut rng);
        }
        let total = self.total_size();
        if order.is_empty() {
            return order;
        }
        let mut i = 0;
        while order.len() < total {
            order.push(order[i]);
            i += 1;
        }
        order
    }

    /// This replica's blocks for `epoch`, in order.
    pub fn blocks(&self, epoch: u64) -> Vec<Vec<usize>> {
        let order = self.permutation(epoch);
        let stride = self.replicas * self.block;
        (0..self.blocks_per_replica())
            .map(|k| {
                let start = k * stride + self.rank * self.block;
                order[start..start + self.block].to_vec()
            })
            .collect()
    }

    /// This replica's indices for `epoch`, blocks flattened.
    pub fn indices(&self, epoch: u64) -> Vec<usize> {
        self.blocks(epoch).concat()
    }
}
