// Batch sampler: seeded per-epoch shuffle, optionally grouped by length

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Megabatches span this many batches when grouping by length
const MEGABATCH_MULT: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct BatchSampler {
    batch_size: usize,
    group_by_length: bool,
    seed: u64,
}

impl BatchSampler {
    pub fn new(batch_size: usize, group_by_length: bool, seed: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            group_by_length,
            seed,
        }
    }

    /// Number of batches per epoch (the last one may be short)
    pub fn num_batches(&self, num_rows: usize) -> usize {
        num_rows.div_ceil(self.batch_size)
    }

    /// Row indices for every batch of `epoch`.
    ///
    /// With length grouping the permutation is cut into megabatches, each
    /// sorted longest first, and the megabatch holding the longest row goes
    /// first so memory peaks on the first step.
    pub fn epoch_batches(&self, lengths: &[usize], epoch: usize) -> Vec<Vec<usize>> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        let mut order: Vec<usize> = (0..lengths.len()).collect();
        order.shuffle(&mut rng);

        if self.group_by_length && !order.is_empty() {
            let megabatch = self.batch_size * MEGABATCH_MULT;
            let mut megabatches: Vec<Vec<usize>> = order
                .chunks(megabatch)
                .map(|chunk| {
                    let mut chunk = chunk.to_vec();
                    chunk.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
                    chunk
                })
                .collect();

            let longest = megabatches
                .iter()
                .enumerate()
                .max_by_key(|(_, mb)| mb.first().map_or(0, |&i| lengths[i]))
                .map_or(0, |(i, _)| i);
            megabatches.swap(0, longest);

            order = megabatches.into_iter().flatten().collect();
        }

        order.chunks(self.batch_size).map(<[usize]>::to_vec).collect()
    }
}
