use rand::{seq::SliceRandom, Rng};

/// The mini-batch size used for `train_size` samples: a tenth of the data, capped at `requested`.
pub fn effective_batch_size(train_size: usize, requested: usize) -> usize {
    (train_size / 10).min(requested)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{train_size} training samples with a requested batch size of {requested} give empty batches")]
pub struct EmptyBatchError {
    pub train_size: usize,
    pub requested: usize,
}

/// How an epoch's training samples are split into mini-batches. Computed once per training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    train_size: usize,
    batch_size: usize,
    drop_last: bool,
}

impl BatchPlan {
    pub fn new(train_size: usize, requested: usize) -> Result<Self, EmptyBatchError> {
        match effective_batch_size(train_size, requested) {
            0 => Err(EmptyBatchError {
                train_size,
                requested,
            }),
            batch_size => Ok(Self {
                train_size,
                batch_size,
                // A lone trailing sample would give batch normalization a degenerate batch.
                drop_last: train_size % batch_size == 1,
            }),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn drop_last(&self) -> bool {
        self.drop_last
    }

    /// Shuffles the sample indices and chunks them into batches.
    pub fn batches(&self, rng: &mut impl Rng) -> Vec<Vec<usize>> {
        let mut indices = (0..self.train_size).collect::<Vec<_>>();
        indices.shuffle(rng);

        if self.drop_last {
            indices
                .chunks_exact(self.batch_size)
                .map(<[usize]>::to_vec)
                .collect()
        } else {
            indices
                .chunks(self.batch_size)
                .map(<[usize]>::to_vec)
                .collect()
        }
    }
}
