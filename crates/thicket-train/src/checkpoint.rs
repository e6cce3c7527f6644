use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, RecorderError},
    tensor::backend::Backend,
};
use serde::Serialize;
use thicket_network::Model;

use crate::history::History;

pub const INIT_MODEL: &str = "init_model";
pub const LAST_MODEL: &str = "last_model";
pub const BEST_TRAIN_MODEL: &str = "best_train_model";
pub const BEST_TEST_MODEL: &str = "best_test_model";

pub fn periodic_model_name(epoch: usize) -> String {
    format!("model_epoch_{epoch}")
}

type Recorder = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Debug, thiserror::Error)]
#[error("failed to access checkpoint `{}`", .path.display())]
pub struct CheckpointError {
    pub path: PathBuf,
    #[source]
    source: RecorderError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// Epochs between periodic checkpoints, zero keeps only the final epoch's.
    pub interval: usize,
    pub save_best_train: bool,
    pub save_best_test: bool,
}

/// Wall-clock training time elapsed when a periodic checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointTiming {
    pub epoch: usize,
    pub elapsed: Duration,
}

#[derive(Serialize)]
struct TimingRow {
    epoch: usize,
    elapsed_secs: f64,
}

pub fn save_timings(timings: &[CheckpointTiming], path: &Path) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;

    for timing in timings {
        writer.serialize(TimingRow {
            epoch: timing.epoch,
            elapsed_secs: timing.elapsed.as_secs_f64(),
        })?;
    }

    Ok(writer.flush()?)
}

/// Restores weights saved under `path` (without the recorder's extension) into `model`.
pub fn load_model<B: Backend>(
    model: Model<B>,
    path: &Path,
    device: &B::Device,
) -> Result<Model<B>, CheckpointError> {
    model
        .load_file(path.to_path_buf(), &Recorder::new(), device)
        .map_err(|source| CheckpointError {
            path: path.to_path_buf(),
            source,
        })
}

pub struct Checkpointer {
    directory: PathBuf,
    policy: CheckpointPolicy,
    recorder: Recorder,
    started: Instant,
    timings: Vec<CheckpointTiming>,
}

impl Checkpointer {
    pub fn new(directory: impl Into<PathBuf>, policy: CheckpointPolicy) -> io::Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        Ok(Self {
            directory,
            policy,
            recorder: Recorder::new(),
            started: Instant::now(),
            timings: Vec::new(),
        })
    }

    /// Starts measuring training time from now.
    pub fn restart_clock(&mut self) {
        self.started = Instant::now();
    }

    pub fn save<B: Backend>(&self, model: &Model<B>, name: &str) -> Result<PathBuf, CheckpointError> {
        let path = self.directory.join(name);

        model
            .clone()
            .save_file(path.clone(), &self.recorder)
            .map_err(|source| CheckpointError {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), "saved checkpoint");

        Ok(path)
    }

    /// Applies the policy once the record of the zero-based `epoch` has been pushed to `history`,
    /// returning the paths written.
    pub fn epoch_end<B: Backend>(
        &mut self,
        model: &Model<B>,
        epoch: usize,
        total_epochs: usize,
        history: &History,
    ) -> Result<Vec<PathBuf>, CheckpointError> {
        let mut saved = Vec::new();

        let Some(record) = history.last() else {
            return Ok(saved);
        };

        if self.policy.save_best_train
            && history
                .min_train_loss()
                .is_some_and(|best| record.train_loss <= best)
        {
            saved.push(self.save(model, BEST_TRAIN_MODEL)?);
        }

        if self.policy.save_best_test
            && history
                .max_test_acc()
                .is_some_and(|best| record.test_acc >= best)
        {
            saved.push(self.save(model, BEST_TEST_MODEL)?);
        }

        let completed = epoch + 1;
        let periodic = self.policy.interval > 0 && completed % self.policy.interval == 0;

        if periodic || completed == total_epochs {
            saved.push(self.save(model, &periodic_model_name(completed))?);

            let timing = CheckpointTiming {
                epoch: completed,
                elapsed: self.started.elapsed(),
            };
            tracing::info!(
                epoch = completed,
                elapsed_secs = timing.elapsed.as_secs_f64(),
                "saved periodic checkpoint"
            );
            self.timings.push(timing);
        }

        Ok(saved)
    }

    pub fn timings(&self) -> &[CheckpointTiming] {
        &self.timings
    }

    pub fn into_timings(self) -> Vec<CheckpointTiming> {
        self.timings
    }
}
