use std::{io, path::Path};

use burn::{
    config::Config,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use rand::{rngs::StdRng, SeedableRng};
use thicket_network::Model;
use tracing::instrument;

use crate::{
    batch::{BatchPlan, EmptyBatchError},
    checkpoint::{self, CheckpointError, CheckpointPolicy, CheckpointTiming, Checkpointer},
    dataset::Dataset,
    evaluate::{self, Evaluation},
    history::{EpochRecord, History},
    scheduler::ReduceOnPlateau,
};

// Epochs between progress reports.
const REPORT_INTERVAL: usize = 10;

#[derive(Config, Debug)]
pub struct TrainConfig {
    #[config(default = 2000)]
    pub epochs: usize,
    /// Upper bound on the mini-batch size, which never exceeds a tenth of the training set.
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 0.001)]
    pub learning_rate: f64,
    /// Number of chunks the evaluation passes are split into.
    #[config(default = 1)]
    pub test_split: usize,
    #[config(default = 50)]
    pub model_save_interval: usize,
    #[config(default = true)]
    pub save_best_train: bool,
    #[config(default = true)]
    pub save_best_test: bool,
    #[config(default = 0.5)]
    pub lr_factor: f64,
    #[config(default = 50)]
    pub lr_patience: usize,
    #[config(default = 0.0001)]
    pub min_lr: f64,
    /// Relative improvement of the training loss below which an epoch counts as a plateau.
    #[config(default = 0.0001)]
    pub lr_threshold: f64,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainConfig {
    fn checkpoint_policy(&self) -> CheckpointPolicy {
        CheckpointPolicy {
            interval: self.model_save_interval,
            save_best_train: self.save_best_train,
            save_best_test: self.save_best_test,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TrainError {
    #[error("training set cannot be split into batches")]
    EmptyBatches(#[from] EmptyBatchError),
    #[error("test samples have shape {test:?} but training samples have shape {train:?}")]
    ShapeMismatch { train: [usize; 3], test: [usize; 3] },
    #[error("failed to prepare the output directory")]
    OutputDirectory(#[source] io::Error),
    #[error("failed to write a checkpoint")]
    Checkpoint(#[from] CheckpointError),
    #[error("failed to write training logs")]
    Logs(#[from] csv::Error),
}

pub struct TrainOutput<B: AutodiffBackend> {
    pub model: Model<B>,
    pub history: History,
    pub timings: Vec<CheckpointTiming>,
}

impl<B: AutodiffBackend> TrainOutput<B> {
    /// Writes `history.csv` and `durations.csv` into `directory`.
    pub fn save_logs(&self, directory: &Path) -> Result<(), TrainError> {
        self.history.save(&directory.join("history.csv"))?;
        checkpoint::save_timings(&self.timings, &directory.join("durations.csv"))?;

        Ok(())
    }
}

/// Fits `model` to `train_set`, evaluating it on both sets after every epoch and checkpointing it
/// into `output_directory`.
#[instrument(name = "train", skip_all, fields(epochs = config.epochs))]
pub fn train<B: AutodiffBackend>(
    mut model: Model<B>,
    config: &TrainConfig,
    train_set: &Dataset,
    test_set: &Dataset,
    output_directory: &Path,
    device: &B::Device,
) -> Result<TrainOutput<B>, TrainError> {
    if train_set.sample_shape() != test_set.sample_shape() {
        return Err(TrainError::ShapeMismatch {
            train: train_set.sample_shape(),
            test: test_set.sample_shape(),
        });
    }

    let plan = BatchPlan::new(train_set.len(), config.batch_size)?;
    tracing::info!(
        batch_size = plan.batch_size(),
        drop_last = plan.drop_last(),
        train_samples = train_set.len(),
        test_samples = test_set.len(),
        "prepared batches"
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut optimizer = AdamConfig::new().with_epsilon(1e-8).init();
    let mut scheduler = ReduceOnPlateau::new(
        config.learning_rate,
        config.lr_factor,
        config.lr_patience,
        config.min_lr,
    )
    .with_threshold(config.lr_threshold);
    let mut history = History::new();
    let mut checkpointer = Checkpointer::new(output_directory, config.checkpoint_policy())
        .map_err(TrainError::OutputDirectory)?;

    checkpointer.save(&model, checkpoint::INIT_MODEL)?;
    checkpointer.restart_clock();

    for epoch in 0..config.epochs {
        let learning_rate = scheduler.learning_rate();

        for (step, indices) in plan.batches(&mut rng).into_iter().enumerate() {
            let batch = train_set.batch::<B>(&indices, device);
            let logits = model.forward(batch.features).logits;
            let loss = evaluate::summed_cross_entropy(logits, batch.targets);

            tracing::trace!(
                epoch,
                step,
                loss = loss.clone().into_scalar().elem::<f64>(),
                "trained batch"
            );

            let gradients = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(learning_rate, model, gradients);
        }

        let evaluation_model = model.valid();
        let Evaluation {
            loss: train_loss,
            accuracy: train_acc,
        } = evaluate::loss_and_accuracy(&evaluation_model, train_set, config.test_split, device);
        let Evaluation {
            loss: test_loss,
            accuracy: test_acc,
        } = evaluate::loss_and_accuracy(&evaluation_model, test_set, config.test_split, device);

        let lr = scheduler.step(train_loss);

        history.push(EpochRecord {
            epoch: epoch + 1,
            lr,
            train_loss,
            train_acc,
            test_loss,
            test_acc,
        });

        if (epoch + 1) % REPORT_INTERVAL == 0 {
            tracing::info!(
                epoch = epoch + 1,
                lr,
                train_loss,
                train_acc,
                test_loss,
                test_acc,
                "finished epoch"
            );
        }

        checkpointer.epoch_end(&model, epoch, config.epochs, &history)?;
    }

    checkpointer.save(&model, checkpoint::LAST_MODEL)?;

    Ok(TrainOutput {
        model,
        history,
        timings: checkpointer.into_timings(),
    })
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};
    use thicket_network::ModelConfig;

    use super::*;

    type TestBackend = Autodiff<NdArray>;

    // Two classes told apart by the sign of their values.
    fn dataset(samples: usize) -> Dataset {
        let labels = (0..samples).map(|sample| sample % 2).collect::<Vec<_>>();
        let features = labels
            .iter()
            .flat_map(|&label| {
                let sign = if label == 0 { -1.0 } else { 1.0 };
                (0..6).map(move |position| sign * (1.0 + position as f32 / 6.0))
            })
            .collect();

        Dataset::new(features, [samples, 1, 2, 3], labels).unwrap()
    }

    fn model() -> Model<TestBackend> {
        ModelConfig::new(2)
            .with_net_layers(6)
            .with_kernel_length_1(3)
            .with_kernel_length_2(3)
            .with_kernel_length_3(1)
            .with_feature_channels(2)
            .init(&Default::default())
            .unwrap()
    }

    fn mpk(directory: &Path, name: &str) -> bool {
        directory.join(format!("{name}.mpk")).exists()
    }

    #[test]
    fn writes_every_checkpoint_and_one_record_per_epoch() {
        let directory = tempfile::tempdir().unwrap();
        let config = TrainConfig::new()
            .with_epochs(20)
            .with_model_save_interval(5);

        let output = train(
            model(),
            &config,
            &dataset(20),
            &dataset(6),
            directory.path(),
            &Default::default(),
        )
        .unwrap();

        assert_eq!(output.history.len(), 20);
        assert_eq!(
            output
                .history
                .records()
                .iter()
                .map(|record| record.epoch)
                .collect::<Vec<_>>(),
            (1..=20).collect::<Vec<_>>()
        );
        assert_eq!(
            output
                .timings
                .iter()
                .map(|timing| timing.epoch)
                .collect::<Vec<_>>(),
            vec![5, 10, 15, 20]
        );

        for name in [
            checkpoint::INIT_MODEL,
            checkpoint::LAST_MODEL,
            checkpoint::BEST_TRAIN_MODEL,
            checkpoint::BEST_TEST_MODEL,
        ] {
            assert!(mpk(directory.path(), name), "missing {name}");
        }

        for epoch in [5, 10, 15, 20] {
            assert!(mpk(directory.path(), &checkpoint::periodic_model_name(epoch)));
        }

        let checkpoint_count = std::fs::read_dir(directory.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .is_ok_and(|entry| entry.path().extension().is_some_and(|ext| ext == "mpk"))
            })
            .count();
        assert_eq!(checkpoint_count, 8);

        output.save_logs(directory.path()).unwrap();
        let history = std::fs::read_to_string(directory.path().join("history.csv")).unwrap();
        assert_eq!(history.lines().count(), 21);
    }

    #[test]
    fn records_metrics_in_range() {
        let directory = tempfile::tempdir().unwrap();
        let config = TrainConfig::new()
            .with_epochs(3)
            .with_learning_rate(0.01)
            .with_test_split(2)
            .with_save_best_train(false)
            .with_save_best_test(false);

        let output = train(
            model(),
            &config,
            &dataset(31),
            &dataset(8),
            directory.path(),
            &Default::default(),
        )
        .unwrap();

        for record in output.history.records() {
            assert_eq!(record.lr, 0.01);
            assert!(record.train_loss.is_finite() && record.train_loss >= 0.0);
            assert!((0.0..=1.0).contains(&record.train_acc));
            assert!((0.0..=1.0).contains(&record.test_acc));
        }

        assert!(!mpk(directory.path(), checkpoint::BEST_TRAIN_MODEL));
        assert!(mpk(directory.path(), &checkpoint::periodic_model_name(3)));
    }

    #[test]
    fn lowers_the_training_loss() {
        let directory = tempfile::tempdir().unwrap();
        let config = TrainConfig::new()
            .with_epochs(30)
            .with_learning_rate(0.01)
            .with_save_best_train(false)
            .with_save_best_test(false);

        let output = train(
            model(),
            &config,
            &dataset(20),
            &dataset(6),
            directory.path(),
            &Default::default(),
        )
        .unwrap();

        let records = output.history.records();
        let first = records.first().unwrap().train_loss;
        let last = records.last().unwrap().train_loss;

        assert!(last < first, "train loss went from {first} to {last}");
    }

    #[test]
    fn decays_the_learning_rate_on_plateaus() {
        let directory = tempfile::tempdir().unwrap();
        // No loss can improve on the best by a relative threshold of one.
        let config = TrainConfig::new()
            .with_epochs(4)
            .with_learning_rate(0.01)
            .with_lr_patience(0)
            .with_lr_threshold(1.0)
            .with_min_lr(0.002);

        let output = train(
            model(),
            &config,
            &dataset(20),
            &dataset(6),
            directory.path(),
            &Default::default(),
        )
        .unwrap();

        assert_eq!(
            output
                .history
                .records()
                .iter()
                .map(|record| record.lr)
                .collect::<Vec<_>>(),
            vec![0.005, 0.0025, 0.002, 0.002]
        );
    }

    #[test]
    fn rejects_tiny_training_sets() {
        let directory = tempfile::tempdir().unwrap();

        assert!(matches!(
            train(
                model(),
                &TrainConfig::new().with_epochs(1),
                &dataset(9),
                &dataset(4),
                directory.path(),
                &Default::default(),
            ),
            Err(TrainError::EmptyBatches(_))
        ));
    }

    #[test]
    fn rejects_mismatched_sample_shapes() {
        let directory = tempfile::tempdir().unwrap();
        let test_set = Dataset::new(vec![0.0; 8], [2, 1, 2, 2], vec![0, 1]).unwrap();

        assert!(matches!(
            train(
                model(),
                &TrainConfig::new().with_epochs(1),
                &dataset(20),
                &test_set,
                directory.path(),
                &Default::default(),
            ),
            Err(TrainError::ShapeMismatch { .. })
        ));
    }
}
