use std::{
    error::Error,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use burn::{
    backend::{Autodiff, NdArray},
    config::Config,
    tensor::backend::{AutodiffBackend, Backend},
};
use burn_wgpu::Wgpu;
use clap::{Args, Parser, Subcommand, ValueEnum};
use thicket_network::ModelConfig;
use thicket_train::{checkpoint, evaluate, LabelEncoder, LabeledRows, TrainConfig};
use tracing::Level;
use tracing_subscriber::EnvFilter;

const MODEL_CONFIG: &str = "model_config.json";
const TRAIN_CONFIG: &str = "train_config.json";
const LABELS: &str = "labels.csv";

#[derive(Parser)]
#[command(version = "0.1.0")]
#[command(about = "Residual convolutional classifier for labeled numeric rows")]
struct Cli {
    #[arg(
        short,
        long,
        help = "Write JSON traces to the specified file after truncating or creating it, instead of logging to stderr"
    )]
    trace_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Ndarray,
    Wgpu,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Train a model, writing checkpoints and logs into an output directory")]
    Train(TrainArgs),
    #[command(about = "Report the loss and accuracy of a saved checkpoint on a dataset")]
    Evaluate(EvaluateArgs),
}

#[derive(Args)]
struct TrainArgs {
    #[arg(long, help = "Training rows, `label, value, ...`, tab separated for `.tsv` files")]
    train: PathBuf,
    #[arg(long, help = "Test rows in the same format as the training rows")]
    test: PathBuf,
    #[arg(short, long, help = "Directory receiving checkpoints, configurations and logs")]
    output: PathBuf,
    #[arg(long, help = "Model configuration JSON, the class count is always taken from the data")]
    model_config: Option<PathBuf>,
    #[arg(long, help = "Training configuration JSON")]
    train_config: Option<PathBuf>,
    #[arg(long, default_value_t = 1, help = "Height every row is folded into")]
    height: usize,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = BackendKind::Ndarray)]
    backend: BackendKind,
}

#[derive(Args)]
struct EvaluateArgs {
    #[arg(long, help = "Rows to evaluate on")]
    data: PathBuf,
    #[arg(long, help = "Output directory of a previous `train` run")]
    run: PathBuf,
    #[arg(long, default_value = checkpoint::BEST_TEST_MODEL, help = "Checkpoint name inside the run directory")]
    checkpoint: String,
    #[arg(long, default_value_t = 1, help = "Height every row is folded into")]
    height: usize,
    #[arg(long, default_value_t = 1, help = "Number of chunks the evaluation is split into")]
    split_count: usize,
    #[arg(long, value_enum, default_value_t = BackendKind::Ndarray)]
    backend: BackendKind,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CliError {
    #[error("failed to load configuration `{}`: {reason}", .path.display())]
    InvalidConfig { path: PathBuf, reason: String },
    #[error("failed to save configuration `{}`", .path.display())]
    SaveConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn initialize_tracing(trace_file: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    match trace_file {
        Some(trace_file) => {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(File::create(trace_file)?)
                .event_format(tracing_subscriber::fmt::format().without_time().json())
                .with_max_level(Level::TRACE)
                .finish();

            Ok(tracing::subscriber::set_global_default(subscriber)?)
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(io::stderr)
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .finish();

            Ok(tracing::subscriber::set_global_default(subscriber)?)
        }
    }
}

fn load_config<C: Config>(path: &Path) -> Result<C, CliError> {
    C::load(path).map_err(|error| CliError::InvalidConfig {
        path: path.to_path_buf(),
        reason: format!("{error:?}"),
    })
}

fn save_config<C: Config>(config: &C, path: PathBuf) -> Result<(), CliError> {
    config
        .save(&path)
        .map_err(|source| CliError::SaveConfig { path, source })
}

fn run_training<B: AutodiffBackend>(
    args: TrainArgs,
    device: &B::Device,
) -> Result<(), Box<dyn Error>> {
    let train_rows = LabeledRows::read(&args.train)?;
    let test_rows = LabeledRows::read(&args.test)?;
    let encoder = LabelEncoder::fit([train_rows.labels(), test_rows.labels()]);
    let train_set = train_rows.into_dataset(&encoder, args.height)?;
    let test_set = test_rows.into_dataset(&encoder, args.height)?;

    tracing::info!(
        classes = encoder.len(),
        train_samples = train_set.len(),
        test_samples = test_set.len(),
        sample_shape = ?train_set.sample_shape(),
        "loaded datasets"
    );

    let mut model_config = match &args.model_config {
        Some(path) => load_config::<ModelConfig>(path)?,
        None => ModelConfig::new(encoder.len()),
    };
    model_config.num_classes = encoder.len();

    let mut train_config = match &args.train_config {
        Some(path) => load_config::<TrainConfig>(path)?,
        None => TrainConfig::new(),
    };
    train_config.epochs = args.epochs.unwrap_or(train_config.epochs);
    train_config.batch_size = args.batch_size.unwrap_or(train_config.batch_size);
    train_config.learning_rate = args.learning_rate.unwrap_or(train_config.learning_rate);
    train_config.seed = args.seed.unwrap_or(train_config.seed);

    let model = model_config.init::<B>(device)?;
    tracing::info!(blocks = model.blocks().len(), "initialized network");

    fs::create_dir_all(&args.output)?;
    save_config(&model_config, args.output.join(MODEL_CONFIG))?;
    save_config(&train_config, args.output.join(TRAIN_CONFIG))?;
    encoder.save(&args.output.join(LABELS))?;

    let output = thicket_train::train(
        model,
        &train_config,
        &train_set,
        &test_set,
        &args.output,
        device,
    )?;
    output.save_logs(&args.output)?;

    if let Some(best) = output.history.best_test_epoch() {
        tracing::info!(
            epoch = best.epoch,
            test_loss = best.test_loss,
            test_acc = best.test_acc,
            "best test epoch"
        );
    }

    if let Some(last) = output.history.last() {
        tracing::info!(
            train_loss = last.train_loss,
            train_acc = last.train_acc,
            test_loss = last.test_loss,
            test_acc = last.test_acc,
            "finished training"
        );
    }

    Ok(())
}

fn run_evaluation<B: Backend>(
    args: EvaluateArgs,
    device: &B::Device,
) -> Result<evaluate::Evaluation, Box<dyn Error>> {
    let model_config = load_config::<ModelConfig>(&args.run.join(MODEL_CONFIG))?;
    let encoder = LabelEncoder::load(&args.run.join(LABELS))?;
    let dataset = LabeledRows::read(&args.data)?.into_dataset(&encoder, args.height)?;

    let model = checkpoint::load_model(
        model_config.init::<B>(device)?,
        &args.run.join(&args.checkpoint),
        device,
    )?;
    tracing::info!(checkpoint = %args.checkpoint, "loaded network");

    Ok(evaluate::loss_and_accuracy(
        &model,
        &dataset,
        args.split_count,
        device,
    ))
}

fn evaluate_checkpoint(args: EvaluateArgs) -> Result<(), Box<dyn Error>> {
    let evaluation = match args.backend {
        BackendKind::Ndarray => run_evaluation::<NdArray>(args, &Default::default()),
        BackendKind::Wgpu => run_evaluation::<Wgpu>(args, &Default::default()),
    }?;

    println!(
        "loss: {:.6} | accuracy: {:.4}",
        evaluation.loss, evaluation.accuracy
    );

    Ok(())
}

pub fn cli() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    initialize_tracing(cli.trace_file)?;

    match cli.command {
        Command::Train(args) => match args.backend {
            BackendKind::Ndarray => run_training::<Autodiff<NdArray>>(args, &Default::default()),
            BackendKind::Wgpu => run_training::<Autodiff<Wgpu>>(args, &Default::default()),
        },
        Command::Evaluate(args) => evaluate_checkpoint(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn write_rows(path: &Path, samples: usize) {
        let rows = (0..samples)
            .map(|sample| {
                let (label, sign) = if sample % 2 == 0 { (-1, -1.0) } else { (1, 1.0) };
                let values = (0..8)
                    .map(|position| (sign * (1.0 + position as f32 / 8.0)).to_string())
                    .collect::<Vec<_>>()
                    .join(",");

                format!("{label},{values}\n")
            })
            .collect::<String>();

        fs::write(path, rows).unwrap();
    }

    #[test]
    fn parses_train_overrides() {
        let cli = parse(&[
            "thicket",
            "train",
            "--train",
            "a.csv",
            "--test",
            "b.csv",
            "-o",
            "out",
            "--epochs",
            "7",
            "--backend",
            "wgpu",
        ]);

        let Command::Train(args) = cli.command else {
            panic!("expected the train command");
        };

        assert_eq!(args.epochs, Some(7));
        assert_eq!(args.height, 1);
        assert_eq!(args.backend, BackendKind::Wgpu);
        assert!(args.batch_size.is_none());
    }

    #[test]
    fn evaluates_the_best_test_checkpoint_by_default() {
        let cli = parse(&["thicket", "evaluate", "--data", "c.csv", "--run", "out"]);

        let Command::Evaluate(args) = cli.command else {
            panic!("expected the evaluate command");
        };

        assert_eq!(args.checkpoint, checkpoint::BEST_TEST_MODEL);
        assert_eq!(args.backend, BackendKind::Ndarray);
    }

    #[test]
    fn trains_then_evaluates_a_run() {
        let directory = tempfile::tempdir().unwrap();
        let train = directory.path().join("train.csv");
        let test = directory.path().join("test.csv");
        let output = directory.path().join("run");
        let model_config = directory.path().join("model.json");

        write_rows(&train, 20);
        write_rows(&test, 6);
        ModelConfig::new(1)
            .with_net_layers(3)
            .with_kernel_length_1(3)
            .with_kernel_length_2(3)
            .with_kernel_length_3(3)
            .with_feature_channels(2)
            .save(&model_config)
            .unwrap();

        run_training::<Autodiff<NdArray>>(
            TrainArgs {
                train,
                test: test.clone(),
                output: output.clone(),
                model_config: Some(model_config),
                train_config: None,
                height: 2,
                epochs: Some(2),
                batch_size: None,
                learning_rate: None,
                seed: Some(1),
                backend: BackendKind::Ndarray,
            },
            &Default::default(),
        )
        .unwrap();

        for file in [MODEL_CONFIG, TRAIN_CONFIG, LABELS, "history.csv", "durations.csv"] {
            assert!(output.join(file).exists(), "missing {file}");
        }

        let saved = load_config::<ModelConfig>(&output.join(MODEL_CONFIG)).unwrap();
        assert_eq!(saved.num_classes, 2);
        assert_eq!(load_config::<TrainConfig>(&output.join(TRAIN_CONFIG)).unwrap().epochs, 2);

        let evaluation = run_evaluation::<NdArray>(
            EvaluateArgs {
                data: test,
                run: output,
                checkpoint: checkpoint::LAST_MODEL.to_owned(),
                height: 2,
                split_count: 2,
                backend: BackendKind::Ndarray,
            },
            &Default::default(),
        )
        .unwrap();

        assert!(evaluation.loss.is_finite());
        assert!((0.0..=1.0).contains(&evaluation.accuracy));
    }

    #[test]
    fn reports_missing_configurations() {
        let directory = tempfile::tempdir().unwrap();

        assert!(matches!(
            load_config::<ModelConfig>(&directory.path().join("missing.json")),
            Err(CliError::InvalidConfig { .. })
        ));
    }
}
