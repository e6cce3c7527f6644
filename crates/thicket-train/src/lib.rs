//! Training driver for the residual classifier of `thicket-network`.
//!
//! [`train::train`] runs a fixed number of epochs of shuffled mini-batch Adam updates, evaluates
//! the model on the training and test sets after every epoch, decays the learning rate once the
//! training loss plateaus and checkpoints the weights along the way.

pub mod batch;
pub mod checkpoint;
pub mod dataset;
pub mod evaluate;
pub mod history;
pub mod scheduler;
pub mod train;

pub use dataset::{Dataset, DatasetError, LabelEncoder, LabeledRows};
pub use history::{EpochRecord, History};
pub use train::{train, TrainConfig, TrainError, TrainOutput};
