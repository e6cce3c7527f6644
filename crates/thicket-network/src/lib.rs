//! A residual convolutional classifier.
//!
//! The network stacks `net_layers / cross_layer` residual blocks over a single channel input, pools
//! the final feature maps globally and classifies them with a linear head.

pub mod model;

pub use model::{block_channels, Model, ModelConfig, ModelConfigError, ModelOutput, ResidualBlock};
