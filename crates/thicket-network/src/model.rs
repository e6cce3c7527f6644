use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Input and output channel widths of the residual block at `index`.
///
/// The first block lifts the single input channel to `feature_channels`, the second doubles it and
/// every later block keeps the doubled width.
pub fn block_channels(index: usize, feature_channels: usize) -> (usize, usize) {
    match index {
        0 => (1, feature_channels),
        1 => (feature_channels, feature_channels * 2),
        _ => (feature_channels * 2, feature_channels * 2),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ModelConfigError {
    #[error("cross layer must be positive")]
    ZeroCrossLayer,
    #[error("{net_layers} layers with a cross layer of {cross_layer} yield no residual blocks")]
    NoBlocks {
        net_layers: usize,
        cross_layer: usize,
    },
    #[error("feature channel count must be positive")]
    ZeroFeatureChannels,
    #[error("class count must be positive")]
    ZeroClasses,
    #[error("kernel length {0} must be odd so that padding preserves the spatial dimensions")]
    EvenKernel(usize),
}

#[derive(Module, Debug)]
struct ConvStage<B: Backend> {
    conv: Conv2d<B>,
    batch_norm: BatchNorm<B, 2>,
    activation: Option<Relu>,
}

impl<B: Backend> ConvStage<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.batch_norm.forward(x);

        match &self.activation {
            Some(activation) => activation.forward(x),
            None => x,
        }
    }
}

#[derive(Config, Debug)]
struct ConvStageConfig {
    in_channels: usize,
    out_channels: usize,
    kernel_length: usize,
    activated: bool,
}

impl ConvStageConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> ConvStage<B> {
        ConvStage {
            conv: Conv2dConfig::new(
                [self.in_channels, self.out_channels],
                [self.kernel_length, self.kernel_length],
            )
            .with_padding(PaddingConfig2d::Same)
            .init(device),
            batch_norm: BatchNormConfig::new(self.out_channels).init(device),
            activation: self.activated.then(Relu::new),
        }
    }
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    stage_1: ConvStage<B>,
    stage_2: ConvStage<B>,
    // Not activated, the activation is applied after the shortcut is added.
    stage_3: ConvStage<B>,
    shortcut: ConvStage<B>,
    activation: Relu,
    in_channels: usize,
    out_channels: usize,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn main_path(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stage_1.forward(input);
        let x = self.stage_2.forward(x);

        self.stage_3.forward(x)
    }

    pub fn shortcut_path(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.shortcut.forward(input)
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = self.shortcut_path(input.clone());
        let residual = self.main_path(input);

        self.activation.forward(residual + shortcut)
    }
}

#[derive(Config, Debug)]
struct ResidualBlockConfig {
    in_channels: usize,
    out_channels: usize,
    kernel_lengths: [usize; 3],
}

impl ResidualBlockConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> ResidualBlock<B> {
        let [kernel_1, kernel_2, kernel_3] = self.kernel_lengths;

        ResidualBlock {
            stage_1: ConvStageConfig::new(self.in_channels, self.out_channels, kernel_1, true)
                .init(device),
            stage_2: ConvStageConfig::new(self.out_channels, self.out_channels, kernel_2, true)
                .init(device),
            stage_3: ConvStageConfig::new(self.out_channels, self.out_channels, kernel_3, false)
                .init(device),
            shortcut: ConvStageConfig::new(self.in_channels, self.out_channels, 1, false)
                .init(device),
            activation: Relu::new(),
            in_channels: self.in_channels,
            out_channels: self.out_channels,
        }
    }
}

pub struct ModelOutput<B: Backend> {
    /// Unnormalized class scores, `[batch, classes]`.
    pub logits: Tensor<B, 2>,
    /// Globally pooled features fed to the head, `[batch, channels]`.
    pub features: Tensor<B, 2>,
}

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
    pool: AdaptiveAvgPool2d,
    head: Linear<B>,
}

impl<B: Backend> Model<B> {
    pub fn blocks(&self) -> &[ResidualBlock<B>] {
        &self.blocks
    }

    /// Runs a `[batch, 1, height, width]` input through every block, pools and classifies it.
    pub fn forward(&self, input: Tensor<B, 4>) -> ModelOutput<B> {
        let x = self.blocks.iter().fold(input, |x, block| block.forward(x));
        let features = self.pool.forward(x).flatten::<2>(1, 3);
        let logits = self.head.forward(features.clone());

        ModelOutput { logits, features }
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub num_classes: usize,
    #[config(default = 9)]
    pub net_layers: usize,
    #[config(default = 3)]
    pub cross_layer: usize,
    #[config(default = 7)]
    pub kernel_length_1: usize,
    #[config(default = 5)]
    pub kernel_length_2: usize,
    #[config(default = 3)]
    pub kernel_length_3: usize,
    #[config(default = 64)]
    pub feature_channels: usize,
}

impl ModelConfig {
    pub fn block_count(&self) -> usize {
        self.net_layers.checked_div(self.cross_layer).unwrap_or(0)
    }

    fn kernel_lengths(&self) -> [usize; 3] {
        [
            self.kernel_length_1,
            self.kernel_length_2,
            self.kernel_length_3,
        ]
    }

    /// Checks the configuration and returns the number of residual blocks it describes.
    pub fn validate(&self) -> Result<usize, ModelConfigError> {
        if self.cross_layer == 0 {
            return Err(ModelConfigError::ZeroCrossLayer);
        }

        if self.feature_channels == 0 {
            return Err(ModelConfigError::ZeroFeatureChannels);
        }

        if self.num_classes == 0 {
            return Err(ModelConfigError::ZeroClasses);
        }

        if let Some(kernel_length) = self
            .kernel_lengths()
            .into_iter()
            .find(|kernel_length| kernel_length % 2 == 0)
        {
            return Err(ModelConfigError::EvenKernel(kernel_length));
        }

        match self.block_count() {
            0 => Err(ModelConfigError::NoBlocks {
                net_layers: self.net_layers,
                cross_layer: self.cross_layer,
            }),
            block_count => Ok(block_count),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Model<B>, ModelConfigError> {
        let block_count = self.validate()?;
        let (_, head_input_size) = block_channels(block_count - 1, self.feature_channels);

        Ok(Model {
            blocks: (0..block_count)
                .map(|index| {
                    let (in_channels, out_channels) =
                        block_channels(index, self.feature_channels);

                    ResidualBlockConfig::new(in_channels, out_channels, self.kernel_lengths())
                        .init(device)
                })
                .collect(),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            head: LinearConfig::new(head_input_size, self.num_classes).init(device),
        })
    }
}
