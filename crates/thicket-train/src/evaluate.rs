use burn::tensor::{activation, backend::Backend, ElementConversion, Int, Tensor};
use thicket_network::Model;

use crate::dataset::Dataset;

/// Cross-entropy of `logits` against the class indices in `targets`, summed over the batch.
pub fn summed_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [batch, _] = logits.dims();

    activation::log_softmax(logits, 1)
        .gather(1, targets.reshape([batch, 1]))
        .sum()
        .neg()
}

pub fn correct_predictions<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch, _] = logits.dims();

    let correct = logits
        .argmax(1)
        .reshape([batch])
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();

    correct as usize
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Mean cross-entropy per sample.
    pub loss: f64,
    pub accuracy: f64,
}

/// Evaluates `model` over `dataset` in `split_count` contiguous chunks, bounding the memory a
/// single forward pass needs. A split count of zero is treated as one.
pub fn loss_and_accuracy<B: Backend>(
    model: &Model<B>,
    dataset: &Dataset,
    split_count: usize,
    device: &B::Device,
) -> Evaluation {
    let len = dataset.len();
    let chunk_len = len.div_ceil(split_count.max(1)).max(1);

    let (loss, correct) =
        (0..len)
            .step_by(chunk_len)
            .fold((0.0, 0), |(loss, correct), start| {
                let indices = (start..(start + chunk_len).min(len)).collect::<Vec<_>>();
                let batch = dataset.batch::<B>(&indices, device);
                let logits = model.forward(batch.features).logits;

                let chunk_loss = summed_cross_entropy(logits.clone(), batch.targets.clone())
                    .into_scalar()
                    .elem::<f64>();

                (
                    loss + chunk_loss,
                    correct + correct_predictions(logits, batch.targets),
                )
            });

    Evaluation {
        loss: loss / len as f64,
        accuracy: correct as f64 / len as f64,
    }
}
