//! Training loop implementation.

use super::{TrainingConfig, negative_mean_objective};
use crate::data::BatchSource;
use crate::errors::FlowError;
use crate::flow::GraphFlow;
use burn::{
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{ElementConversion, Tensor, backend::AutodiffBackend},
};

/// Training result containing the trained model and metrics.
#[derive(Debug)]
pub struct TrainingResult<B: AutodiffBackend> {
    /// The trained model.
    pub model: GraphFlow<B>,
    /// Loss values per iteration.
    pub loss_history: Vec<f32>,
}

fn mean_value<B: AutodiffBackend>(values: Tensor<B, 1>) -> f32 {
    values.mean().into_scalar().elem()
}

/// Trains a flow by maximising its objective with Adam.
///
/// Each iteration draws one batch from `source`. Stops with
/// [`FlowError::TrainingError`] as soon as the loss stops being finite.
pub fn train<B: AutodiffBackend, S: BatchSource<B>>(
    model: GraphFlow<B>,
    source: &mut S,
    config: &TrainingConfig,
) -> Result<TrainingResult<B>, FlowError> {
    let optimizer_config = AdamConfig::new();
    let mut optimizer = optimizer_config.init();

    let mut current_model = model;
    let mut loss_history = Vec::with_capacity(config.iterations);

    for iteration in 0..config.iterations {
        let batch = source.next_batch()?;
        let output =
            current_model.forward_detailed(batch.embeddings, batch.adjacency, batch.node_counts)?;

        let loss = negative_mean_objective(output.objective.clone());
        let loss_value: f32 = loss.clone().into_scalar().elem();
        if !loss_value.is_finite() {
            log::warn!("Iteration {}: non-finite loss {}", iteration + 1, loss_value);
            return Err(FlowError::TrainingError {
                message: format!("loss became {loss_value} at iteration {}", iteration + 1),
            });
        }
        loss_history.push(loss_value);

        if config.should_log(iteration) {
            log::info!(
                "Iteration {}/{}: objective = {:.4}, prior = {:.4}, log_det = {:.4}, edge = {:.4}",
                iteration + 1,
                config.iterations,
                -loss_value,
                mean_value(output.prior_log_prob),
                mean_value(output.log_det),
                mean_value(output.edge_loss)
            );
        }

        let grads = loss.backward();
        let grads_params = GradientsParams::from_grads(grads, &current_model);

        current_model = optimizer.step(config.learning_rate, current_model, grads_params);
    }

    Ok(TrainingResult {
        model: current_model,
        loss_history,
    })
}
