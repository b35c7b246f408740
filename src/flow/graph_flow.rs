//! The graph normalizing flow.
//!
//! Node embeddings pass through a first stack of coupling layers (`flows_l`),
//! where the edge predictor is trained on the partially flowed embeddings,
//! then through a second stack (`flows_z`) and a trailing ActNorm into a
//! standard normal latent space.

use std::f32::consts::PI;

use burn::{
    module::Module,
    tensor::{Distribution, Tensor, backend::Backend},
};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;
use crate::flow::coupling::{CouplingConfig, CouplingLayer};
use crate::flow::edge_predictor::{EdgePredictor, EdgePredictorConfig, sample_adjacency};
use crate::layers::{
    ActNorm, ActNormConfig, AttentionConfig, SplineConfig, check_batch_size, masked_sum,
    node_mask, validate_node_counts,
};

/// Configuration for a [`GraphFlow`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GraphFlowConfig {
    /// Node embedding width, must be even.
    pub embedding_dim: usize,
    /// Coupling layers in each of the two stacks.
    pub num_flows: usize,
    /// Hidden width of the coupling set encoders and base networks.
    pub hidden_dim: usize,
    pub spline: SplineConfig,
    pub attention: AttentionConfig,
    pub edge_predictor: EdgePredictorConfig,
    /// Node count of every graph drawn by [`GraphFlow::sample_prior`].
    pub prior_nodes: usize,
}

impl GraphFlowConfig {
    /// Creates a config with four coupling layers per stack.
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            num_flows: 4,
            hidden_dim: 64,
            spline: SplineConfig::default(),
            attention: AttentionConfig::default(),
            edge_predictor: EdgePredictorConfig::new(embedding_dim),
            prior_nodes: 15,
        }
    }

    pub fn with_num_flows(mut self, num_flows: usize) -> Self {
        self.num_flows = num_flows;
        self
    }

    pub fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self
    }

    pub fn with_spline(mut self, spline: SplineConfig) -> Self {
        self.spline = spline;
        self
    }

    pub fn with_attention(mut self, attention: AttentionConfig) -> Self {
        self.attention = attention;
        self
    }

    pub fn with_edge_predictor(mut self, edge_predictor: EdgePredictorConfig) -> Self {
        self.edge_predictor = edge_predictor;
        self
    }

    pub fn with_prior_nodes(mut self, prior_nodes: usize) -> Self {
        self.prior_nodes = prior_nodes;
        self
    }

    fn coupling(&self) -> CouplingConfig {
        CouplingConfig::new(self.embedding_dim)
            .with_hidden_dim(self.hidden_dim)
            .with_spline(self.spline)
            .with_attention(self.attention)
    }

    /// Checks every hyperparameter, including the nested layer configs.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.num_flows == 0 {
            return Err(FlowError::invalid_config("num_flows must be at least 1"));
        }
        if self.prior_nodes == 0 {
            return Err(FlowError::invalid_config("prior_nodes must be at least 1"));
        }
        if self.edge_predictor.embedding_dim != self.embedding_dim {
            return Err(FlowError::ShapeMismatch {
                context: "edge predictor embedding",
                expected: self.embedding_dim,
                actual: self.edge_predictor.embedding_dim,
            });
        }
        self.coupling().validate()
    }

    /// Serializes the config to pretty JSON.
    pub fn to_json(&self) -> Result<String, FlowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses and validates a config from JSON.
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Initializes the flow.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<GraphFlow<B>, FlowError> {
        self.validate()?;
        log::info!(
            "graph flow: dim={}, flows={}x2, hidden={}, prior_nodes={}",
            self.embedding_dim,
            self.num_flows,
            self.hidden_dim,
            self.prior_nodes
        );

        let coupling = self.coupling();
        let flows_l = (0..self.num_flows)
            .map(|_| coupling.init(device))
            .collect::<Result<Vec<_>, _>>()?;
        let flows_z = (0..self.num_flows)
            .map(|_| coupling.init(device))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GraphFlow {
            flows_l,
            flows_z,
            edge_predictor: self.edge_predictor.init(device)?,
            final_actnorm: ActNormConfig::new(self.embedding_dim).init(device),
            embedding_dim: self.embedding_dim,
            prior_nodes: self.prior_nodes,
        })
    }
}

/// Everything computed by one forward pass, per graph.
#[derive(Debug, Clone)]
pub struct FlowOutput<B: Backend> {
    /// Latent `Z`, same shape as the input embeddings.
    pub latent: Tensor<B, 3>,
    /// `(prior_log_prob + log_det) / V - edge_loss`, `[batch]`.
    pub objective: Tensor<B, 1>,
    pub prior_log_prob: Tensor<B, 1>,
    pub log_det: Tensor<B, 1>,
    pub edge_loss: Tensor<B, 1>,
}

/// Graphs drawn by [`GraphFlow::generate`].
#[derive(Debug, Clone)]
pub struct GeneratedGraphs<B: Backend> {
    /// Node embeddings in the edge predictor's space, `[batch, nodes, dim]`.
    pub embeddings: Tensor<B, 3>,
    pub edge_probabilities: Tensor<B, 3>,
    /// Symmetric 0/1 adjacency with an empty diagonal.
    pub adjacency: Tensor<B, 3>,
    pub node_counts: Tensor<B, 1>,
}

/// Per-graph log-density of `z` under a standard normal, summed over valid
/// nodes and every feature.
pub fn standard_normal_log_prob<B: Backend>(
    z: Tensor<B, 3>,
    v: &Tensor<B, 1>,
) -> Result<Tensor<B, 1>, FlowError> {
    let [_, max_nodes, _] = z.dims();
    let mask = node_mask(v, max_nodes)?;
    let log_prob = z
        .powf_scalar(2.0)
        .mul_scalar(-0.5)
        .sub_scalar(0.5 * (2.0 * PI).ln());
    Ok(masked_sum(log_prob, mask))
}

/// Normalizing flow over variable-size node sets with an edge predictor.
#[derive(Module, Debug)]
pub struct GraphFlow<B: Backend> {
    flows_l: Vec<CouplingLayer<B>>,
    flows_z: Vec<CouplingLayer<B>>,
    edge_predictor: EdgePredictor<B>,
    final_actnorm: ActNorm<B>,
    embedding_dim: usize,
    prior_nodes: usize,
}

impl<B: Backend> GraphFlow<B> {
    fn check_embeddings(&self, x: &Tensor<B, 3>, v: &Tensor<B, 1>) -> Result<(), FlowError> {
        let [batch_size, _, dim] = x.dims();
        if dim != self.embedding_dim {
            return Err(FlowError::ShapeMismatch {
                context: "embedding dimension",
                expected: self.embedding_dim,
                actual: dim,
            });
        }
        check_batch_size(v, batch_size)
    }

    fn flow_l(
        &self,
        x: Tensor<B, 3>,
        v: &Tensor<B, 1>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 1>), FlowError> {
        let [batch_size, _, _] = x.dims();
        let mut log_det = Tensor::<B, 1>::zeros([batch_size], &x.device());
        let mut h = x;
        for layer in &self.flows_l {
            let (next, ld) = layer.forward(h, v.clone())?;
            h = next;
            log_det = log_det + ld;
        }
        Ok((h, log_det))
    }

    /// Maps a batch `(X, A, V)` to the latent space.
    ///
    /// Returns `Z` shaped like `X` and the per-graph objective to maximise.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        a: Tensor<B, 3>,
        v: Tensor<B, 1>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 1>), FlowError> {
        let output = self.forward_detailed(x, a, v)?;
        Ok((output.latent, output.objective))
    }

    /// Same as [`GraphFlow::forward`], also returning each objective term.
    pub fn forward_detailed(
        &self,
        x: Tensor<B, 3>,
        a: Tensor<B, 3>,
        v: Tensor<B, 1>,
    ) -> Result<FlowOutput<B>, FlowError> {
        self.check_embeddings(&x, &v)?;
        let [_, max_nodes, _] = x.dims();
        let counts = validate_node_counts(&v, max_nodes)?;
        if let Some(graph) = counts.iter().position(|&count| count == 0) {
            return Err(FlowError::EmptyGraph { graph });
        }

        let (h, mut log_det) = self.flow_l(x, &v)?;
        let edge_loss = self.edge_predictor.loss(h.clone(), a, v.clone())?;

        let mut z = h;
        for layer in &self.flows_z {
            let (next, ld) = layer.forward(z, v.clone())?;
            z = next;
            log_det = log_det + ld;
        }
        let (z, ld) = self.final_actnorm.forward(z, v.clone());
        log_det = log_det + ld;

        let prior_log_prob = standard_normal_log_prob(z.clone(), &v)?;
        let objective =
            (prior_log_prob.clone() + log_det.clone()) / v - edge_loss.clone();

        Ok(FlowOutput {
            latent: z,
            objective,
            prior_log_prob,
            log_det,
            edge_loss,
        })
    }

    /// Inverts the trailing ActNorm and `flows_z`, returning embeddings in the
    /// edge predictor's space. `flows_l` is not inverted.
    pub fn backward(&self, z: Tensor<B, 3>, v: Tensor<B, 1>) -> Result<Tensor<B, 3>, FlowError> {
        self.check_embeddings(&z, &v)?;
        let (mut h, _) = self.final_actnorm.backward(z, v.clone());
        for layer in self.flows_z.iter().rev() {
            let (next, _) = layer.backward(h, v.clone())?;
            h = next;
        }
        Ok(h)
    }

    /// Edge probabilities for observed embeddings: `flows_l`, then the predictor.
    #[doc(alias = "predict_A_from_E")]
    pub fn predict_adjacency(
        &self,
        x: Tensor<B, 3>,
        v: Tensor<B, 1>,
    ) -> Result<Tensor<B, 3>, FlowError> {
        self.check_embeddings(&x, &v)?;
        let (h, _) = self.flow_l(x, &v)?;
        self.edge_probabilities(h, v)
    }

    /// Edge probabilities for embeddings already in the predictor's space.
    pub fn edge_probabilities(
        &self,
        h: Tensor<B, 3>,
        v: Tensor<B, 1>,
    ) -> Result<Tensor<B, 3>, FlowError> {
        self.edge_predictor.predict(h, v)
    }

    /// Draws `num_graphs` standard normal latents, each with the configured
    /// fixed node count.
    pub fn sample_prior(
        &self,
        num_graphs: usize,
        device: &B::Device,
    ) -> (Tensor<B, 3>, Tensor<B, 1>) {
        let z = Tensor::random(
            [num_graphs, self.prior_nodes, self.embedding_dim],
            Distribution::Normal(0.0, 1.0),
            device,
        );
        let v = Tensor::full([num_graphs], self.prior_nodes as f32, device);
        (z, v)
    }

    /// Samples new graphs: prior, inverse `flows_z`, edge probabilities and a
    /// Bernoulli adjacency draw.
    pub fn generate(
        &self,
        num_graphs: usize,
        device: &B::Device,
    ) -> Result<GeneratedGraphs<B>, FlowError> {
        let (z, v) = self.sample_prior(num_graphs, device);
        let embeddings = self.backward(z, v.clone())?;
        let edge_probabilities = self.edge_probabilities(embeddings.clone(), v.clone())?;
        let adjacency = sample_adjacency(edge_probabilities.clone(), v.clone())?;
        log::debug!("generated {num_graphs} graphs with {} nodes", self.prior_nodes);

        Ok(GeneratedGraphs {
            embeddings,
            edge_probabilities,
            adjacency,
            node_counts: v,
        })
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn num_flows(&self) -> usize {
        self.flows_l.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::to_host;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn small_config(dim: usize) -> GraphFlowConfig {
        GraphFlowConfig::new(dim)
            .with_num_flows(2)
            .with_hidden_dim(16)
            .with_attention(AttentionConfig::new().with_num_inducing(4))
            .with_edge_predictor(EdgePredictorConfig::new(dim).with_hidden_dim(16))
            .with_prior_nodes(6)
    }

    fn random_adjacency(
        batch: usize,
        nodes: usize,
        device: &<TestBackend as Backend>::Device,
    ) -> Tensor<TestBackend, 3> {
        let upper = Tensor::<TestBackend, 3>::random(
            [batch, nodes, nodes],
            Distribution::Bernoulli(0.3),
            device,
        )
        .triu(1);
        upper.clone() + upper.swap_dims(1, 2)
    }

    #[test]
    fn test_objective_is_finite_for_equal_counts() {
        let device = <TestBackend as Backend>::Device::default();
        let model = small_config(8).init::<TestBackend>(&device).unwrap();
        let x =
            Tensor::<TestBackend, 3>::random([4, 5, 8], Distribution::Normal(0.0, 1.0), &device);
        let a = random_adjacency(4, 5, &device);
        let v = Tensor::<TestBackend, 1>::from_floats([5.0, 5.0, 5.0, 5.0], &device);

        let (z, objective) = model.forward(x, a, v).unwrap();

        assert_eq!(z.dims(), [4, 5, 8]);
        assert_eq!(objective.dims(), [4]);
        let values = to_host(objective).unwrap();
        assert!(values.iter().all(|o| o.is_finite()), "objective {values:?}");
        let latent = to_host(z).unwrap();
        assert!(latent.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_prior_at_zero_latent() {
        let device = <TestBackend as Backend>::Device::default();
        let z = Tensor::<TestBackend, 3>::zeros([2, 4, 3], &device);
        let v = Tensor::<TestBackend, 1>::from_floats([4.0, 2.0], &device);

        let log_prob = to_host(standard_normal_log_prob(z, &v).unwrap()).unwrap();

        let per_element = -0.5 * (2.0 * PI).ln();
        assert!((log_prob[0] - per_element * 4.0 * 3.0).abs() < 1e-4);
        assert!((log_prob[1] - per_element * 2.0 * 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_objective_decomposes() {
        let device = <TestBackend as Backend>::Device::default();
        let model = small_config(4).init::<TestBackend>(&device).unwrap();
        let x =
            Tensor::<TestBackend, 3>::random([2, 5, 4], Distribution::Normal(0.0, 1.0), &device);
        let a = random_adjacency(2, 5, &device);
        let v = Tensor::<TestBackend, 1>::from_floats([5.0, 3.0], &device);

        let output = model.forward_detailed(x, a, v.clone()).unwrap();
        let expected = (output.prior_log_prob + output.log_det) / v - output.edge_loss;

        let diff: f32 = (expected - output.objective).abs().max().into_scalar();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_backward_inverts_latent_stack() {
        let device = <TestBackend as Backend>::Device::default();
        let model = small_config(4).init::<TestBackend>(&device).unwrap();
        let x =
            Tensor::<TestBackend, 3>::random([2, 5, 4], Distribution::Normal(0.0, 1.0), &device);
        let a = random_adjacency(2, 5, &device);
        let v = Tensor::<TestBackend, 1>::from_floats([5.0, 4.0], &device);

        let (h, _) = model.flow_l(x.clone(), &v).unwrap();
        let (z, _) = model.forward(x, a, v.clone()).unwrap();
        let h_back = model.backward(z, v).unwrap();

        // Only valid rows are compared; padding is free to drift.
        let diff: f32 = (h_back.slice([0..2, 0..4, 0..4]) - h.slice([0..2, 0..4, 0..4]))
            .abs()
            .max()
            .into_scalar();
        assert!(diff < 1e-2, "inverse error {diff}");
    }

    #[test]
    fn test_predict_adjacency_is_a_probability() {
        let device = <TestBackend as Backend>::Device::default();
        let model = small_config(4).init::<TestBackend>(&device).unwrap();
        let x =
            Tensor::<TestBackend, 3>::random([3, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let v = Tensor::<TestBackend, 1>::from_floats([4.0, 2.0, 3.0], &device);

        let probs = model.predict_adjacency(x, v).unwrap();
        assert_eq!(probs.dims(), [3, 4, 4]);
        let values = to_host(probs).unwrap();
        assert!(values.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_sample_prior_uses_fixed_node_count() {
        let device = <TestBackend as Backend>::Device::default();
        let model = small_config(4).init::<TestBackend>(&device).unwrap();

        let (z, v) = model.sample_prior(3, &device);
        assert_eq!(z.dims(), [3, 6, 4]);
        assert_eq!(to_host(v).unwrap(), vec![6.0, 6.0, 6.0]);
    }

    #[test]
    fn test_generate_produces_symmetric_graphs() {
        let device = <TestBackend as Backend>::Device::default();
        let model = small_config(4).init::<TestBackend>(&device).unwrap();

        let graphs = model.generate(2, &device).unwrap();
        assert_eq!(graphs.embeddings.dims(), [2, 6, 4]);
        let adjacency = graphs.adjacency;
        let asymmetry: f32 = (adjacency.clone() - adjacency.clone().swap_dims(1, 2))
            .abs()
            .max()
            .into_scalar();
        assert_eq!(asymmetry, 0.0);
        let values = to_host(adjacency).unwrap();
        assert!(values.iter().all(|&e| e == 0.0 || e == 1.0));
        for graph in 0..2 {
            for node in 0..6 {
                assert_eq!(values[graph * 36 + node * 6 + node], 0.0);
            }
        }
    }

    #[test]
    fn test_rejects_batch_mismatch_and_empty_graphs() {
        let device = <TestBackend as Backend>::Device::default();
        let model = small_config(4).init::<TestBackend>(&device).unwrap();
        let x = Tensor::<TestBackend, 3>::zeros([2, 3, 4], &device);
        let a = Tensor::<TestBackend, 3>::zeros([2, 3, 3], &device);

        let v = Tensor::<TestBackend, 1>::from_floats([3.0], &device);
        assert!(matches!(
            model.forward(x.clone(), a.clone(), v),
            Err(FlowError::ShapeMismatch { context: "node count batch", .. })
        ));

        let v = Tensor::<TestBackend, 1>::from_floats([3.0, 0.0], &device);
        assert!(matches!(
            model.forward(x, a, v),
            Err(FlowError::EmptyGraph { graph: 1 })
        ));
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = small_config(6);
        let json = config.to_json().unwrap();
        let parsed = GraphFlowConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);

        let odd = GraphFlowConfig::new(5);
        assert!(matches!(
            GraphFlowConfig::from_json(&odd.to_json().unwrap()),
            Err(FlowError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_reloaded_model_reproduces_outputs() {
        let device = <TestBackend as Backend>::Device::default();
        let saved = small_config(4).init::<TestBackend>(&device).unwrap();
        let reloaded = small_config(4)
            .init::<TestBackend>(&device)
            .unwrap()
            .load_record(saved.clone().into_record());

        let x =
            Tensor::<TestBackend, 3>::random([2, 5, 4], Distribution::Normal(0.0, 1.0), &device);
        let a = random_adjacency(2, 5, &device);
        let v = Tensor::<TestBackend, 1>::from_floats([5.0, 3.0], &device);

        let (z, objective) = saved.forward(x.clone(), a.clone(), v.clone()).unwrap();
        let (z_reloaded, objective_reloaded) = reloaded.forward(x, a, v).unwrap();

        let latent_diff: f32 = (z - z_reloaded).abs().max().into_scalar();
        let objective_diff: f32 = (objective - objective_reloaded).abs().max().into_scalar();
        assert!(latent_diff < 1e-5, "latent differs by {latent_diff}");
        assert!(objective_diff < 1e-4, "objective differs by {objective_diff}");
    }
}
