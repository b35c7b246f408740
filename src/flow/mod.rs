pub mod coupling;
pub mod edge_predictor;
pub mod graph_flow;

pub use coupling::{CouplingConfig, CouplingLayer};
pub use edge_predictor::{EdgePredictor, EdgePredictorConfig, sample_adjacency};
pub use graph_flow::{
    FlowOutput, GeneratedGraphs, GraphFlow, GraphFlowConfig, standard_normal_log_prob,
};
