//! Error types for the graphflow crate.

mod flow_error;

pub use flow_error::FlowError;
