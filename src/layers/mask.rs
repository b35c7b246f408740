//! Validity masks for padded, variable-size node sets.
//!
//! A batch of graphs is stored as dense tensors padded to the largest graph.
//! Row `j` of graph `i` is a real node iff `j < V[i]`; everything else is
//! padding and must never reach a loss or a log-determinant.

use burn::tensor::{Bool, Int, Tensor, backend::Backend};

use crate::errors::FlowError;

/// Copies a tensor to the host as `f32` values.
pub fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, FlowError> {
    Ok(tensor.into_data().convert::<f32>().to_vec::<f32>()?)
}

/// Checks that every node count is a non-negative integer no larger than
/// `max_nodes`, returning the counts as `usize`.
pub fn validate_node_counts<B: Backend>(
    node_counts: &Tensor<B, 1>,
    max_nodes: usize,
) -> Result<Vec<usize>, FlowError> {
    let counts = to_host(node_counts.clone())?;
    counts
        .iter()
        .enumerate()
        .map(|(graph, &count)| {
            if !count.is_finite() || count < 0.0 || count.fract() != 0.0 {
                return Err(FlowError::InvalidNodeCount { graph, count });
            }
            if count as usize > max_nodes {
                return Err(FlowError::NodeCountOutOfRange {
                    graph,
                    count,
                    max_nodes,
                });
            }
            Ok(count as usize)
        })
        .collect()
}

/// Checks that there is one node count per graph of a `batch_size` batch.
pub fn check_batch_size<B: Backend>(
    node_counts: &Tensor<B, 1>,
    batch_size: usize,
) -> Result<(), FlowError> {
    let [counts] = node_counts.dims();
    if counts != batch_size {
        return Err(FlowError::ShapeMismatch {
            context: "node count batch",
            expected: batch_size,
            actual: counts,
        });
    }
    Ok(())
}

/// Builds the `[batch, max_nodes]` validity mask, `true` for real nodes.
///
/// Fails fast when a count is fractional, negative or exceeds `max_nodes`.
pub fn node_mask<B: Backend>(
    node_counts: &Tensor<B, 1>,
    max_nodes: usize,
) -> Result<Tensor<B, 2, Bool>, FlowError> {
    validate_node_counts(node_counts, max_nodes)?;
    let [batch_size] = node_counts.dims();
    let device = node_counts.device();

    let positions = Tensor::<B, 1, Int>::arange(0..max_nodes as i64, &device)
        .float()
        .reshape([1, max_nodes])
        .expand([batch_size, max_nodes]);
    let counts = node_counts
        .clone()
        .reshape([batch_size, 1])
        .expand([batch_size, max_nodes]);

    Ok(positions.lower(counts))
}

/// Same as [`node_mask`] but as a `0.0 / 1.0` float tensor, ready to multiply.
pub fn node_mask_float<B: Backend>(
    node_counts: &Tensor<B, 1>,
    max_nodes: usize,
) -> Result<Tensor<B, 2>, FlowError> {
    Ok(node_mask(node_counts, max_nodes)?.float())
}

/// Mask over unordered node pairs `i < j < V`, shape `[batch, max_nodes, max_nodes]`.
pub fn pair_mask<B: Backend>(
    node_counts: &Tensor<B, 1>,
    max_nodes: usize,
) -> Result<Tensor<B, 3>, FlowError> {
    let nodes = node_mask_float(node_counts, max_nodes)?;
    let [batch_size, _] = nodes.dims();
    let device = nodes.device();

    let both_valid = nodes.clone().reshape([batch_size, max_nodes, 1])
        * nodes.reshape([batch_size, 1, max_nodes]);

    let rows = Tensor::<B, 1, Int>::arange(0..max_nodes as i64, &device)
        .float()
        .reshape([max_nodes, 1])
        .expand([max_nodes, max_nodes]);
    let cols = Tensor::<B, 1, Int>::arange(0..max_nodes as i64, &device)
        .float()
        .reshape([1, max_nodes])
        .expand([max_nodes, max_nodes]);
    let upper = rows.lower(cols).float().reshape([1, max_nodes, max_nodes]);

    Ok(both_valid * upper)
}

/// Sums a per-position quantity `[batch, nodes, features]` over valid nodes only.
///
/// Padded positions are overwritten with zero before summing, so even a
/// non-finite value there contributes nothing.
pub fn masked_sum<B: Backend>(values: Tensor<B, 3>, mask: Tensor<B, 2, Bool>) -> Tensor<B, 1> {
    let [batch_size, max_nodes, features] = values.dims();
    let padding = mask
        .bool_not()
        .reshape([batch_size, max_nodes, 1])
        .expand([batch_size, max_nodes, features]);
    values
        .mask_fill(padding, 0.0)
        .sum_dim(2)
        .sum_dim(1)
        .reshape([batch_size])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_mask_marks_leading_rows() {
        let device = <TestBackend as Backend>::Device::default();
        let counts = Tensor::<TestBackend, 1>::from_floats([2.0, 0.0, 3.0], &device);

        let mask = node_mask_float(&counts, 3).unwrap();
        let values: Vec<f32> = mask.to_data().to_vec().unwrap();

        assert_eq!(values, vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_count_above_padding_is_rejected() {
        let device = <TestBackend as Backend>::Device::default();
        let counts = Tensor::<TestBackend, 1>::from_floats([2.0, 5.0], &device);

        let err = node_mask(&counts, 4).unwrap_err();
        assert!(matches!(
            err,
            FlowError::NodeCountOutOfRange {
                graph: 1,
                max_nodes: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_batch_size_must_match_counts() {
        let device = <TestBackend as Backend>::Device::default();
        let counts = Tensor::<TestBackend, 1>::from_floats([2.0, 3.0], &device);

        assert!(check_batch_size(&counts, 2).is_ok());
        assert!(matches!(
            check_batch_size(&counts, 3),
            Err(FlowError::ShapeMismatch {
                context: "node count batch",
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_fractional_count_is_rejected() {
        let device = <TestBackend as Backend>::Device::default();
        let counts = Tensor::<TestBackend, 1>::from_floats([1.5], &device);

        assert!(matches!(
            validate_node_counts(&counts, 4),
            Err(FlowError::InvalidNodeCount { graph: 0, .. })
        ));
    }

    #[test]
    fn test_pair_mask_counts_unordered_pairs() {
        let device = <TestBackend as Backend>::Device::default();
        let counts = Tensor::<TestBackend, 1>::from_floats([3.0, 4.0], &device);

        let pairs = pair_mask(&counts, 4).unwrap();
        let per_graph: Vec<f32> = pairs
            .sum_dim(2)
            .sum_dim(1)
            .reshape([2])
            .to_data()
            .to_vec()
            .unwrap();

        // 3 choose 2 and 4 choose 2
        assert_eq!(per_graph, vec![3.0, 6.0]);
    }

    #[test]
    fn test_masked_sum_ignores_padding() {
        let device = <TestBackend as Backend>::Device::default();
        let values = Tensor::<TestBackend, 3>::ones([2, 3, 2], &device);
        let counts = Tensor::<TestBackend, 1>::from_floats([1.0, 3.0], &device);
        let values = values.slice_assign(
            [0..1, 2..3, 0..2],
            Tensor::<TestBackend, 3>::full([1, 1, 2], f32::NAN, &device),
        );
        let mask = node_mask(&counts, 3).unwrap();

        let sums: Vec<f32> = masked_sum(values, mask).to_data().to_vec().unwrap();
        assert_eq!(sums, vec![2.0, 6.0]);
    }
}
