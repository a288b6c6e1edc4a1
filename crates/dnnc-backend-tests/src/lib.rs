pub mod conformance;
pub mod smoke;

use std::collections::HashMap;
use std::sync::Arc;

use dnnc::backend::{ExecutionBackend, ExecutionStrategy};
use dnnc::graph::Graph;
use dnnc::tensor::TensorValue;

/// Expands to a `#[cfg(test)]` module that runs the shared suite against one backend.
///
/// `$strategy` is the strategy the backend is attached under and `$backend_ctor` a closure
/// returning `Arc<dyn ExecutionBackend>`.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $strategy:expr, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::{conformance, smoke};

            macro_rules! backend_test {
                ($name:ident, $func:path) => {
                    #[test]
                    fn $name() {
                        let backend = ($backend_ctor)();
                        $func($strategy, &backend);
                    }
                };
            }

            backend_test!(smoke_sum_of_ones_is_two, smoke::sum_of_ones_is_two);
            backend_test!(smoke_integer_sum_is_exact, smoke::integer_sum_is_exact);
            backend_test!(smoke_affine_matches_expected, smoke::affine_matches_expected);
            backend_test!(smoke_conv_of_ones_counts_taps, smoke::conv_of_ones_counts_taps);
            backend_test!(smoke_strided_conv_shape, smoke::strided_conv_shape);
            backend_test!(smoke_pooling_matches_expected, smoke::pooling_matches_expected);
            backend_test!(smoke_softmax_rows_sum_to_one, smoke::softmax_rows_sum_to_one);
            backend_test!(smoke_lrn_matches_closed_form, smoke::lrn_matches_closed_form);
            backend_test!(smoke_normalization_chain, smoke::normalization_chain);
            backend_test!(smoke_concat_then_flatten, smoke::concat_then_flatten);
            backend_test!(smoke_run_is_idempotent, smoke::run_is_idempotent);
            backend_test!(smoke_params_update_after_build, smoke::params_update_after_build);
            backend_test!(smoke_multi_group_handoff, smoke::multi_group_handoff);
            backend_test!(smoke_gpu_target_is_unsupported, smoke::gpu_target_is_unsupported);
            backend_test!(conformance_float_network, conformance::float_network_matches_reference);
            backend_test!(conformance_double_network, conformance::double_network_matches_reference);
            backend_test!(conformance_integer_network, conformance::integer_network_matches_reference);
        }
    };
}

/// Graph whose `strategy` groups run on `backend`.
pub fn graph_with(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) -> Graph {
    Graph::new().with_backend(strategy, Arc::clone(backend))
}

pub fn inputs<const N: usize>(entries: [(&str, TensorValue); N]) -> HashMap<String, TensorValue> {
    entries
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Asserts equal extents and element-wise agreement within `rel` relative tolerance.
pub fn assert_close(actual: &TensorValue, expected: &TensorValue, rel: f64) {
    assert_eq!(actual.dtype(), expected.dtype(), "element types differ");
    assert_eq!(actual.dims(), expected.dims(), "extents differ");
    for (i, (a, e)) in actual
        .to_f64_vec()
        .into_iter()
        .zip(expected.to_f64_vec())
        .enumerate()
    {
        let tolerance = rel * e.abs().max(1.0);
        assert!(
            (a - e).abs() <= tolerance,
            "element {i}: got {a}, expected {e} (tolerance {tolerance})"
        );
    }
}
