use std::collections::BTreeMap;

use crate::tensor::TensorValue;

/// Parameter tensors keyed by op name, in each op's slot order.
pub type Params = BTreeMap<String, Vec<TensorValue>>;
