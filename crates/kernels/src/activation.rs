//! Pointwise activations.

use crate::utils::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    Relu,
    Relu6,
    Hswish,
}

impl ActivationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationKind::Relu => "relu",
            ActivationKind::Relu6 => "relu6",
            ActivationKind::Hswish => "hswish",
        }
    }

    pub fn apply(&self, x: f32) -> f32 {
        match self {
            ActivationKind::Relu => x.max(0.0),
            ActivationKind::Relu6 => relu6(x),
            ActivationKind::Hswish => x * hard_sigmoid(x),
        }
    }

    pub fn apply_inplace(&self, tensor: &mut Tensor) {
        let kind = *self;
        tensor.mapv_inplace(|x| kind.apply(x));
    }
}

pub fn relu6(x: f32) -> f32 {
    x.clamp(0.0, 6.0)
}

/// `relu6(x + 3) / 6`, the gate used by hard-swish and squeeze-excite.
pub fn hard_sigmoid(x: f32) -> f32 {
    relu6(x + 3.0) / 6.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, IxDyn};

    #[test]
    fn activations_match_closed_forms() {
        let mut tensor = arr1(&[-4.0f32, -1.0, 0.0, 2.0, 7.0]).into_dyn();
        ActivationKind::Relu6.apply_inplace(&mut tensor);
        assert_eq!(tensor.as_slice().unwrap(), &[0.0, 0.0, 0.0, 2.0, 6.0]);

        assert_eq!(ActivationKind::Relu.apply(-3.0), 0.0);
        assert_abs_diff_eq!(ActivationKind::Hswish.apply(-4.0), 0.0);
        assert_abs_diff_eq!(ActivationKind::Hswish.apply(1.0), 1.0 * 4.0 / 6.0);
        assert_abs_diff_eq!(ActivationKind::Hswish.apply(5.0), 5.0);
        assert_eq!(tensor.dim(), IxDyn(&[5]));
    }
}
