use crate::{common::*, utils::TensorExt as _};

#[derive(Debug)]
pub struct SmoothL1Loss {
    reduction: Reduction,
    beta: f64,
}

impl SmoothL1Loss {
    pub fn new(reduction: Reduction, beta: f64) -> Self {
        Self { reduction, beta }
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        debug_assert_eq!(
            input.size(),
            target.size(),
            "input and target shape must be equal"
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if input.is_empty() && self.reduction == Reduction::Mean {
            return Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false);
        }

        input.smooth_l1_loss(target, self.reduction, self.beta)
    }
}
