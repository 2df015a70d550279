use crate::{common::*, utils::TensorExt as _};

#[derive(Debug)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    /// Compute cross entropy of logits against sparse class targets.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        // assume [num_samples, num_classes] input shape
        let (num_samples, num_classes) = input.size2().unwrap();

        debug_assert!(
            target.kind() == Kind::Int64 && target.size1().unwrap() == num_samples,
            "expect target a [{}] int64 tensor",
            num_samples
        );
        debug_assert!(
            input.is_empty()
                || (bool::from(target.ge(0).all()) && bool::from(target.lt(num_classes).all())),
            "target values must be in range of [0, {})",
            num_classes
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if input.is_empty() && self.reduction == Reduction::Mean {
            return Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false);
        }

        let loss = input.cross_entropy_for_logits(target);

        match self.reduction {
            Reduction::None => loss,
            Reduction::Sum => loss.sum(Kind::Float),
            Reduction::Mean => loss.mean(Kind::Float),
            Reduction::Other(_) => unimplemented!(),
        }
    }
}
