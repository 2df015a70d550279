//! Region proposal network.

mod anchor;
mod anchor_refine;
mod head;
mod proposal;
mod proposal_refine;
#[allow(clippy::module_inception)]
mod rpn;

pub use anchor::*;
pub use anchor_refine::*;
pub use head::*;
pub use proposal::*;
pub use proposal_refine::*;
pub use rpn::*;

use crate::common::*;

/// Score tensor column holding the foreground logit.
///
/// The predictor emits (foreground, background) columns while labels use the
/// opposite convention (1 = foreground, 0 = background). Every crossing
/// between the two goes through [`score_column_for_label`] or
/// [`score_column_targets`].
pub const SCORE_COLUMN_FOREGROUND: i64 = 0;

/// Score tensor column holding the background logit.
pub const SCORE_COLUMN_BACKGROUND: i64 = 1;

/// Map a {1 = foreground, 0 = background} label to its predictor column.
pub fn score_column_for_label(label: i64) -> i64 {
    match label {
        1 => SCORE_COLUMN_FOREGROUND,
        0 => SCORE_COLUMN_BACKGROUND,
        _ => panic!("label {} has no score column", label),
    }
}

/// Tensor form of [`score_column_for_label`].
pub fn score_column_targets(labels: &Tensor) -> Tensor {
    labels * (SCORE_COLUMN_FOREGROUND - SCORE_COLUMN_BACKGROUND) + SCORE_COLUMN_BACKGROUND
}

pub(crate) const IOU_EPSILON: f64 = 1e-8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_column_mapping() {
        assert_eq!(score_column_for_label(1), SCORE_COLUMN_FOREGROUND);
        assert_eq!(score_column_for_label(0), SCORE_COLUMN_BACKGROUND);

        let labels = Tensor::of_slice(&[1i64, 0, 1]);
        let columns = Vec::<i64>::from(&score_column_targets(&labels));
        assert_eq!(
            columns,
            vec![
                SCORE_COLUMN_FOREGROUND,
                SCORE_COLUMN_BACKGROUND,
                SCORE_COLUMN_FOREGROUND
            ]
        );
    }
}
