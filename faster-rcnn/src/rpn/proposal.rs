use super::{AnchorSet, IOU_EPSILON, SCORE_COLUMN_BACKGROUND, SCORE_COLUMN_FOREGROUND};
use crate::common::*;
use bbox::{prelude::*, BoxDelta, TLBR};
use getset::Getters;

/// Proposal decoder options.
#[derive(Debug, Clone)]
pub struct ProposalLayerInit {
    /// Input image height and width in pixels.
    pub image_size: usize,
    /// Number of top-scoring candidates kept before NMS.
    pub pre_nms_top_n: usize,
    /// Maximum number of candidates kept by NMS.
    pub post_nms_top_n: usize,
    /// IoU at or above which NMS suppresses a candidate.
    pub nms_threshold: R64,
    /// Minimum candidate width and height in pixels.
    pub min_box_size: R64,
}

impl ProposalLayerInit {
    pub fn build(self) -> Result<ProposalLayer> {
        let Self {
            image_size,
            pre_nms_top_n,
            post_nms_top_n,
            nms_threshold,
            min_box_size,
        } = self;

        ensure!(image_size > 0, "image_size must be positive");
        ensure!(
            pre_nms_top_n > 0 && post_nms_top_n > 0,
            "pre_nms_top_n and post_nms_top_n must be positive"
        );
        ensure!(
            nms_threshold > 0.0 && nms_threshold <= 1.0,
            "nms_threshold must be in range (0, 1]"
        );
        ensure!(min_box_size >= 0.0, "min_box_size must be non-negative");

        Ok(ProposalLayer {
            image_size,
            pre_nms_top_n,
            post_nms_top_n,
            nms_threshold: nms_threshold.raw(),
            min_box_size: min_box_size.raw(),
        })
    }
}

/// Decodes per-anchor scores and coefficients into ranked RoI sets.
#[derive(Debug)]
pub struct ProposalLayer {
    image_size: usize,
    pre_nms_top_n: usize,
    post_nms_top_n: usize,
    nms_threshold: f64,
    min_box_size: f64,
}

impl ProposalLayer {
    /// Decode one batch of predictions into RoIs.
    ///
    /// `scores` is `[N, A, 2]` and `coeffs` is `[N, A, 4]`, both flattened in
    /// the anchor set's order.
    pub fn forward(
        &self,
        anchors: &AnchorSet,
        scores: &Tensor,
        coeffs: &Tensor,
    ) -> Result<ProposalOutput> {
        tch::no_grad(|| {
            let (batch_size, num_scores, score_columns) = scores
                .size3()
                .context("expect a [batch, anchors, 2] score tensor")?;
            let (coeff_batch_size, num_coeffs, coeff_columns) = coeffs
                .size3()
                .context("expect a [batch, anchors, 4] coefficient tensor")?;
            ensure!(
                batch_size == coeff_batch_size,
                "score batch size ({}) does not match coefficient batch size ({})",
                batch_size,
                coeff_batch_size
            );
            ensure!(
                num_scores == anchors.len() as i64 && num_coeffs == anchors.len() as i64,
                "expect {} per-anchor predictions, found {} scores and {} coefficients",
                anchors.len(),
                num_scores,
                num_coeffs
            );
            ensure!(
                score_columns == 2 && coeff_columns == 4,
                "expect 2 score and 4 coefficient columns, found {} and {}",
                score_columns,
                coeff_columns
            );

            let per_image: Vec<_> = (0..batch_size)
                .map(|index| {
                    let fg = Vec::<f32>::from(
                        &scores.i((index, .., SCORE_COLUMN_FOREGROUND)).contiguous(),
                    );
                    let bg = Vec::<f32>::from(
                        &scores.i((index, .., SCORE_COLUMN_BACKGROUND)).contiguous(),
                    );
                    let coeffs = Vec::<f32>::from(&coeffs.i((index, .., ..)).contiguous());
                    self.decode_image(anchors, &fg, &bg, &coeffs)
                })
                .collect();

            Ok(ProposalOutput::new(per_image, scores.device()))
        })
    }

    fn decode_image(
        &self,
        anchors: &AnchorSet,
        fg_logits: &[f32],
        bg_logits: &[f32],
        coeffs: &[f32],
    ) -> ImageProposals {
        let bound = self.image_size as f64;

        let mut candidates: Vec<_> = izip!(
            anchors.boxes(),
            fg_logits,
            bg_logits,
            coeffs.chunks_exact(4)
        )
        .filter_map(|(anchor, &fg, &bg, chunk)| {
            let delta = BoxDelta {
                dy: chunk[0] as f64,
                dx: chunk[1] as f64,
                dh: chunk[2] as f64,
                dw: chunk[3] as f64,
            };
            let bbox = delta.decode(anchor).clamp_to(bound, bound);
            if bbox.h() < self.min_box_size || bbox.w() < self.min_box_size {
                return None;
            }

            // 2-way softmax foreground probability
            let score = 1.0 / (1.0 + f64::from(bg - fg).exp());
            Some((bbox, score))
        })
        .collect();

        candidates.sort_by_cached_key(|&(_, score)| -r64(score));
        candidates.truncate(self.pre_nms_top_n);

        let keep = self.non_max_suppression(&candidates);
        let (boxes, scores) = keep
            .into_iter()
            .map(|index| candidates[index].clone())
            .unzip();

        ImageProposals { boxes, scores }
    }

    /// Greedy NMS over score-sorted candidates.
    fn non_max_suppression(&self, candidates: &[(TLBR<f64>, f64)]) -> Vec<usize> {
        let mut suppressed = vec![false; candidates.len()];
        let mut keep = vec![];

        for (lhs_index, (lhs_bbox, _)) in candidates.iter().enumerate() {
            if suppressed[lhs_index] {
                continue;
            }
            keep.push(lhs_index);
            if keep.len() >= self.post_nms_top_n {
                break;
            }

            for (rhs_index, (rhs_bbox, _)) in candidates.iter().enumerate().skip(lhs_index + 1) {
                if !suppressed[rhs_index]
                    && lhs_bbox.iou_with(rhs_bbox, IOU_EPSILON) >= self.nms_threshold
                {
                    suppressed[rhs_index] = true;
                }
            }
        }

        keep
    }
}

/// Decoded proposals of one image.
#[derive(Debug, Clone)]
pub struct ImageProposals {
    /// Kept boxes in descending score order.
    pub boxes: Vec<TLBR<f64>>,
    /// Foreground probability per kept box.
    pub scores: Vec<f64>,
}

/// Batched proposal output.
///
/// Per-image results are ragged; the tensor views pad every image to the
/// batch maximum with zero boxes and `-inf` scores so downstream stages can
/// stay rectangular.
#[derive(Debug, Getters)]
pub struct ProposalOutput {
    /// Ragged per-image proposals.
    #[get = "pub"]
    per_image: Vec<ImageProposals>,
    /// `[N, R, 4]` padded RoI boxes.
    #[get = "pub"]
    rois: Tensor,
    /// `[N, R]` padded RoI scores.
    #[get = "pub"]
    roi_scores: Tensor,
    /// Valid RoI count per image.
    #[get = "pub"]
    num_valid: Vec<i64>,
}

impl ProposalOutput {
    fn new(per_image: Vec<ImageProposals>, device: Device) -> Self {
        let batch_size = per_image.len();
        let max_len = per_image
            .iter()
            .map(|proposals| proposals.boxes.len())
            .max()
            .unwrap_or(0);

        let mut box_data = vec![0f32; batch_size * max_len * 4];
        let mut score_data = vec![f32::NEG_INFINITY; batch_size * max_len];
        let num_valid: Vec<_> = per_image
            .iter()
            .enumerate()
            .map(|(index, proposals)| {
                let box_base = index * max_len * 4;
                let score_base = index * max_len;
                for (slot, (bbox, &score)) in
                    izip!(&proposals.boxes, &proposals.scores).enumerate()
                {
                    let [t, l, b, r] = bbox.tlbr();
                    box_data[box_base + slot * 4..box_base + slot * 4 + 4]
                        .copy_from_slice(&[t as f32, l as f32, b as f32, r as f32]);
                    score_data[score_base + slot] = score as f32;
                }
                proposals.boxes.len() as i64
            })
            .collect();

        let rois = Tensor::of_slice(&box_data)
            .view([batch_size as i64, max_len as i64, 4])
            .to_device(device);
        let roi_scores = Tensor::of_slice(&score_data)
            .view([batch_size as i64, max_len as i64])
            .to_device(device);

        Self {
            per_image,
            rois,
            roi_scores,
            num_valid,
        }
    }
}
