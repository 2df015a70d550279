use super::{ImageProposals, IOU_EPSILON};
use crate::{common::*, label::ImageGroundTruth};
use bbox::{prelude::*, BoxDelta};
use getset::Getters;

/// RoI assignment options.
#[derive(Debug, Clone)]
pub struct ProposalRefineInit {
    /// IoU at or above which a RoI is foreground.
    pub foreground_threshold: R64,
    /// IoU below which a RoI is background.
    pub background_threshold: R64,
    /// Foreground cap within the per-image RoI budget.
    pub max_foreground_rois: usize,
    /// Total RoIs selected per image.
    pub rois_per_image: usize,
    /// Number of foreground object classes.
    pub num_classes: usize,
}

impl ProposalRefineInit {
    pub fn build(self) -> Result<ProposalRefine> {
        let Self {
            foreground_threshold,
            background_threshold,
            max_foreground_rois,
            rois_per_image,
            num_classes,
        } = self;

        ensure!(
            background_threshold > 0.0 && foreground_threshold <= 1.0,
            "RoI IoU thresholds must be in range (0, 1]"
        );
        ensure!(
            background_threshold < foreground_threshold,
            "background_threshold ({}) must be below foreground_threshold ({})",
            background_threshold,
            foreground_threshold
        );
        ensure!(
            max_foreground_rois > 0 && rois_per_image > 0,
            "RoI budgets must be positive"
        );
        ensure!(
            max_foreground_rois <= rois_per_image,
            "max_foreground_rois ({}) must not exceed rois_per_image ({})",
            max_foreground_rois,
            rois_per_image
        );
        ensure!(num_classes > 0, "num_classes must be positive");

        Ok(ProposalRefine {
            foreground_threshold: foreground_threshold.raw(),
            background_threshold: background_threshold.raw(),
            max_foreground_rois,
            rois_per_image,
            num_classes,
        })
    }
}

/// Labels decoded RoIs against ground truth for the classifier loss.
#[derive(Debug)]
pub struct ProposalRefine {
    foreground_threshold: f64,
    background_threshold: f64,
    max_foreground_rois: usize,
    rois_per_image: usize,
    num_classes: usize,
}

/// Batched RoI selection, exactly `rois_per_image` rows per image.
#[derive(Debug, Getters)]
pub struct ProposalRefineOutput {
    /// `[N, R, 4]` selected RoI boxes.
    #[get = "pub"]
    rois: Tensor,
    /// `[N, R]` class labels, 0 for background.
    #[get = "pub"]
    labels: Tensor,
    /// `[N, R, (num_classes + 1) * 4]` regression targets; only the 4-wide
    /// slice of the assigned class is populated.
    #[get = "pub"]
    bbox_targets: Tensor,
}

impl ProposalRefine {
    pub fn forward<R>(
        &self,
        proposals: &[ImageProposals],
        ground_truth: &[ImageGroundTruth],
        device: Device,
        rng: &mut R,
    ) -> Result<ProposalRefineOutput>
    where
        R: Rng + ?Sized,
    {
        ensure!(
            proposals.len() == ground_truth.len(),
            "proposal batch size ({}) does not match ground truth batch size ({})",
            proposals.len(),
            ground_truth.len()
        );
        for gt in ground_truth {
            for &class in gt.classes() {
                ensure!(
                    class <= self.num_classes as i64,
                    "ground truth class {} exceeds num_classes {}",
                    class,
                    self.num_classes
                );
            }
        }

        let budget = self.rois_per_image as i64;
        let coeff_width = ((self.num_classes + 1) * 4) as i64;

        let mut roi_tensors = vec![];
        let mut label_tensors = vec![];
        let mut target_tensors = vec![];
        for (image_proposals, gt) in izip!(proposals, ground_truth) {
            let (boxes, labels, targets) = self.assign_image(image_proposals, gt, rng);
            roi_tensors.push(Tensor::of_slice(&boxes).view([budget, 4]));
            label_tensors.push(Tensor::of_slice(&labels));
            target_tensors.push(Tensor::of_slice(&targets).view([budget, coeff_width]));
        }

        Ok(ProposalRefineOutput {
            rois: Tensor::stack(&roi_tensors, 0).to_device(device),
            labels: Tensor::stack(&label_tensors, 0).to_device(device),
            bbox_targets: Tensor::stack(&target_tensors, 0).to_device(device),
        })
    }

    /// Select exactly `rois_per_image` RoIs of one image.
    fn assign_image<R>(
        &self,
        proposals: &ImageProposals,
        gt: &ImageGroundTruth,
        rng: &mut R,
    ) -> (Vec<f32>, Vec<i64>, Vec<f32>)
    where
        R: Rng + ?Sized,
    {
        let budget = self.rois_per_image;
        let coeff_width = (self.num_classes + 1) * 4;
        let rois = &proposals.boxes;
        let num_gt = gt.len();

        let mut out_boxes = vec![0f32; budget * 4];
        let mut out_labels = vec![0i64; budget];
        let mut out_targets = vec![0f32; budget * coeff_width];

        let mut roi_max = vec![0f64; rois.len()];
        let mut roi_argmax = vec![0usize; rois.len()];
        for (roi_index, roi) in rois.iter().enumerate() {
            for (gt_index, gt_box) in gt.boxes().iter().enumerate() {
                let value = roi.iou_with(gt_box, IOU_EPSILON);
                if value > roi_max[roi_index] {
                    roi_max[roi_index] = value;
                    roi_argmax[roi_index] = gt_index;
                }
            }
        }

        // with no ground truth every RoI maxes at zero and lands in the
        // background pool; RoIs in the dead zone between the thresholds
        // join neither pool
        let mut foreground_pool = vec![];
        let mut background_pool = vec![];
        for roi_index in 0..rois.len() {
            if num_gt > 0 && roi_max[roi_index] >= self.foreground_threshold {
                foreground_pool.push(roi_index);
            } else if roi_max[roi_index] < self.background_threshold {
                background_pool.push(roi_index);
            }
        }

        foreground_pool.shuffle(rng);
        foreground_pool.truncate(self.max_foreground_rois);
        background_pool.shuffle(rng);

        let mut selected = foreground_pool.clone();
        let background_take = background_pool.len().min(budget - selected.len());
        selected.extend(&background_pool[..background_take]);

        // starved pools: pad by sampling with replacement from whichever
        // pool is non-empty; an image with no eligible RoI at all keeps
        // zero boxes labeled background
        if selected.len() < budget {
            let pad_pool = if !background_pool.is_empty() {
                &background_pool
            } else {
                &foreground_pool
            };
            if !pad_pool.is_empty() {
                while selected.len() < budget {
                    selected.push(*pad_pool.choose(rng).unwrap());
                }
            }
        }

        for (slot, &roi_index) in selected.iter().enumerate() {
            let roi = &rois[roi_index];
            let [t, l, b, r] = roi.tlbr();
            out_boxes[slot * 4..slot * 4 + 4]
                .copy_from_slice(&[t as f32, l as f32, b as f32, r as f32]);

            let foreground = num_gt > 0 && roi_max[roi_index] >= self.foreground_threshold;
            if !foreground {
                continue;
            }

            let gt_index = roi_argmax[roi_index];
            let class = gt.classes()[gt_index];
            out_labels[slot] = class;

            let [dy, dx, dh, dw] = BoxDelta::encode(roi, &gt.boxes()[gt_index]).dydxdhdw();
            let base = slot * coeff_width + class as usize * 4;
            out_targets[base..base + 4]
                .copy_from_slice(&[dy as f32, dx as f32, dh as f32, dw as f32]);
        }

        (out_boxes, out_labels, out_targets)
    }
}
