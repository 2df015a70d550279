use super::{AnchorSet, IOU_EPSILON};
use crate::{common::*, label::ImageGroundTruth};
use bbox::{prelude::*, BoxDelta};
use getset::Getters;

/// Anchor assignment options.
#[derive(Debug, Clone)]
pub struct AnchorRefineInit {
    /// Input image height and width in pixels.
    pub image_size: usize,
    /// IoU at or above which an anchor is foreground.
    pub positive_threshold: R64,
    /// IoU below which an anchor is background.
    pub negative_threshold: R64,
    /// Foreground cap within the per-image anchor budget.
    pub max_foreground: usize,
    /// Total anchors sampled per image.
    pub anchors_per_image: usize,
}

impl AnchorRefineInit {
    pub fn build(self, anchors: Arc<AnchorSet>) -> Result<AnchorRefine> {
        let Self {
            image_size,
            positive_threshold,
            negative_threshold,
            max_foreground,
            anchors_per_image,
        } = self;

        ensure!(image_size > 0, "image_size must be positive");
        ensure!(
            negative_threshold > 0.0 && positive_threshold <= 1.0,
            "anchor IoU thresholds must be in range (0, 1]"
        );
        ensure!(
            negative_threshold < positive_threshold,
            "negative_threshold ({}) must be below positive_threshold ({})",
            negative_threshold,
            positive_threshold
        );
        ensure!(
            max_foreground > 0 && anchors_per_image > 0,
            "anchor budgets must be positive"
        );
        ensure!(
            max_foreground <= anchors_per_image,
            "max_foreground ({}) must not exceed anchors_per_image ({})",
            max_foreground,
            anchors_per_image
        );

        // anchors crossing the image boundary never contribute to the loss;
        // the image size is fixed, so drop them once here
        let bound = image_size as f64;
        let kept_indexes: Vec<_> = anchors
            .boxes()
            .iter()
            .enumerate()
            .filter(|(_, bbox)| bbox.is_inside(bound, bound))
            .map(|(index, _)| index as i64)
            .collect();

        Ok(AnchorRefine {
            anchors,
            kept_indexes,
            positive_threshold: positive_threshold.raw(),
            negative_threshold: negative_threshold.raw(),
            max_foreground,
            anchors_per_image,
        })
    }
}

/// Labels anchors against ground truth for the proposal loss.
#[derive(Debug)]
pub struct AnchorRefine {
    anchors: Arc<AnchorSet>,
    kept_indexes: Vec<i64>,
    positive_threshold: f64,
    negative_threshold: f64,
    max_foreground: usize,
    anchors_per_image: usize,
}

/// Batched anchor assignment over the kept anchors.
#[derive(Debug, Getters)]
pub struct AnchorRefineOutput {
    /// `[N, X]` labels: 1 foreground, 0 background, -1 ignore.
    #[get = "pub"]
    labels: Tensor,
    /// `[N, X, 4]` regression targets, zero rows for non-foreground anchors.
    #[get = "pub"]
    bbox_targets: Tensor,
}

impl AnchorRefine {
    /// Indices of in-image anchors, in anchor set order.
    pub fn kept_indexes(&self) -> &[i64] {
        &self.kept_indexes
    }

    /// The kept-index list as an index tensor for `index_select`.
    pub fn kept_index_tensor(&self, device: Device) -> Tensor {
        Tensor::of_slice(&self.kept_indexes).to_device(device)
    }

    pub fn forward<R>(
        &self,
        ground_truth: &[ImageGroundTruth],
        device: Device,
        rng: &mut R,
    ) -> AnchorRefineOutput
    where
        R: Rng + ?Sized,
    {
        let num_kept = self.kept_indexes.len() as i64;
        let (label_tensors, target_tensors): (Vec<_>, Vec<_>) = ground_truth
            .iter()
            .map(|gt| {
                let (labels, targets) = self.assign_image(gt, rng);
                (
                    Tensor::of_slice(&labels),
                    Tensor::of_slice(&targets).view([num_kept, 4]),
                )
            })
            .unzip();

        AnchorRefineOutput {
            labels: Tensor::stack(&label_tensors, 0).to_device(device),
            bbox_targets: Tensor::stack(&target_tensors, 0).to_device(device),
        }
    }

    /// Label and sample the kept anchors of one image.
    fn assign_image<R>(&self, gt: &ImageGroundTruth, rng: &mut R) -> (Vec<i64>, Vec<f32>)
    where
        R: Rng + ?Sized,
    {
        let num_kept = self.kept_indexes.len();
        let num_gt = gt.len();
        let mut labels = vec![-1i64; num_kept];
        let mut targets = vec![0f32; num_kept * 4];

        // dense IoU with per-anchor and per-ground-truth maxima; scans run
        // in index order so ties keep the lowest index
        let mut iou = vec![0f64; num_kept * num_gt];
        let mut anchor_max = vec![0f64; num_kept];
        let mut anchor_argmax = vec![0usize; num_kept];
        let mut gt_max = vec![0f64; num_gt];
        let mut gt_argmax = vec![0usize; num_gt];

        for (kept_index, &anchor_index) in self.kept_indexes.iter().enumerate() {
            let anchor = &self.anchors.boxes()[anchor_index as usize];
            for (gt_index, gt_box) in gt.boxes().iter().enumerate() {
                let value = anchor.iou_with(gt_box, IOU_EPSILON);
                iou[kept_index * num_gt + gt_index] = value;
                if value > anchor_max[kept_index] {
                    anchor_max[kept_index] = value;
                    anchor_argmax[kept_index] = gt_index;
                }
                if value > gt_max[gt_index] {
                    gt_max[gt_index] = value;
                    gt_argmax[gt_index] = kept_index;
                }
            }
        }

        for kept_index in 0..num_kept {
            if anchor_max[kept_index] >= self.positive_threshold {
                labels[kept_index] = 1;
            } else if anchor_max[kept_index] < self.negative_threshold {
                labels[kept_index] = 0;
            }
        }

        // every ground truth keeps its best-overlapping anchor even below
        // the positive threshold
        for gt_index in 0..num_gt {
            if gt_max[gt_index] > 0.0 {
                let kept_index = gt_argmax[gt_index];
                labels[kept_index] = 1;
                if iou[kept_index * num_gt + gt_index] == anchor_max[kept_index] {
                    anchor_argmax[kept_index] = gt_index;
                }
            }
        }

        // balanced sampling: cap foreground, fill the rest with background
        subsample(&mut labels, 1, self.max_foreground, rng);
        let num_foreground = labels.iter().filter(|&&label| label == 1).count();
        subsample(
            &mut labels,
            0,
            self.anchors_per_image.saturating_sub(num_foreground),
            rng,
        );

        for (kept_index, &anchor_index) in self.kept_indexes.iter().enumerate() {
            if labels[kept_index] != 1 {
                continue;
            }
            let anchor = &self.anchors.boxes()[anchor_index as usize];
            let gt_box = &gt.boxes()[anchor_argmax[kept_index]];
            let [dy, dx, dh, dw] = BoxDelta::encode(anchor, gt_box).dydxdhdw();
            targets[kept_index * 4..kept_index * 4 + 4]
                .copy_from_slice(&[dy as f32, dx as f32, dh as f32, dw as f32]);
        }

        (labels, targets)
    }
}

/// Relabel uniformly-chosen excess `value` entries to ignore.
fn subsample<R>(labels: &mut [i64], value: i64, cap: usize, rng: &mut R)
where
    R: Rng + ?Sized,
{
    let mut pool: Vec<_> = labels
        .iter()
        .enumerate()
        .filter(|(_, &label)| label == value)
        .map(|(index, _)| index)
        .collect();
    if pool.len() <= cap {
        return;
    }

    pool.shuffle(rng);
    for &index in &pool[cap..] {
        labels[index] = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpn::AnchorGeneratorInit;
    use approx::assert_abs_diff_eq;
    use bbox::{RectExt, TLBR};

    fn unit_anchors(image_size: usize) -> Arc<AnchorSet> {
        Arc::new(
            AnchorGeneratorInit {
                image_size,
                stride: 16,
                scales: vec![r64(1.0)],
                ratios: vec![r64(1.0)],
            }
            .build()
            .unwrap(),
        )
    }

    fn refine(
        anchors: Arc<AnchorSet>,
        image_size: usize,
        max_foreground: usize,
        anchors_per_image: usize,
    ) -> AnchorRefine {
        AnchorRefineInit {
            image_size,
            positive_threshold: r64(0.7),
            negative_threshold: r64(0.3),
            max_foreground,
            anchors_per_image,
        }
        .build(anchors)
        .unwrap()
    }

    #[test]
    fn boundary_anchors_are_dropped_at_build_time() {
        let image_size = 256;
        let anchors = Arc::new(
            AnchorGeneratorInit {
                image_size,
                stride: 16,
                scales: vec![r64(2.0)],
                ratios: vec![r64(1.0)],
            }
            .build()
            .unwrap(),
        );
        let refine = refine(anchors.clone(), image_size, 32, 64);

        // 32x32 anchors at stride 16: only interior cells survive
        assert_eq!(refine.kept_indexes().len(), 14 * 14);
        for &index in refine.kept_indexes() {
            assert!(anchors.boxes()[index as usize].is_inside(256.0, 256.0));
        }
    }

    #[test]
    fn matching_anchor_is_foreground_with_near_zero_target() {
        // 16x16 grid, stride 16, one anchor type: anchor #0 is [0, 0, 16, 16]
        let anchors = unit_anchors(256);
        let refine = refine(anchors, 256, 32, 64);
        let gt = ImageGroundTruth::new(
            vec![TLBR::from_tlbr([0.0, 0.0, 16.0, 16.0])],
            vec![1],
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let (labels, targets) = refine.assign_image(&gt, &mut rng);

        assert_eq!(labels[0], 1);
        for value in &targets[..4] {
            assert_abs_diff_eq!(*value, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn every_ground_truth_gets_a_foreground_anchor() {
        let anchors = unit_anchors(256);
        let refine = refine(anchors.clone(), 256, 32, 64);

        // neither box reaches the 0.7 positive threshold against the 16x16
        // anchor grid
        let gt = ImageGroundTruth::new(
            vec![
                TLBR::from_tlbr([3.0, 3.0, 25.0, 25.0]),
                TLBR::from_tlbr([100.0, 100.0, 140.0, 126.0]),
            ],
            vec![1, 2],
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let (labels, targets) = refine.assign_image(&gt, &mut rng);

        // some foreground anchor decodes to each ground truth box
        for gt_box in gt.boxes() {
            let found = izip!(refine.kept_indexes(), &labels).enumerate().any(
                |(kept_index, (&anchor_index, &label))| {
                    if label != 1 {
                        return false;
                    }
                    let delta = BoxDelta {
                        dy: targets[kept_index * 4] as f64,
                        dx: targets[kept_index * 4 + 1] as f64,
                        dh: targets[kept_index * 4 + 2] as f64,
                        dw: targets[kept_index * 4 + 3] as f64,
                    };
                    let anchor = &anchors.boxes()[anchor_index as usize];
                    let decoded = TLBR::from(delta.decode(anchor));
                    decoded.iou_with(gt_box, 0.0) > 0.99
                },
            );
            assert!(found, "no foreground anchor decodes to {:?}", gt_box);
        }
    }

    #[test]
    fn sampling_respects_budgets() {
        let anchors = unit_anchors(256);
        let refine = refine(anchors, 256, 4, 16);

        // eight boxes, each landing exactly on one anchor
        let (boxes, classes) = (0..8)
            .map(|index| {
                let t = 32.0 * (index / 4) as f64;
                let l = 32.0 * (index % 4) as f64;
                (TLBR::from_tlbr([t, l, t + 16.0, l + 16.0]), 1)
            })
            .unzip();
        let gt = ImageGroundTruth::new(boxes, classes).unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let (labels, _) = refine.assign_image(&gt, &mut rng);

        let num_foreground = labels.iter().filter(|&&label| label == 1).count();
        let num_background = labels.iter().filter(|&&label| label == 0).count();
        assert_eq!(num_foreground, 4);
        assert_eq!(num_foreground + num_background, 16);
    }

    #[test]
    fn zero_ground_truth_yields_background_only() {
        let anchors = unit_anchors(256);
        let refine = refine(anchors, 256, 32, 64);

        let mut rng = StdRng::seed_from_u64(0);
        let (labels, targets) = refine.assign_image(&ImageGroundTruth::empty(), &mut rng);

        assert!(labels.iter().all(|&label| label == 0 || label == -1));
        assert_eq!(labels.iter().filter(|&&label| label == 0).count(), 64);
        assert!(targets.iter().all(|&value| value == 0.0));
    }

    #[test]
    fn assignment_is_deterministic_under_a_fixed_seed() {
        let anchors = unit_anchors(256);
        let refine = refine(anchors, 256, 8, 32);
        let gt = ImageGroundTruth::new(
            vec![TLBR::from_tlbr([16.0, 16.0, 96.0, 96.0])],
            vec![1],
        )
        .unwrap();

        let run = || {
            let mut rng = StdRng::seed_from_u64(7);
            refine.assign_image(&gt, &mut rng)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn forward_stacks_per_image_results() {
        let anchors = unit_anchors(256);
        let refine = refine(anchors, 256, 8, 32);
        let batch = vec![
            ImageGroundTruth::new(vec![TLBR::from_tlbr([0.0, 0.0, 16.0, 16.0])], vec![1]).unwrap(),
            ImageGroundTruth::empty(),
        ];

        let mut rng = StdRng::seed_from_u64(0);
        let output = refine.forward(&batch, Device::Cpu, &mut rng);

        let num_kept = refine.kept_indexes().len() as i64;
        assert_eq!(output.labels().size(), &[2, num_kept]);
        assert_eq!(output.bbox_targets().size(), &[2, num_kept, 4]);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let anchors = unit_anchors(256);
        let build = |positive: f64, negative: f64, max_foreground: usize, total: usize| {
            AnchorRefineInit {
                image_size: 256,
                positive_threshold: r64(positive),
                negative_threshold: r64(negative),
                max_foreground,
                anchors_per_image: total,
            }
            .build(anchors.clone())
        };

        assert!(build(0.3, 0.7, 32, 64).is_err());
        assert!(build(0.7, 0.7, 32, 64).is_err());
        assert!(build(0.7, 0.3, 0, 64).is_err());
        assert!(build(0.7, 0.3, 128, 64).is_err());
        assert!(build(1.5, 0.3, 32, 64).is_err());
    }
}
