use super::{
    score_column_targets, AnchorGeneratorInit, AnchorRefine, AnchorRefineInit, AnchorRefineOutput,
    AnchorSet, ProposalLayer, ProposalLayerInit, ProposalOutput, ProposalRefine,
    ProposalRefineInit, ProposalRefineOutput, RpnHead, RpnHeadInit, RpnHeadOutput,
};
use crate::{
    common::*,
    config::{
        AnchorSamplingConfig, Config, ModelConfig, ProposalConfig, RoiSamplingConfig, RpnConfig,
    },
    label::ImageGroundTruth,
    loss::{CrossEntropyLoss, SmoothL1Loss},
};

/// Region proposal network initializer.
#[derive(Debug, Clone)]
pub struct RpnInit {
    pub config: Config,
}

impl RpnInit {
    pub fn build<'p, P>(self, path: P) -> Result<Rpn>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let Config {
            model:
                ModelConfig {
                    image_size,
                    stride,
                    feature_channels,
                    mid_channels,
                    num_classes,
                },
            rpn:
                RpnConfig {
                    anchor_scales,
                    anchor_ratios,
                    proposal:
                        ProposalConfig {
                            pre_nms_top_n,
                            post_nms_top_n,
                            nms_threshold,
                            min_box_size,
                        },
                    anchor_sampling:
                        AnchorSamplingConfig {
                            positive_threshold,
                            negative_threshold,
                            max_foreground,
                            anchors_per_image,
                        },
                    roi_sampling:
                        RoiSamplingConfig {
                            foreground_threshold,
                            background_threshold,
                            max_foreground_rois,
                            rois_per_image,
                        },
                    seed,
                },
        } = self.config;

        let anchors = Arc::new(
            AnchorGeneratorInit {
                image_size,
                stride,
                scales: anchor_scales,
                ratios: anchor_ratios,
            }
            .build()?,
        );
        let head = RpnHeadInit {
            in_channels: feature_channels,
            mid_channels,
            num_anchor_types: anchors.num_anchor_types(),
        }
        .build(path)?;
        let proposal = ProposalLayerInit {
            image_size,
            pre_nms_top_n,
            post_nms_top_n,
            nms_threshold,
            min_box_size,
        }
        .build()?;
        let anchor_refine = AnchorRefineInit {
            image_size,
            positive_threshold,
            negative_threshold,
            max_foreground,
            anchors_per_image,
        }
        .build(anchors.clone())?;
        let proposal_refine = ProposalRefineInit {
            foreground_threshold,
            background_threshold,
            max_foreground_rois,
            rois_per_image,
            num_classes,
        }
        .build()?;

        Ok(Rpn {
            anchors,
            head,
            proposal,
            anchor_refine,
            proposal_refine,
            classification_loss: CrossEntropyLoss::new(Reduction::Mean),
            regression_loss: SmoothL1Loss::new(Reduction::Mean, 1.0),
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

/// The region proposal network.
///
/// Wires the anchor set, the conv head, proposal decoding and the two
/// assignment layers, and computes the proposal loss at training time.
#[derive(Debug)]
pub struct Rpn {
    anchors: Arc<AnchorSet>,
    head: RpnHead,
    proposal: ProposalLayer,
    anchor_refine: AnchorRefine,
    proposal_refine: ProposalRefine,
    classification_loss: CrossEntropyLoss,
    regression_loss: SmoothL1Loss,
    rng: StdRng,
}

/// The proposal loss terms, averaged over the batch.
#[derive(Debug, TensorLike)]
pub struct RpnLossOutput {
    pub total_loss: Tensor,
    pub classification_loss: Tensor,
    pub regression_loss: Tensor,
}

/// Training-only outputs.
#[derive(Debug)]
pub struct RpnTrainingOutput {
    /// Selected RoIs and targets for the downstream classifier. The
    /// selected RoIs replace the decoded ones while training.
    pub selection: ProposalRefineOutput,
    /// The proposal loss.
    pub loss: RpnLossOutput,
}

#[derive(Debug)]
pub struct RpnOutput {
    /// Decoded proposals.
    pub proposals: ProposalOutput,
    /// Present when ground truth was supplied.
    pub training: Option<RpnTrainingOutput>,
}

impl Rpn {
    pub fn anchors(&self) -> &Arc<AnchorSet> {
        &self.anchors
    }

    /// Run one forward pass.
    ///
    /// With `ground_truth` supplied, anchor and RoI assignment run and the
    /// proposal loss is returned; without it, every ground-truth-dependent
    /// step is skipped.
    pub fn forward(
        &mut self,
        feature_map: &Tensor,
        ground_truth: Option<&[ImageGroundTruth]>,
    ) -> Result<RpnOutput> {
        let RpnHeadOutput { scores, coeffs } = self.head.forward(feature_map)?;
        let (batch_size, _, _) = scores.size3().unwrap();
        ensure!(batch_size > 0, "batch must contain at least one image");
        if let Some(gt) = ground_truth {
            ensure!(
                gt.len() as i64 == batch_size,
                "ground truth batch size ({}) does not match feature batch size ({})",
                gt.len(),
                batch_size
            );
        }

        let proposals = self.proposal.forward(&self.anchors, &scores, &coeffs)?;

        let training = match ground_truth {
            None => None,
            Some(gt) => {
                let assignment = self.anchor_refine.forward(gt, scores.device(), &mut self.rng);
                let loss = self.proposal_loss(&scores, &coeffs, &assignment)?;
                let selection = self.proposal_refine.forward(
                    proposals.per_image(),
                    gt,
                    scores.device(),
                    &mut self.rng,
                )?;
                Some(RpnTrainingOutput { selection, loss })
            }
        };

        Ok(RpnOutput {
            proposals,
            training,
        })
    }

    /// Per-image classification and regression loss over sampled anchors.
    fn proposal_loss(
        &self,
        scores: &Tensor,
        coeffs: &Tensor,
        assignment: &AnchorRefineOutput,
    ) -> Result<RpnLossOutput> {
        let device = scores.device();

        // compact the predictions to the kept anchors
        let kept = self.anchor_refine.kept_index_tensor(device);
        let scores = scores.index_select(1, &kept);
        let coeffs = coeffs.index_select(1, &kept);

        let labels = assignment.labels();
        let targets = assignment.bbox_targets();
        let (batch_size, _) = labels.size2()?;

        let mut classification_loss = Tensor::zeros(&[], (Kind::Float, device));
        let mut regression_loss = Tensor::zeros(&[], (Kind::Float, device));

        // anchor counts differ per image after sampling, so loop
        for index in 0..batch_size {
            let image_labels = labels.i((index, ..));

            // classification over foreground + background anchors; the
            // label convention flips into predictor columns here
            let scored = image_labels.ge(0).nonzero().view([-1]);
            let column_targets = score_column_targets(&image_labels.index_select(0, &scored));
            let selected_scores = scores.i((index, .., ..)).index_select(0, &scored);
            classification_loss = classification_loss
                + self
                    .classification_loss
                    .forward(&selected_scores, &column_targets);

            // regression over foreground anchors only
            let foreground = image_labels.eq(1).nonzero().view([-1]);
            let selected_coeffs = coeffs.i((index, .., ..)).index_select(0, &foreground);
            let selected_targets = targets.i((index, .., ..)).index_select(0, &foreground);
            regression_loss = regression_loss
                + self
                    .regression_loss
                    .forward(&selected_coeffs, &selected_targets);
        }

        let classification_loss = classification_loss / batch_size as f64;
        let regression_loss = regression_loss / batch_size as f64;
        let total_loss = &classification_loss + &regression_loss;

        Ok(RpnLossOutput {
            total_loss,
            classification_loss,
            regression_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbox::{RectExt, TLBR};

    fn config() -> Config {
        Config {
            model: ModelConfig {
                image_size: 128,
                stride: 16,
                feature_channels: 8,
                mid_channels: 16,
                num_classes: 4,
            },
            rpn: RpnConfig {
                anchor_scales: vec![r64(1.0), r64(2.0)],
                anchor_ratios: vec![r64(0.5), r64(1.0), r64(2.0)],
                proposal: ProposalConfig {
                    pre_nms_top_n: 200,
                    post_nms_top_n: 32,
                    nms_threshold: r64(0.7),
                    min_box_size: r64(2.0),
                },
                anchor_sampling: AnchorSamplingConfig {
                    positive_threshold: r64(0.7),
                    negative_threshold: r64(0.3),
                    max_foreground: 16,
                    anchors_per_image: 32,
                },
                roi_sampling: RoiSamplingConfig {
                    foreground_threshold: r64(0.5),
                    background_threshold: r64(0.3),
                    max_foreground_rois: 8,
                    rois_per_image: 16,
                },
                seed: 0,
            },
        }
    }

    fn ground_truth() -> Vec<ImageGroundTruth> {
        vec![
            ImageGroundTruth::new(
                vec![
                    TLBR::from_tlbr([16.0, 16.0, 48.0, 48.0]),
                    TLBR::from_tlbr([64.0, 64.0, 112.0, 96.0]),
                ],
                vec![1, 3],
            )
            .unwrap(),
            ImageGroundTruth::empty(),
        ]
    }

    #[test]
    fn inference_returns_proposals_only() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut rpn = RpnInit { config: config() }.build(&vs.root()).unwrap();

        let feature_map = Tensor::randn(&[2, 8, 8, 8], (Kind::Float, Device::Cpu));
        let output = rpn.forward(&feature_map, None).unwrap();

        assert!(output.training.is_none());
        let (batch_size, _, columns) = output.proposals.rois().size3().unwrap();
        assert_eq!(batch_size, 2);
        assert_eq!(columns, 4);
        assert_eq!(output.proposals.per_image().len(), 2);
        for proposals in output.proposals.per_image() {
            assert!(proposals.boxes.len() <= 32);
        }
    }

    #[test]
    fn training_returns_targets_and_finite_loss() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut rpn = RpnInit { config: config() }.build(&vs.root()).unwrap();

        let feature_map = Tensor::randn(&[2, 8, 8, 8], (Kind::Float, Device::Cpu));
        let ground_truth = ground_truth();
        let output = rpn.forward(&feature_map, Some(&ground_truth)).unwrap();

        let training = output.training.unwrap();
        assert_eq!(training.selection.rois().size(), &[2, 16, 4]);
        assert_eq!(training.selection.labels().size(), &[2, 16]);
        assert_eq!(training.selection.bbox_targets().size(), &[2, 16, 20]);

        let total = f64::from(&training.loss.total_loss);
        assert!(total.is_finite() && total >= 0.0);
        let classification = f64::from(&training.loss.classification_loss);
        let regression = f64::from(&training.loss.regression_loss);
        assert!((total - classification - regression).abs() < 1e-6);
    }

    #[test]
    fn loss_backpropagates_into_the_head() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut rpn = RpnInit { config: config() }.build(&vs.root()).unwrap();

        let feature_map = Tensor::randn(&[2, 8, 8, 8], (Kind::Float, Device::Cpu));
        let ground_truth = ground_truth();
        let output = rpn.forward(&feature_map, Some(&ground_truth)).unwrap();

        // gradients flow back to the head variables
        let loss = output.training.unwrap().loss.total_loss;
        loss.backward();
        assert!(vs.trainable_variables().iter().any(|variable| {
            let grad = variable.grad();
            grad.defined() && f64::from(&grad.abs().sum(Kind::Float)) > 0.0
        }));
    }

    #[test]
    fn mismatched_ground_truth_batch_is_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut rpn = RpnInit { config: config() }.build(&vs.root()).unwrap();

        let feature_map = Tensor::randn(&[2, 8, 8, 8], (Kind::Float, Device::Cpu));
        let short = vec![ImageGroundTruth::empty()];
        assert!(rpn.forward(&feature_map, Some(&short)).is_err());
    }
}
