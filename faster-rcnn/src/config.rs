//! Detector configuration format.
//!
//! Every parameter of the proposal pipeline is supplied here; the component
//! builders validate them at construction time and no component carries a
//! hidden default.

use crate::common::*;

/// The main detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub rpn: RpnConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

/// Parameters shared with the externally supplied backbone and classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Input image height and width in pixels.
    pub image_size: usize,
    /// Downsampling stride of the backbone feature grid.
    pub stride: usize,
    /// Channel count of the backbone feature map.
    pub feature_channels: usize,
    /// Channel count of the shared conv layer in the proposal head.
    pub mid_channels: usize,
    /// Number of foreground object classes.
    pub num_classes: usize,
}

/// Region proposal network parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpnConfig {
    /// Anchor size multipliers relative to the stride.
    pub anchor_scales: Vec<R64>,
    /// Anchor height/width aspect ratios.
    pub anchor_ratios: Vec<R64>,
    pub proposal: ProposalConfig,
    pub anchor_sampling: AnchorSamplingConfig,
    pub roi_sampling: RoiSamplingConfig,
    /// Seed of the sampler RNG.
    pub seed: u64,
}

/// Proposal decoding options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalConfig {
    /// Number of top-scoring candidates kept before NMS.
    pub pre_nms_top_n: usize,
    /// Maximum number of candidates kept by NMS.
    pub post_nms_top_n: usize,
    /// IoU at or above which NMS suppresses a candidate.
    pub nms_threshold: R64,
    /// Minimum candidate width and height in pixels.
    pub min_box_size: R64,
}

/// Training-time anchor assignment options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSamplingConfig {
    /// IoU at or above which an anchor is foreground.
    pub positive_threshold: R64,
    /// IoU below which an anchor is background.
    pub negative_threshold: R64,
    /// Foreground cap within the per-image anchor budget.
    pub max_foreground: usize,
    /// Total anchors sampled per image for the proposal loss.
    pub anchors_per_image: usize,
}

/// Training-time RoI assignment options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiSamplingConfig {
    /// IoU at or above which a RoI is foreground.
    pub foreground_threshold: R64,
    /// IoU below which a RoI is background.
    pub background_threshold: R64,
    /// Foreground cap within the per-image RoI budget.
    pub max_foreground_rois: usize,
    /// Total RoIs selected per image for the classifier loss.
    pub rois_per_image: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_file() {
        let text = r#"
        {
            model: {
                image_size: 800,
                stride: 16,
                feature_channels: 1024,
                mid_channels: 512,
                num_classes: 20,
            },
            rpn: {
                anchor_scales: [4, 8, 16],
                anchor_ratios: [0.5, 1.0, 2.0],
                proposal: {
                    pre_nms_top_n: 6000,
                    post_nms_top_n: 300,
                    nms_threshold: 0.7,
                    min_box_size: 16.0,
                },
                anchor_sampling: {
                    positive_threshold: 0.7,
                    negative_threshold: 0.3,
                    max_foreground: 128,
                    anchors_per_image: 256,
                },
                roi_sampling: {
                    foreground_threshold: 0.5,
                    background_threshold: 0.3,
                    max_foreground_rois: 32,
                    rois_per_image: 128,
                },
                seed: 42,
            },
        }
        "#;

        let config: Config = json5::from_str(text).unwrap();
        assert_eq!(config.model.num_classes, 20);
        assert_eq!(config.rpn.anchor_scales.len(), 3);
        assert_eq!(config.rpn.proposal.post_nms_top_n, 300);
        assert_eq!(config.rpn.anchor_sampling.anchors_per_image, 256);
        assert_eq!(config.rpn.roi_sampling.rois_per_image, 128);
        assert_eq!(config.rpn.seed, 42);
    }
}
