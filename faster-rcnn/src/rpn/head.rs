use crate::common::*;

/// Proposal head options.
#[derive(Debug, Clone)]
pub struct RpnHeadInit {
    /// Channel count of the backbone feature map.
    pub in_channels: usize,
    /// Channel count of the shared conv layer.
    pub mid_channels: usize,
    /// Anchors per grid cell.
    pub num_anchor_types: usize,
}

impl RpnHeadInit {
    pub fn build<'p, P>(self, path: P) -> Result<RpnHead>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_channels,
            mid_channels,
            num_anchor_types,
        } = self;

        ensure!(
            in_channels > 0 && mid_channels > 0 && num_anchor_types > 0,
            "channel counts and num_anchor_types must be positive"
        );

        let conv = nn::conv2d(
            path / "conv",
            in_channels as i64,
            mid_channels as i64,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );
        let score_conv = nn::conv2d(
            path / "bbox_score",
            mid_channels as i64,
            (num_anchor_types * 2) as i64,
            1,
            Default::default(),
        );
        let coeff_conv = nn::conv2d(
            path / "bbox_coeff",
            mid_channels as i64,
            (num_anchor_types * 4) as i64,
            1,
            Default::default(),
        );

        Ok(RpnHead {
            conv,
            score_conv,
            coeff_conv,
            in_channels: in_channels as i64,
        })
    }
}

/// Predicts per-anchor scores and box deltas from the feature grid.
#[derive(Debug)]
pub struct RpnHead {
    conv: nn::Conv2D,
    score_conv: nn::Conv2D,
    coeff_conv: nn::Conv2D,
    in_channels: i64,
}

#[derive(Debug, TensorLike)]
pub struct RpnHeadOutput {
    /// `[N, A, 2]` per-anchor (foreground, background) logits.
    pub scores: Tensor,
    /// `[N, A, 4]` per-anchor box deltas.
    pub coeffs: Tensor,
}

impl RpnHead {
    pub fn forward(&self, feature_map: &Tensor) -> Result<RpnHeadOutput> {
        let (_batch_size, channels, _height, _width) = feature_map
            .size4()
            .context("expect a [batch, channels, height, width] feature map")?;
        ensure!(
            channels == self.in_channels,
            "expect {} feature channels, found {}",
            self.in_channels,
            channels
        );

        let shared = feature_map.apply(&self.conv).relu();
        let scores = flatten_anchor_predictions(&shared.apply(&self.score_conv), 2);
        let coeffs = flatten_anchor_predictions(&shared.apply(&self.coeff_conv), 4);

        Ok(RpnHeadOutput { scores, coeffs })
    }
}

/// Reshape `[N, types*C, Hf, Wf]` to `[N, Hf*Wf*types, C]`.
///
/// Rows come out ordered by grid row, then grid column, then anchor type,
/// matching the anchor set's flattening order.
fn flatten_anchor_predictions(xs: &Tensor, last_dim: i64) -> Tensor {
    let (batch_size, _, _, _) = xs.size4().unwrap();
    xs.permute(&[0, 2, 3, 1])
        .contiguous()
        .view([batch_size, -1, last_dim])
}
