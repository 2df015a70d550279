use crate::common::*;
use bbox::{prelude::*, TLBR};
use getset::{CopyGetters, Getters};

/// Anchor generator options.
#[derive(Debug, Clone)]
pub struct AnchorGeneratorInit {
    /// Input image height and width in pixels.
    pub image_size: usize,
    /// Pixels per feature grid cell.
    pub stride: usize,
    /// Anchor size multipliers relative to the stride.
    pub scales: Vec<R64>,
    /// Anchor height/width aspect ratios.
    pub ratios: Vec<R64>,
}

impl AnchorGeneratorInit {
    pub fn build(self) -> Result<AnchorSet> {
        let Self {
            image_size,
            stride,
            scales,
            ratios,
        } = self;

        ensure!(
            image_size > 0 && stride > 0,
            "image_size and stride must be positive"
        );
        ensure!(
            image_size % stride == 0,
            "image_size ({}) must be a multiple of stride ({})",
            image_size,
            stride
        );
        ensure!(
            !scales.is_empty() && !ratios.is_empty(),
            "scales and ratios must be non-empty"
        );
        ensure!(
            scales.iter().all(|&scale| scale > 0.0) && ratios.iter().all(|&ratio| ratio > 0.0),
            "scales and ratios must be positive"
        );

        let grid_size = image_size / stride;
        let num_anchor_types = scales.len() * ratios.len();

        let boxes: Vec<_> = iproduct!(0..grid_size, 0..grid_size, &scales, &ratios)
            .map(|(row, col, &scale, &ratio)| {
                let cy = (row as f64 + 0.5) * stride as f64;
                let cx = (col as f64 + 0.5) * stride as f64;
                let base = stride as f64 * scale.raw();
                let h = base * ratio.raw().sqrt();
                let w = base / ratio.raw().sqrt();
                TLBR::from_cycxhw([cy, cx, h, w])
            })
            .collect();

        Ok(AnchorSet {
            boxes,
            grid_size,
            num_anchor_types,
        })
    }
}

/// The full ordered set of anchor boxes over the feature grid.
///
/// Anchors are in input-image pixel space, ordered by grid row, then grid
/// column, then anchor type, where types iterate ratios within each scale.
/// The proposal head flattens its predictions in the same order; the two
/// must never disagree. The set is generated once per configuration and
/// shared read-only behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct AnchorSet {
    /// Anchor boxes in flattening order.
    #[get = "pub"]
    boxes: Vec<TLBR<f64>>,
    /// Feature grid height and width in cells.
    #[get_copy = "pub"]
    grid_size: usize,
    /// Anchors per grid cell.
    #[get_copy = "pub"]
    num_anchor_types: usize,
}

impl AnchorSet {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}
