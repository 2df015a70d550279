use crate::common::*;
use bbox::{prelude::*, TLBR};

/// Ground truth of one image: a variable-length set of boxes with class ids.
///
/// Boxes are in input-image pixel space. Class ids start at 1; class 0 is
/// reserved for background and never appears in ground truth. The record is
/// owned by the caller and borrowed for the duration of one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageGroundTruth {
    boxes: Vec<TLBR<f64>>,
    classes: Vec<i64>,
}

impl ImageGroundTruth {
    pub fn new(boxes: Vec<TLBR<f64>>, classes: Vec<i64>) -> Result<Self> {
        ensure!(
            boxes.len() == classes.len(),
            "number of boxes ({}) does not match number of classes ({})",
            boxes.len(),
            classes.len()
        );
        for bbox in &boxes {
            ensure!(
                bbox.h() > 0.0 && bbox.w() > 0.0,
                "ground truth boxes must have positive height and width, found {:?}",
                bbox
            );
            if bbox.h() < 1.0 || bbox.w() < 1.0 {
                warn!("the ground truth box {:?} is smaller than one pixel", bbox);
            }
        }
        for &class in &classes {
            ensure!(
                class >= 1,
                "ground truth class ids start at 1, found {}",
                class
            );
        }

        Ok(Self { boxes, classes })
    }

    pub fn empty() -> Self {
        Self {
            boxes: vec![],
            classes: vec![],
        }
    }

    pub fn boxes(&self) -> &[TLBR<f64>] {
        &self.boxes
    }

    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}
