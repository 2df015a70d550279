//! Loss function building blocks.

mod cross_entropy;
mod smooth_l1;

pub use cross_entropy::*;
pub use smooth_l1::*;
