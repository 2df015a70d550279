use super::{CyCxHW, Rect};
use crate::common::*;

/// Bounding box in TLBR format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TLBR<T> {
    pub(crate) t: T,
    pub(crate) l: T,
    pub(crate) b: T,
    pub(crate) r: T,
}

impl<T> TLBR<T> {
    pub fn try_cast<V>(self) -> Option<TLBR<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(TLBR {
            t: V::from(self.t)?,
            l: V::from(self.l)?,
            b: V::from(self.b)?,
            r: V::from(self.r)?,
        })
    }

    pub fn cast<V>(self) -> TLBR<V>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        self.try_cast().unwrap()
    }
}

impl<T> Rect for TLBR<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn t(&self) -> Self::Type {
        self.t
    }

    fn l(&self) -> Self::Type {
        self.l
    }

    fn b(&self) -> Self::Type {
        self.b
    }

    fn r(&self) -> Self::Type {
        self.r
    }

    fn cy(&self) -> Self::Type {
        let one = T::one();
        let two = one + one;
        self.t + self.h() / two
    }

    fn cx(&self) -> Self::Type {
        let one = T::one();
        let two = one + one;
        self.l + self.w() / two
    }

    fn h(&self) -> Self::Type {
        self.b - self.t
    }

    fn w(&self) -> Self::Type {
        self.r - self.l
    }

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(b >= t && r >= l, "b >= t and r >= l must hold");

        Ok(Self { t, l, b, r })
    }

    fn try_from_cycxhw(cycxhw: [Self::Type; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(h >= zero && w >= zero, "h and w must be non-negative");

        let two = T::one() + T::one();
        let t = cy - h / two;
        let b = cy + h / two;
        let l = cx - w / two;
        let r = cx + w / two;

        Ok(Self { t, l, b, r })
    }
}

impl<T> From<CyCxHW<T>> for TLBR<T>
where
    T: Copy + Num,
{
    fn from(from: CyCxHW<T>) -> Self {
        Self::from(&from)
    }
}

impl<T> From<&CyCxHW<T>> for TLBR<T>
where
    T: Copy + Num,
{
    fn from(from: &CyCxHW<T>) -> Self {
        let two = T::one() + T::one();
        let CyCxHW { cy, cx, h, w, .. } = *from;
        let t = cy - h / two;
        let l = cx - w / two;
        let b = cy + h / two;
        let r = cx + w / two;
        Self { t, l, b, r }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RectExt, RectFloat};
    use approx::assert_abs_diff_eq;

    #[test]
    fn iou_of_identical_boxes() {
        let lhs = TLBR::from_tlbr([0.0, 0.0, 10.0, 10.0]);
        assert_abs_diff_eq!(lhs.iou_with(&lhs, 0.0), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn iou_of_half_overlapping_boxes() {
        let lhs = TLBR::from_tlbr([0.0, 0.0, 10.0, 10.0]);
        let rhs = TLBR::from_tlbr([0.0, 5.0, 10.0, 15.0]);
        // intersection 50, union 150
        assert_abs_diff_eq!(lhs.iou_with(&rhs, 0.0), 1.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn iou_of_disjoint_boxes() {
        let lhs = TLBR::from_tlbr([0.0, 0.0, 10.0, 10.0]);
        let rhs = TLBR::from_tlbr([20.0, 20.0, 30.0, 30.0]);
        assert!(lhs.intersect_with(&rhs).is_none());
        assert_abs_diff_eq!(lhs.iou_with(&rhs, 0.0), 0.0);
    }

    #[test]
    fn clamp_to_image_bounds() {
        let bbox = TLBR::from_tlbr([-5.0, -3.0, 12.0, 20.0]);
        let clamped = bbox.clamp_to(10.0, 16.0);
        assert_eq!(clamped.tlbr(), [0.0, 0.0, 10.0, 16.0]);
        assert!(clamped.is_inside(10.0, 16.0));
        assert!(!bbox.is_inside(10.0, 16.0));
    }

    #[test]
    fn cycxhw_conversion_round_trip() {
        let orig = TLBR::from_tlbr([2.0, 4.0, 10.0, 16.0]);
        let converted = TLBR::from(orig.to_cycxhw());
        assert_eq!(orig, converted);
    }
}
