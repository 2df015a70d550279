use super::{CyCxHW, TLBR};
use crate::common::*;

/// The generic rectangle.
pub trait Rect {
    type Type;

    fn t(&self) -> Self::Type;
    fn l(&self) -> Self::Type;
    fn b(&self) -> Self::Type;
    fn r(&self) -> Self::Type;
    fn cy(&self) -> Self::Type;
    fn cx(&self) -> Self::Type;
    fn h(&self) -> Self::Type;
    fn w(&self) -> Self::Type;

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    fn try_from_cycxhw(cycxhw: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;
}

pub trait RectExt: Rect
where
    Self::Type: Num + PartialOrd,
{
    fn from_tlbr(tlbr: [Self::Type; 4]) -> Self
    where
        Self: Sized,
    {
        Self::try_from_tlbr(tlbr).unwrap()
    }

    fn from_cycxhw(cycxhw: [Self::Type; 4]) -> Self
    where
        Self: Sized,
    {
        Self::try_from_cycxhw(cycxhw).unwrap()
    }

    fn tlbr(&self) -> [Self::Type; 4] {
        [self.t(), self.l(), self.b(), self.r()]
    }

    fn cycxhw(&self) -> [Self::Type; 4] {
        [self.cy(), self.cx(), self.h(), self.w()]
    }

    fn to_tlbr(&self) -> TLBR<Self::Type> {
        TLBR {
            t: self.t(),
            l: self.l(),
            b: self.b(),
            r: self.r(),
        }
    }

    fn to_cycxhw(&self) -> CyCxHW<Self::Type> {
        CyCxHW {
            cy: self.cy(),
            cx: self.cx(),
            h: self.h(),
            w: self.w(),
        }
    }

    fn area(&self) -> <Self::Type as Mul<Self::Type>>::Output
    where
        Self::Type: Mul<Self::Type>,
    {
        self.h() * self.w()
    }
}

pub trait RectFloat: RectExt
where
    Self::Type: Float,
{
    fn intersect_with<R>(&self, other: &R) -> Option<TLBR<Self::Type>>
    where
        R: Rect<Type = Self::Type>,
    {
        let t = self.t().max(other.t());
        let l = self.l().max(other.l());
        let b = self.b().min(other.b());
        let r = self.r().min(other.r());
        (b > t && r > l).then(|| TLBR::from_tlbr([t, l, b, r]))
    }

    fn intersection_area_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        self.intersect_with(other)
            .map(|rect| rect.area())
            .unwrap_or_else(Self::Type::zero)
    }

    fn iou_with<R>(&self, other: &R, epsilon: Self::Type) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let inter_area = self.intersection_area_with(other);
        let union_area = self.area() + other.area() - inter_area + epsilon;
        inter_area / union_area
    }

    /// Clip the rectangle into the `[0, bound_w] x [0, bound_h]` region.
    fn clamp_to(&self, bound_h: Self::Type, bound_w: Self::Type) -> TLBR<Self::Type> {
        let zero = Self::Type::zero();
        TLBR {
            t: self.t().max(zero).min(bound_h),
            l: self.l().max(zero).min(bound_w),
            b: self.b().max(zero).min(bound_h),
            r: self.r().max(zero).min(bound_w),
        }
    }

    /// Whether the rectangle lies entirely inside `[0, bound_w] x [0, bound_h]`.
    fn is_inside(&self, bound_h: Self::Type, bound_w: Self::Type) -> bool {
        let zero = Self::Type::zero();
        self.t() >= zero && self.l() >= zero && self.b() <= bound_h && self.r() <= bound_w
    }
}

impl<T> RectExt for T
where
    T: Rect,
    T::Type: Num + PartialOrd,
{
}

impl<T> RectFloat for T
where
    T: Rect,
    T::Type: Float,
{
}
