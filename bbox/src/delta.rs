use super::{CyCxHW, Rect};
use crate::common::*;

/// Box regression coefficients in (dy, dx, dh, dw) order.
///
/// The center offsets are relative to the source box size, and the size
/// terms are log-space ratios. `decode(src, encode(src, dst))` recovers
/// `dst` for any source box with positive height and width.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxDelta<T> {
    pub dy: T,
    pub dx: T,
    pub dh: T,
    pub dw: T,
}

impl<T> BoxDelta<T> {
    pub fn try_cast<V>(self) -> Option<BoxDelta<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(BoxDelta {
            dy: V::from(self.dy)?,
            dx: V::from(self.dx)?,
            dh: V::from(self.dh)?,
            dw: V::from(self.dw)?,
        })
    }

    pub fn cast<V>(self) -> BoxDelta<V>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        self.try_cast().unwrap()
    }
}

impl<T> BoxDelta<T>
where
    T: Float,
{
    pub fn zero() -> Self {
        let zero = T::zero();
        Self {
            dy: zero,
            dx: zero,
            dh: zero,
            dw: zero,
        }
    }

    /// Compute the coefficients that deform `src` into `dst`.
    pub fn try_encode<S, D>(src: &S, dst: &D) -> Result<Self>
    where
        S: Rect<Type = T>,
        D: Rect<Type = T>,
    {
        let zero = T::zero();
        ensure!(
            src.h() > zero && src.w() > zero,
            "source box must have positive height and width"
        );
        ensure!(
            dst.h() > zero && dst.w() > zero,
            "target box must have positive height and width"
        );

        Ok(Self {
            dy: (dst.cy() - src.cy()) / src.h(),
            dx: (dst.cx() - src.cx()) / src.w(),
            dh: (dst.h() / src.h()).ln(),
            dw: (dst.w() / src.w()).ln(),
        })
    }

    pub fn encode<S, D>(src: &S, dst: &D) -> Self
    where
        S: Rect<Type = T>,
        D: Rect<Type = T>,
    {
        Self::try_encode(src, dst).unwrap()
    }

    /// Apply the coefficients to `src`.
    pub fn decode<S>(&self, src: &S) -> CyCxHW<T>
    where
        S: Rect<Type = T>,
    {
        CyCxHW {
            cy: src.cy() + self.dy * src.h(),
            cx: src.cx() + self.dx * src.w(),
            h: src.h() * self.dh.exp(),
            w: src.w() * self.dw.exp(),
        }
    }
}

impl<T> BoxDelta<T>
where
    T: Copy,
{
    pub fn dydxdhdw(&self) -> [T; 4] {
        [self.dy, self.dx, self.dh, self.dw]
    }
}
