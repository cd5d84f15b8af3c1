use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, Sub};

/// Type-level marker for the display (screen) coordinate space
#[derive(Debug)]
pub struct Display;

/// Type-level marker for the buffer coordinate space
#[derive(Debug)]
pub struct Buffer;

/// Trait for types serving as a coordinate for other geometry utils
pub trait Coordinate:
    Sized + Add<Self, Output = Self> + Sub<Self, Output = Self> + PartialOrd + Default + Copy + fmt::Debug
{
    /// A Coordinate that is 0
    const ZERO: Self;
    /// Convert the coordinate to a f64
    fn to_f64(self) -> f64;
    /// Convert to this coordinate from a f64
    fn from_f64(v: f64) -> Self;
    /// Compare and return the smaller one
    fn min(self, other: Self) -> Self {
        if self < other {
            self
        } else {
            other
        }
    }
    /// Compare and return the larger one
    fn max(self, other: Self) -> Self {
        if self > other {
            self
        } else {
            other
        }
    }
    /// Saturating addition
    fn saturating_add(self, other: Self) -> Self;
    /// Saturating subtraction
    fn saturating_sub(self, other: Self) -> Self;
}

impl Coordinate for i32 {
    const ZERO: i32 = 0;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as i32
    }

    #[inline]
    fn saturating_add(self, other: Self) -> Self {
        i32::saturating_add(self, other)
    }

    #[inline]
    fn saturating_sub(self, other: Self) -> Self {
        i32::saturating_sub(self, other)
    }
}

impl Coordinate for f64 {
    const ZERO: f64 = 0.0;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn saturating_add(self, other: Self) -> Self {
        self + other
    }

    #[inline]
    fn saturating_sub(self, other: Self) -> Self {
        self - other
    }
}

/// A point as defined by its x and y coordinates
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: PhantomData<Kind>,
}

impl<N: Coordinate, Kind> Point<N, Kind> {
    /// Convert this [`Point`] to a [`Size`] with the same coordinates
    #[inline]
    pub fn to_size(self) -> Size<N, Kind> {
        Size {
            w: self.x,
            h: self.y,
            _kind: PhantomData,
        }
    }
}

impl<N, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Point<N, Kind> {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

impl<N: Coordinate, Kind> Add for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn add(self, other: Point<N, Kind>) -> Point<N, Kind> {
        (self.x.saturating_add(other.x), self.y.saturating_add(other.y)).into()
    }
}

impl<N: Coordinate, Kind> Add<Size<N, Kind>> for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn add(self, other: Size<N, Kind>) -> Point<N, Kind> {
        (self.x.saturating_add(other.w), self.y.saturating_add(other.h)).into()
    }
}

impl<N: Coordinate, Kind> Sub for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn sub(self, other: Point<N, Kind>) -> Point<N, Kind> {
        (self.x.saturating_sub(other.x), self.y.saturating_sub(other.y)).into()
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Point<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point").field("x", &self.x).field("y", &self.y).finish()
    }
}

impl<N: Clone, Kind> Clone for Point<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Point {
            x: self.x.clone(),
            y: self.y.clone(),
            _kind: PhantomData,
        }
    }
}

impl<N: Copy, Kind> Copy for Point<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Point<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<N: Eq, Kind> Eq for Point<N, Kind> {}

impl<N: Default, Kind> Default for Point<N, Kind> {
    fn default() -> Self {
        Point {
            x: N::default(),
            y: N::default(),
            _kind: PhantomData,
        }
    }
}

/// A size as defined by its width and height
pub struct Size<N, Kind> {
    /// horizontal coordinate
    pub w: N,
    /// vertical coordinate
    pub h: N,
    _kind: PhantomData<Kind>,
}

impl<N: Coordinate, Kind> Size<N, Kind> {
    /// Check if this [`Size`] is empty
    ///
    /// Returns true if either the width or the height is zero
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w <= N::ZERO || self.h <= N::ZERO
    }

    /// Convert the underlying numerical type to f64 for floating point manipulations
    #[inline]
    pub fn to_f64(self) -> Size<f64, Kind> {
        (self.w.to_f64(), self.h.to_f64()).into()
    }
}

impl<N, Kind> From<(N, N)> for Size<N, Kind> {
    #[inline]
    fn from((w, h): (N, N)) -> Size<N, Kind> {
        Size {
            w,
            h,
            _kind: PhantomData,
        }
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Size<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size").field("w", &self.w).field("h", &self.h).finish()
    }
}

impl<N: Clone, Kind> Clone for Size<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Size {
            w: self.w.clone(),
            h: self.h.clone(),
            _kind: PhantomData,
        }
    }
}

impl<N: Copy, Kind> Copy for Size<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Size<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<N: Eq, Kind> Eq for Size<N, Kind> {}

impl<N: Default, Kind> Default for Size<N, Kind> {
    fn default() -> Self {
        Size {
            w: N::default(),
            h: N::default(),
            _kind: PhantomData,
        }
    }
}

/// A rectangle defined by its top-left corner and dimensions
pub struct Rectangle<N, Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<N, Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<N, Kind>,
}

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn new(loc: Point<N, Kind>, size: Size<N, Kind>) -> Self {
        Rectangle { loc, size }
    }

    /// Create a new [`Rectangle`] from its dimensions, with location zero
    #[inline]
    pub fn from_size(size: Size<N, Kind>) -> Self {
        Rectangle {
            loc: (N::ZERO, N::ZERO).into(),
            size,
        }
    }

    /// Create a new [`Rectangle`] from its left, top, right and bottom edges
    #[inline]
    pub fn from_ltrb(left: N, top: N, right: N, bottom: N) -> Self {
        Rectangle::from_extremities((left, top), (right, bottom))
    }

    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its bottom-right corner
    #[inline]
    pub fn from_extremities(
        topleft: impl Into<Point<N, Kind>>,
        bottomright: impl Into<Point<N, Kind>>,
    ) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        Rectangle {
            loc: topleft,
            size: (bottomright - topleft).to_size(),
        }
    }

    /// Left edge
    #[inline]
    pub fn left(&self) -> N {
        self.loc.x
    }

    /// Top edge
    #[inline]
    pub fn top(&self) -> N {
        self.loc.y
    }

    /// Right edge, exclusive
    #[inline]
    pub fn right(&self) -> N {
        self.loc.x.saturating_add(self.size.w)
    }

    /// Bottom edge, exclusive
    #[inline]
    pub fn bottom(&self) -> N {
        self.loc.y.saturating_add(self.size.h)
    }

    /// Returns true if the rectangle has no area
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Checks whether given [`Rectangle`] is inside the rectangle
    ///
    /// This includes rectangles with the same location and size
    #[inline]
    pub fn contains_rect<R: Into<Rectangle<N, Kind>>>(self, rect: R) -> bool {
        let r: Rectangle<N, Kind> = rect.into();
        r.loc.x >= self.loc.x && r.loc.y >= self.loc.y && r.right() <= self.right() && r.bottom() <= self.bottom()
    }

    /// Checks whether a given [`Rectangle`] overlaps with this one
    ///
    /// Note: This operation is exclusive, touching only rectangles will return `false`.
    #[inline]
    pub fn overlaps(self, other: impl Into<Rectangle<N, Kind>>) -> bool {
        let other = other.into();

        self.loc.x < other.right()
            && other.loc.x < self.right()
            && self.loc.y < other.bottom()
            && other.loc.y < self.bottom()
    }

    /// Clamp rectangle to min and max corners resulting in the overlapping area of two rectangles
    ///
    /// Returns `None` if the two rectangles don't overlap
    #[inline]
    pub fn intersection(self, other: impl Into<Rectangle<N, Kind>>) -> Option<Self> {
        let other = other.into();
        if !self.overlaps(other) {
            return None;
        }
        Some(Rectangle::from_extremities(
            (self.loc.x.max(other.loc.x), self.loc.y.max(other.loc.y)),
            (self.right().min(other.right()), self.bottom().min(other.bottom())),
        ))
    }

    /// Merge two [`Rectangle`] by producing the smallest rectangle that contains both
    ///
    /// Empty rectangles do not contribute to the result.
    #[inline]
    pub fn merge(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Rectangle::from_extremities(
            (self.loc.x.min(other.loc.x), self.loc.y.min(other.loc.y)),
            (self.right().max(other.right()), self.bottom().max(other.bottom())),
        )
    }

    /// Subtract a set of [`Rectangle`]s from this [`Rectangle`]
    pub fn subtract_rects(self, others: impl IntoIterator<Item = Self>) -> Vec<Self> {
        let mut remaining = Vec::with_capacity(4);
        remaining.push(self);
        Self::subtract_rects_many_in_place(remaining, others)
    }

    /// Subtract a set of [`Rectangle`]s from a set [`Rectangle`]s in-place
    pub fn subtract_rects_many_in_place(
        mut rects: Vec<Self>,
        others: impl IntoIterator<Item = Self>,
    ) -> Vec<Self> {
        for other in others {
            let items = rects.len();
            let mut checked = 0usize;
            let mut index = 0usize;

            if items == 0 {
                return rects;
            }

            while checked != items {
                checked += 1;

                let Some(intersection) = rects[index].intersection(other) else {
                    index += 1;
                    continue;
                };

                let item = rects.remove(index);
                if other.contains_rect(item) {
                    continue;
                }

                let pieces = [
                    Rectangle::from_ltrb(item.left(), item.top(), item.right(), intersection.top()),
                    Rectangle::from_ltrb(
                        item.left(),
                        intersection.top(),
                        intersection.left(),
                        intersection.bottom(),
                    ),
                    Rectangle::from_ltrb(
                        intersection.right(),
                        intersection.top(),
                        item.right(),
                        intersection.bottom(),
                    ),
                    Rectangle::from_ltrb(item.left(), intersection.bottom(), item.right(), item.bottom()),
                ];
                rects.extend(pieces.into_iter().filter(|rect| !rect.is_empty()));
            }
        }

        rects
    }

    /// Convert the underlying numerical type to f64
    #[inline]
    pub fn to_f64(self) -> Rectangle<f64, Kind> {
        Rectangle {
            loc: (self.loc.x.to_f64(), self.loc.y.to_f64()).into(),
            size: self.size.to_f64(),
        }
    }
}

impl<Kind> Rectangle<f64, Kind> {
    /// Convert to an integer rectangle, growing to the enclosing pixel grid
    #[inline]
    pub fn to_i32_up(self) -> Rectangle<i32, Kind> {
        Rectangle::from_ltrb(
            self.left().floor() as i32,
            self.top().floor() as i32,
            self.right().ceil() as i32,
            self.bottom().ceil() as i32,
        )
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Rectangle<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

impl<N: Clone, Kind> Clone for Rectangle<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Rectangle {
            loc: self.loc.clone(),
            size: self.size.clone(),
        }
    }
}

impl<N: Copy, Kind> Copy for Rectangle<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Rectangle<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<N: Eq, Kind> Eq for Rectangle<N, Kind> {}

impl<N: Default, Kind> Default for Rectangle<N, Kind> {
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}

bitflags::bitflags! {
    /// Layer transform, encoded the way composition clients submit it
    ///
    /// Rotations are expressed as combinations of flips, so `ROT_180` is
    /// `FLIP_H | FLIP_V` and `ROT_270` is `ROT_180 | ROT_90`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Transform: u32 {
        /// Mirror horizontally
        const FLIP_H = 1;
        /// Mirror vertically
        const FLIP_V = 2;
        /// Rotate 90 degrees clockwise
        const ROT_90 = 4;
        /// Rotate 180 degrees
        const ROT_180 = 3;
        /// Rotate 270 degrees clockwise
        const ROT_270 = 7;
    }
}

impl Transform {
    /// Returns true if the transform swaps width and height
    #[inline]
    pub fn swaps_axes(self) -> bool {
        self.contains(Transform::ROT_90)
    }
}

#[cfg(test)]
mod tests {
    use super::{Display, Rectangle, Transform};

    type Rect = Rectangle<i32, Display>;

    #[test]
    fn overlap_is_exclusive() {
        let a = Rect::from_ltrb(0, 0, 10, 10);
        let b = Rect::from_ltrb(10, 0, 20, 10);
        assert!(!a.overlaps(b));
        assert!(a.overlaps(Rect::from_ltrb(9, 9, 11, 11)));
    }

    #[test]
    fn merge_ignores_empty() {
        let empty = Rect::default();
        let a = Rect::from_ltrb(5, 5, 10, 10);
        assert_eq!(empty.merge(a), a);
        assert_eq!(a.merge(Rect::from_ltrb(0, 20, 1, 21)), Rect::from_ltrb(0, 5, 10, 21));
    }

    #[test]
    fn subtract_center() {
        let outer = Rect::from_ltrb(0, 0, 100, 100);
        let hole = Rect::from_ltrb(25, 25, 75, 75);
        let rest = outer.subtract_rects([hole]);
        assert_eq!(rest.len(), 4);
        let area: i32 = rest.iter().map(|r| r.size.w * r.size.h).sum();
        assert_eq!(area, 100 * 100 - 50 * 50);
        assert!(rest.iter().all(|r| !r.overlaps(hole)));
    }

    #[test]
    fn subtract_fully_covered() {
        let inner = Rect::from_ltrb(10, 10, 20, 20);
        assert!(inner.subtract_rects([Rect::from_ltrb(0, 0, 30, 30)]).is_empty());
    }

    #[test]
    fn transform_encoding() {
        assert_eq!(Transform::ROT_180, Transform::FLIP_H | Transform::FLIP_V);
        assert_eq!(Transform::ROT_270, Transform::ROT_180 | Transform::ROT_90);
        assert!(Transform::ROT_270.swaps_axes());
        assert!(!Transform::ROT_180.swaps_axes());
    }
}
