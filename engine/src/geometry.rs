//! Planar geometry shared by resource space, geo space and canvas space

use std::ops::{Add, Mul, Sub};

/// A 2D point. Used for resource pixels, geo coordinates and canvas pixels alike.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (*self - *other).length()
    }

    pub fn length(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn to_array(self) -> [f64; 2] {
        [self.x, self.y]
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Point {
    type Output = Point;

    fn mul(self, rhs: f64) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Point::new(x, y)
    }
}

/// Polygon ring without a repeated closing point.
pub type Ring = Vec<Point>;

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bbox {
    pub min: Point,
    pub max: Point,
}

impl Bbox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min: Point::new(min_x, min_y),
            max: Point::new(max_x, max_y),
        }
    }

    /// Bounding box of a set of points, `None` when the iterator is empty.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bbox = Bbox {
            min: *first,
            max: *first,
        };
        for p in iter {
            bbox.extend(p);
        }
        Some(bbox)
    }

    pub fn extend(&mut self, p: &Point) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
    }

    pub fn union(&self, other: &Bbox) -> Bbox {
        Bbox::new(
            self.min.x.min(other.min.x),
            self.min.y.min(other.min.y),
            self.max.x.max(other.max.x),
            self.max.y.max(other.max.y),
        )
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
        )
    }

    /// Closed-interval overlap test (touching boxes intersect).
    pub fn intersects(&self, other: &Bbox) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
    }

    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    pub fn to_aabb(&self) -> rstar::AABB<[f64; 2]> {
        rstar::AABB::from_corners(self.min.to_array(), self.max.to_array())
    }
}

/// Twice the signed area of a ring. Positive for counter-clockwise rings in a y-up frame.
pub fn signed_area2(ring: &[Point]) -> f64 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let a = ring[i];
            let b = ring[(i + 1) % n];
            a.x * b.y - b.x * a.y
        })
        .sum()
}

/// Cross product of `(b - a)` and `(c - a)`.
#[inline]
pub fn orient2d(a: Point, b: Point, c: Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// Even-odd point in polygon test.
pub fn point_in_ring(p: &Point, ring: &[Point]) -> bool {
    let n = ring.len();
    let mut inside = false;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let a = ring[i];
        let b = ring[j];
        if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Whether `p` lies inside or on the triangle `abc`, in either winding.
pub fn point_in_triangle(p: Point, a: Point, b: Point, c: Point) -> bool {
    let d1 = orient2d(a, b, p);
    let d2 = orient2d(b, c, p);
    let d3 = orient2d(c, a, p);
    let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
    let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
    !(has_neg && has_pos)
}

/// Clip a polygon against a convex clip polygon (Sutherland–Hodgman).
///
/// The clip polygon may have either winding. Returns an empty vector when the
/// polygons do not overlap.
pub fn clip_polygon(subject: &[Point], clip: &[Point]) -> Vec<Point> {
    if subject.is_empty() || clip.len() < 3 {
        return Vec::new();
    }
    let sign = if signed_area2(clip) >= 0.0 { 1.0 } else { -1.0 };
    let mut output = subject.to_vec();

    for i in 0..clip.len() {
        if output.is_empty() {
            break;
        }
        let ca = clip[i];
        let cb = clip[(i + 1) % clip.len()];
        let inside = |p: &Point| sign * orient2d(ca, cb, *p) >= 0.0;

        let input = std::mem::take(&mut output);
        let mut prev = input[input.len() - 1];
        for &cur in &input {
            let cur_in = inside(&cur);
            let prev_in = inside(&prev);
            if cur_in {
                if !prev_in {
                    output.push(line_intersection(prev, cur, ca, cb));
                }
                output.push(cur);
            } else if prev_in {
                output.push(line_intersection(prev, cur, ca, cb));
            }
            prev = cur;
        }
    }
    output
}

/// Intersection of segment `p1p2` with the infinite line through `a` and `b`.
fn line_intersection(p1: Point, p2: Point, a: Point, b: Point) -> Point {
    let d1 = orient2d(a, b, p1);
    let d2 = orient2d(a, b, p2);
    let denom = d1 - d2;
    if denom.abs() < f64::EPSILON {
        return p1;
    }
    let t = d1 / denom;
    p1 + (p2 - p1) * t
}

/// 2D affine map `(x, y) -> (a*x + b*y + c, d*x + e*y + f)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Affine {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Affine {
    /// Affine map sending triangle `src` onto triangle `dst`. `None` for degenerate `src`.
    pub fn from_triangles(src: [Point; 3], dst: [Point; 3]) -> Option<Affine> {
        let [p0, p1, p2] = src;
        let det = orient2d(p0, p1, p2);
        if det.abs() < 1e-12 {
            return None;
        }
        let solve = |v0: f64, v1: f64, v2: f64| -> (f64, f64, f64) {
            let a = ((v1 - v0) * (p2.y - p0.y) - (v2 - v0) * (p1.y - p0.y)) / det;
            let b = ((v2 - v0) * (p1.x - p0.x) - (v1 - v0) * (p2.x - p0.x)) / det;
            let c = v0 - a * p0.x - b * p0.y;
            (a, b, c)
        };
        let (a, b, c) = solve(dst[0].x, dst[1].x, dst[2].x);
        let (d, e, f) = solve(dst[0].y, dst[1].y, dst[2].y);
        Some(Affine { a, b, c, d, e, f })
    }

    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x + self.b * p.y + self.c,
            self.d * p.x + self.e * p.y + self.f,
        )
    }

    /// Determinant of the linear part.
    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    pub fn inverse(&self) -> Option<Affine> {
        let det = self.determinant();
        if det.abs() < 1e-300 {
            return None;
        }
        let a = self.e / det;
        let b = -self.b / det;
        let d = -self.d / det;
        let e = self.a / det;
        Some(Affine {
            a,
            b,
            c: -(a * self.c + b * self.f),
            d,
            e,
            f: -(d * self.c + e * self.f),
        })
    }
}
