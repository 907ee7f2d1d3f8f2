use json::JsonValue;
use std::fmt;
use std::ops::{Add, Div, Index, Mul, Neg, Sub};

#[derive(Clone, Copy, Debug, PartialEq)]
/// 2D vector in a reference (parametric) space
pub struct V2D {
    inner: [f64; 2],
}

impl V2D {
    pub const fn from([x, y]: [f64; 2]) -> Self {
        Self { inner: [x, y] }
    }

    pub const fn zero() -> Self {
        Self { inner: [0.0; 2] }
    }

    pub fn dot_with(&self, other: &Self) -> f64 {
        self[0] * other[0] + self[1] * other[1]
    }

    pub fn dot(a: Self, b: Self) -> f64 {
        a[0] * b[0] + a[1] * b[1]
    }

    pub fn norm(&self) -> f64 {
        self.dot_with(self).sqrt()
    }
}

impl Default for V2D {
    fn default() -> Self {
        Self::zero()
    }
}

impl Index<usize> for V2D {
    type Output = f64;
    fn index(&self, index: usize) -> &Self::Output {
        &self.inner[index]
    }
}

impl Add for V2D {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            inner: [self[0] + other[0], self[1] + other[1]],
        }
    }
}

impl Sub for V2D {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self {
            inner: [self[0] - other[0], self[1] - other[1]],
        }
    }
}

impl Neg for V2D {
    type Output = Self;
    fn neg(self) -> Self {
        Self {
            inner: [-self[0], -self[1]],
        }
    }
}

impl Div<f64> for V2D {
    type Output = Self;
    fn div(self, divisor: f64) -> Self {
        Self {
            inner: [self[0] / divisor, self[1] / divisor],
        }
    }
}

impl Mul<f64> for V2D {
    type Output = Self;
    fn mul(self, coefficient: f64) -> Self {
        Self {
            inner: [self[0] * coefficient, self[1] * coefficient],
        }
    }
}

impl fmt::Display for V2D {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:.5}, {:.5}]", self[0], self[1])
    }
}

/*
    | [u0, u1] |
    | [v0, v1] |
*/

#[derive(Clone, Copy, Debug, PartialEq)]
/// 2 by 2 Matrix stored by rows. Used for Jacobians and for maps between reference spaces
pub struct M2D {
    pub u: V2D,
    pub v: V2D,
}

impl M2D {
    pub const fn from(r0: [f64; 2], r1: [f64; 2]) -> Self {
        Self {
            u: V2D::from(r0),
            v: V2D::from(r1),
        }
    }

    pub const fn identity() -> Self {
        Self::from([1.0, 0.0], [0.0, 1.0])
    }

    pub const fn diag(d0: f64, d1: f64) -> Self {
        Self::from([d0, 0.0], [0.0, d1])
    }

    /// Build a matrix from its two columns
    pub fn from_cols(c0: V2D, c1: V2D) -> Self {
        Self::from([c0[0], c1[0]], [c0[1], c1[1]])
    }

    #[inline]
    pub fn det(&self) -> f64 {
        self.u[0] * self.v[1] - self.u[1] * self.v[0]
    }

    pub fn inverse(&self) -> Self {
        Self {
            u: V2D::from([self.v[1], -self.u[1]]),
            v: V2D::from([-self.v[0], self.u[0]]),
        } / self.det()
    }

    pub fn transpose(&self) -> Self {
        Self {
            u: V2D::from([self.u[0], self.v[0]]),
            v: V2D::from([self.u[1], self.v[1]]),
        }
    }

    fn col(&self, c: usize) -> V2D {
        V2D::from([self.u[c], self.v[c]])
    }
}

impl Div<f64> for M2D {
    type Output = Self;
    fn div(self, divisor: f64) -> Self {
        Self {
            u: self.u / divisor,
            v: self.v / divisor,
        }
    }
}

impl Mul<Self> for M2D {
    type Output = Self;
    fn mul(self, other: Self) -> Self {
        let [c0, c1] = [other.col(0), other.col(1)];
        Self {
            u: V2D::from([self.u.dot_with(&c0), self.u.dot_with(&c1)]),
            v: V2D::from([self.v.dot_with(&c0), self.v.dot_with(&c1)]),
        }
    }
}

impl Mul<V2D> for M2D {
    type Output = V2D;
    fn mul(self, v: V2D) -> V2D {
        V2D::from([self.u.dot_with(&v), self.v.dot_with(&v)])
    }
}

impl fmt::Display for M2D {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "u: [{:.5}, {:.5}]  v: [{:.5}, {:.5}]",
            self.u[0], self.u[1], self.v[0], self.v[1]
        )
    }
}

/// Affine map `x -> a * x + b` between two reference spaces.
///
/// Every `Elem` carries one of these, taking its own reference coordinates into the
/// reference coordinates of its base (root) element.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineMap {
    pub a: M2D,
    pub b: V2D,
}

impl AffineMap {
    pub const fn identity() -> Self {
        Self {
            a: M2D::identity(),
            b: V2D::zero(),
        }
    }

    pub const fn new(a: M2D, b: V2D) -> Self {
        Self { a, b }
    }

    /// Affine map taking the reference triangle's vertices `(-1,-1), (1,-1), (-1,1)` to the three given points
    pub fn from_triangle_images([x0, x1, x2]: [V2D; 3]) -> Self {
        let c0 = (x1 - x0) / 2.0;
        let c1 = (x2 - x0) / 2.0;
        Self {
            a: M2D::from_cols(c0, c1),
            b: x0 + c0 + c1,
        }
    }

    pub fn apply(&self, x: V2D) -> V2D {
        self.a * x + self.b
    }

    pub fn inverse_apply(&self, y: V2D) -> V2D {
        self.a.inverse() * (y - self.b)
    }

    /// `self ∘ inner`: apply `inner` first, then `self`
    pub fn compose(&self, inner: &Self) -> Self {
        Self {
            a: self.a * inner.a,
            b: self.a * inner.b + self.b,
        }
    }

    pub fn inverse(&self) -> Self {
        let a_inv = self.a.inverse();
        Self {
            a: a_inv,
            b: -(a_inv * self.b),
        }
    }

    pub fn approx_eq(&self, other: &Self) -> bool {
        const TOL: f64 = 1e-12;
        (self.a.u - other.a.u).norm() < TOL
            && (self.a.v - other.a.v).norm() < TOL
            && (self.b - other.b).norm() < TOL
    }
}

const POINT_UNIQUENESS_ACCURACY: f64 = 1e-12;

#[derive(Clone, Copy, Debug)]
/// Point in Real (physical) Space
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub const fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }

    pub fn between(a: &Self, b: &Self) -> Self {
        Self::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0)
    }

    pub fn dist(&self, other: &Self) -> f64 {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt()
    }

    pub fn as_v2d(&self) -> V2D {
        V2D::from([self.x, self.y])
    }
}

impl PartialEq for Point {
    fn eq(&self, other: &Self) -> bool {
        self.dist(other) < POINT_UNIQUENESS_ACCURACY
    }
}

impl From<V2D> for Point {
    fn from(v: V2D) -> Self {
        Self::new(v[0], v[1])
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.x, self.y)
    }
}

impl From<Point> for JsonValue {
    fn from(p: Point) -> Self {
        JsonValue::from(vec![p.x, p.y])
    }
}

impl From<AffineMap> for JsonValue {
    fn from(map: AffineMap) -> Self {
        JsonValue::from(vec![
            map.a.u[0], map.a.u[1], map.a.v[0], map.a.v[1], map.b[0], map.b[1],
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_product_and_inverse() {
        let a = M2D::from([1.0, 2.0], [3.0, 4.0]);
        let b = M2D::from([0.0, 1.0], [1.0, 0.0]);

        let ab = a * b;
        assert_eq!(ab, M2D::from([2.0, 1.0], [4.0, 3.0]));

        let id = a * a.inverse();
        assert!((id.u - V2D::from([1.0, 0.0])).norm() < 1e-14);
        assert!((id.v - V2D::from([0.0, 1.0])).norm() < 1e-14);
    }

    #[test]
    fn affine_composition() {
        let outer = AffineMap::new(M2D::diag(0.5, 0.5), V2D::from([0.5, -0.5]));
        let inner = AffineMap::new(M2D::diag(1.0, 0.5), V2D::from([0.0, 0.5]));
        let composed = outer.compose(&inner);

        let x = V2D::from([0.3, -0.7]);
        let expected = outer.apply(inner.apply(x));
        assert!((composed.apply(x) - expected).norm() < 1e-14);
        assert!((composed.inverse_apply(expected) - x).norm() < 1e-14);
        assert!(composed.inverse().compose(&composed).approx_eq(&AffineMap::identity()));
    }

    #[test]
    fn triangle_images() {
        let map = AffineMap::from_triangle_images([
            V2D::from([-1.0, 1.0]),
            V2D::from([-1.0, -1.0]),
            V2D::from([0.0, -1.0]),
        ]);

        assert!((map.apply(V2D::from([-1.0, -1.0])) - V2D::from([-1.0, 1.0])).norm() < 1e-14);
        assert!((map.apply(V2D::from([1.0, -1.0])) - V2D::from([-1.0, -1.0])).norm() < 1e-14);
        assert!((map.apply(V2D::from([-1.0, 1.0])) - V2D::from([0.0, -1.0])).norm() < 1e-14);
    }
}
