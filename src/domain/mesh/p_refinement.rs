use super::MAX_POLYNOMIAL_ORDER;
use json::{object, JsonValue};
use thiserror::Error;

/// Polynomial orders of an `Elem` in its two reference directions.
///
/// Triangles (and isotropic quads) use `ni == nj`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PolyOrders {
    /// u-directed polynomial order
    pub ni: u8,
    /// v-directed polynomial order
    pub nj: u8,
}

impl PolyOrders {
    pub const fn from(i: u8, j: u8) -> Self {
        Self { ni: i, nj: j }
    }

    pub const fn iso(p: u8) -> Self {
        Self { ni: p, nj: p }
    }

    pub fn is_isotropic(&self) -> bool {
        self.ni == self.nj
    }

    pub fn max(&self) -> u8 {
        std::cmp::max(self.ni, self.nj)
    }

    /// Update the u- and v-directed orders according to a [PRef]
    pub fn refine(&mut self, refinement: PRef) -> Result<(), PRefError> {
        let ni = refinement.refine_i(self.ni)?;
        let nj = refinement.refine_j(self.nj)?;
        self.ni = ni;
        self.nj = nj;

        Ok(())
    }

    /// Orders after a [PRef], leaving `self` untouched
    pub fn refined(&self, refinement: PRef) -> Result<Self, PRefError> {
        let mut orders = *self;
        orders.refine(refinement)?;
        Ok(orders)
    }

    pub fn set(&mut self, [ni, nj]: [u8; 2]) -> Result<(), PRefError> {
        if ni > MAX_POLYNOMIAL_ORDER || nj > MAX_POLYNOMIAL_ORDER {
            return Err(PRefError::ExceededMaxExpansion);
        }

        self.ni = ni;
        self.nj = nj;

        Ok(())
    }

    /// Raise both orders by `delta`, saturating at [MAX_POLYNOMIAL_ORDER]
    pub fn saturating_increase(&self, delta: u8) -> Self {
        Self {
            ni: self.ni.saturating_add(delta).min(MAX_POLYNOMIAL_ORDER),
            nj: self.nj.saturating_add(delta).min(MAX_POLYNOMIAL_ORDER),
        }
    }

    pub fn max_with(&self, orders: [u8; 2]) -> [u8; 2] {
        [
            std::cmp::max(self.ni, orders[0]),
            std::cmp::max(self.nj, orders[1]),
        ]
    }
}

impl Default for PolyOrders {
    fn default() -> Self {
        Self { ni: 1, nj: 1 }
    }
}

impl std::fmt::Display for PolyOrders {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_isotropic() {
            write!(f, "{}", self.ni)
        } else {
            write!(f, "({}, {})", self.ni, self.nj)
        }
    }
}

impl From<PolyOrders> for JsonValue {
    fn from(orders: PolyOrders) -> Self {
        object! {
            "u": orders.ni,
            "v": orders.nj,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PRefInt {
    Increment(u8),
    Decrement(u8),
    None,
}

impl PRefInt {
    const fn from(d: i8) -> Self {
        match d {
            0 => Self::None,
            d if d > 0 => Self::Increment(d as u8),
            d => Self::Decrement(d.unsigned_abs()),
        }
    }

    fn refine(&self, n: u8) -> Result<u8, PRefError> {
        match self {
            Self::Increment(delta) => {
                if n as usize + *delta as usize > MAX_POLYNOMIAL_ORDER as usize {
                    Err(PRefError::ExceededMaxExpansion)
                } else {
                    Ok(n + *delta)
                }
            }
            Self::Decrement(delta) => {
                if *delta >= n {
                    Err(PRefError::NegExpansion)
                } else {
                    Ok(n - *delta)
                }
            }
            Self::None => Ok(n),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Description of a p-Refinement
pub struct PRef {
    di: PRefInt,
    dj: PRefInt,
}

impl PRef {
    pub const fn from(i: i8, j: i8) -> Self {
        Self {
            di: PRefInt::from(i),
            dj: PRefInt::from(j),
        }
    }

    pub const fn iso(d: i8) -> Self {
        Self::from(d, d)
    }

    fn refine_i(&self, i_current: u8) -> Result<u8, PRefError> {
        self.di.refine(i_current)
    }

    fn refine_j(&self, j_current: u8) -> Result<u8, PRefError> {
        self.dj.refine(j_current)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PRefError {
    #[error("Negative p-Refinement will result in 0 or negative expansion; Cannot p-Refine!")]
    NegExpansion,
    #[error("Positive p-Refinement will result in expansion order over maximum; Cannot p-Refine!")]
    ExceededMaxExpansion,
    #[error("Elem {0} does not exist; Cannot apply p-Refinement!")]
    ElemDoesntExist(usize),
    #[error("Elem {0} is not active; Cannot apply p-Refinement!")]
    ElemNotActive(usize),
    #[error("Elem {0} is a triangle; Cannot assign anisotropic orders!")]
    AnisoOnTriangle(usize),
    #[error("Order {0} is below the minimum order of this space; Cannot p-Refine!")]
    BelowMinimum(u8),
}
