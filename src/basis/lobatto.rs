/// Legendre polynomials `P_0 ..= P_n` and their first two derivatives at a point
#[derive(Clone, Debug)]
pub struct LegendreTable {
    pub p: Vec<f64>,
    pub dp: Vec<f64>,
    pub d2p: Vec<f64>,
}

impl LegendreTable {
    pub fn new(n: usize, x: f64) -> Self {
        let len = n.max(1) + 1;
        let mut p = vec![0.0; len];
        let mut dp = vec![0.0; len];
        let mut d2p = vec![0.0; len];

        p[0] = 1.0;
        p[1] = x;
        dp[1] = 1.0;

        for k in 1..len - 1 {
            let kf = k as f64;
            p[k + 1] = ((2.0 * kf + 1.0) * x * p[k] - kf * p[k - 1]) / (kf + 1.0);
            dp[k + 1] = dp[k - 1] + (2.0 * kf + 1.0) * p[k];
            d2p[k + 1] = d2p[k - 1] + (2.0 * kf + 1.0) * dp[k];
        }

        Self { p, dp, d2p }
    }
}

/// Lobatto shape functions `l_0 ..= l_n` (with first and second derivatives) at a point
///
/// * `l_0 = (1 - x) / 2`, `l_1 = (1 + x) / 2`
/// * `l_k = (P_k - P_{k-2}) / sqrt(2(2k - 1))` for `k >= 2`; these vanish at `x = ±1` and their derivatives are
///   orthonormal over `[-1, 1]`
#[derive(Clone, Debug)]
pub struct LobattoTable {
    pub values: Vec<f64>,
    pub derivs: Vec<f64>,
    pub second_derivs: Vec<f64>,
}

impl LobattoTable {
    pub fn new(n: usize, x: f64) -> Self {
        let legendre = LegendreTable::new(n, x);
        let len = n.max(1) + 1;

        let mut values = vec![(1.0 - x) / 2.0, (1.0 + x) / 2.0];
        let mut derivs = vec![-0.5, 0.5];
        let mut second_derivs = vec![0.0, 0.0];

        for k in 2..len {
            let kf = k as f64;
            let scale = ((2.0 * kf - 1.0) / 2.0).sqrt();
            values.push((legendre.p[k] - legendre.p[k - 2]) / (2.0 * (2.0 * kf - 1.0)).sqrt());
            derivs.push(scale * legendre.p[k - 1]);
            second_derivs.push(scale * legendre.dp[k - 1]);
        }

        Self {
            values,
            derivs,
            second_derivs,
        }
    }
}

/// Value of the Lobatto function `l_k` at `x`
pub fn lobatto(k: usize, x: f64) -> f64 {
    LobattoTable::new(k, x).values[k]
}

/// Derivative of the Lobatto function `l_k` at `x`
pub fn lobatto_deriv(k: usize, x: f64) -> f64 {
    LobattoTable::new(k, x).derivs[k]
}

/// Lobatto kernel `phi_k` (`k >= 2`) satisfying `l_k(x) = l_0(x) l_1(x) phi_k(x)`, and its derivative.
///
/// Requires a Legendre table of order at least `k - 1`.
pub fn kernel(k: usize, legendre: &LegendreTable) -> (f64, f64) {
    let kf = k as f64;
    let c = -2.0 * 2.0_f64.sqrt() * (2.0 * kf - 1.0).sqrt() / (kf * (kf - 1.0));
    (c * legendre.dp[k - 1], c * legendre.d2p[k - 1])
}
