use nalgebra::{DMatrix, SymmetricEigen};
use std::cmp::Ordering;

/// Get a set of n Gauss-Legendre-Quadrature Integration points and weights over `(-1, 1)`
///
/// ```
/// use hp_fem_2d::integration::glq::*;
///
/// let (points, weights) = gauss_quadrature_points(10);
/// assert_eq!(points.len(), 10);
/// assert!(points.iter().sum::<f64>().abs() < 1e-12);
/// assert!((weights.iter().sum::<f64>() - 2.0).abs() < 1e-12);
/// ```
// https://en.wikipedia.org/wiki/Gaussian_quadrature#Gauss%E2%80%93Legendre_quadrature
pub fn gauss_quadrature_points(n: usize) -> (Vec<f64>, Vec<f64>) {
    if n == 0 {
        return (Vec::new(), Vec::new());
    }

    let betas: Vec<f64> = (1..n)
        .map(|i| 0.5 / (1.0 - (2.0 * i as f64).powi(-2)).sqrt())
        .collect();

    let polymat: DMatrix<f64> = DMatrix::from_fn(n, n, |r, c| {
        if r == c + 1 {
            betas[r - 1]
        } else if c == r + 1 {
            betas[c - 1]
        } else {
            0.0
        }
    });

    let eigen_decomp = SymmetricEigen::new(polymat);

    let mut xw: Vec<(f64, f64)> = eigen_decomp
        .eigenvalues
        .iter()
        .cloned()
        .zip(
            eigen_decomp
                .eigenvectors
                .row(0)
                .iter()
                .map(|weight| (*weight).powi(2) * 2.0),
        )
        .collect();

    xw.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    xw.into_iter().unzip()
}

/// Scale a set of Gauss-Legendre-Quadrature Integration points to fall within a specific range
///
/// ```
/// use hp_fem_2d::integration::glq::*;
/// let (points, _) = gauss_quadrature_points(10);
///
/// // scale the points to the range `(-0.75, 0.25)`
/// let (scale, points_scaled) = scale_gauss_quad_points(&points, -0.75, 0.25);
///
/// assert!(points_scaled.iter().all(|x| *x > -0.75 && *x < 0.25));
/// assert!((0.5 - scale).abs() < 1e-12);
/// ```
pub fn scale_gauss_quad_points(points: &[f64], min: f64, max: f64) -> (f64, Vec<f64>) {
    let scale_factor = (max - min) / 2.0;
    let offset = (max + min) / 2.0;

    (
        scale_factor,
        points
            .iter()
            .map(|x| x * scale_factor + offset)
            .collect::<Vec<f64>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const GLQ_ACCURACY: f64 = 1e-9;
    // test points
    const X_10: [f64; 10] = [
        -0.973906529,
        -0.865063367,
        -0.679409568,
        -0.433395394,
        -0.148874339,
        0.148874339,
        0.433395394,
        0.679409568,
        0.865063367,
        0.973906529,
    ];
    const W_10: [f64; 10] = [
        0.066671344,
        0.149451349,
        0.219086363,
        0.269266719,
        0.295524225,
        0.295524225,
        0.269266719,
        0.219086363,
        0.149451349,
        0.066671344,
    ];

    #[test]
    fn glq_point_generation_and_scaling() {
        let (glq_points, glq_weights) = gauss_quadrature_points(10);

        for (glq_ref, glq_test) in X_10.iter().zip(glq_points.iter()) {
            assert!((glq_ref - glq_test).abs() < GLQ_ACCURACY);
        }

        for (glq_w_ref, glq_w_test) in W_10.iter().zip(glq_weights.iter()) {
            assert!((glq_w_ref - glq_w_test).abs() < GLQ_ACCURACY);
        }

        let (glq_scale, glq_scaled_points) = scale_gauss_quad_points(&glq_points, 0.25, 0.5);

        assert!((glq_scale - 0.125).abs() < 1e-14);
        for (glq_ref, glq_s_test) in X_10.iter().zip(glq_scaled_points.iter()) {
            assert!((glq_ref * 0.125 + 0.375 - glq_s_test).abs() < GLQ_ACCURACY);
        }
    }

    #[test]
    fn polynomial_exactness() {
        // n points integrate polynomials up to degree 2n - 1 exactly
        for n in 1..8 {
            let (points, weights) = gauss_quadrature_points(n);
            let degree = 2 * n - 1;
            let integral: f64 = points
                .iter()
                .zip(weights.iter())
                .map(|(x, w)| x.powi(degree as i32 - 1) * w)
                .sum();
            let expected = if (degree - 1) % 2 == 0 {
                2.0 / degree as f64
            } else {
                0.0
            };
            assert!((integral - expected).abs() < 1e-12);
        }
    }
}
