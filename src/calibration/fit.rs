use anyhow::{bail, Result};

use super::{CalibrationResult, CalibrationSample};
use crate::config::CalibrationConfig;

/// Least-squares fit of the per-axis affine transform over all collected
/// samples, minimizing screen-space reconstruction error.
///
/// Each raw point contributes one row `(1, raw_x, raw_y)` per axis; the
/// 3x3 normal equations are solved directly. Quality is
/// `1 / (1 + mean_error / tolerance)`, so zero residual scores 1.0 and
/// the score decays monotonically as the residual grows.
pub fn fit_transform(
    samples: &[CalibrationSample],
    config: &CalibrationConfig,
) -> Result<CalibrationResult> {
    let rows: Vec<([f64; 3], f64, f64)> = samples
        .iter()
        .flat_map(|sample| {
            sample.points.iter().map(move |&(rx, ry)| {
                (
                    [1.0, rx as f64, ry as f64],
                    sample.target.x as f64,
                    sample.target.y as f64,
                )
            })
        })
        .collect();

    if rows.len() < 3 {
        bail!("not enough calibration points to fit ({} < 3)", rows.len());
    }

    let x_coeffs = solve_normal_equations(&rows, |row| row.1)?;
    let y_coeffs = solve_normal_equations(&rows, |row| row.2)?;

    // Residuals against the targets the user was fixating.
    let mut total_error = 0.0f64;
    let mut max_error = 0.0f64;
    for (basis, tx, ty) in &rows {
        let px = x_coeffs[0] + x_coeffs[1] * basis[1] + x_coeffs[2] * basis[2];
        let py = y_coeffs[0] + y_coeffs[1] * basis[1] + y_coeffs[2] * basis[2];
        let err = ((px - tx).powi(2) + (py - ty).powi(2)).sqrt();
        total_error += err;
        max_error = max_error.max(err);
    }
    let mean_error = total_error / rows.len() as f64;
    let quality = 1.0 / (1.0 + mean_error / config.quality_tolerance_px as f64);

    Ok(CalibrationResult {
        x_coeffs: [x_coeffs[0] as f32, x_coeffs[1] as f32, x_coeffs[2] as f32],
        y_coeffs: [y_coeffs[0] as f32, y_coeffs[1] as f32, y_coeffs[2] as f32],
        mean_error_px: mean_error as f32,
        max_error_px: max_error as f32,
        quality: quality as f32,
    })
}

/// Solve `(A^T A) c = A^T b` for one axis by Gaussian elimination with
/// partial pivoting.
fn solve_normal_equations(
    rows: &[([f64; 3], f64, f64)],
    rhs: impl Fn(&([f64; 3], f64, f64)) -> f64,
) -> Result<[f64; 3]> {
    let mut ata = [[0.0f64; 3]; 3];
    let mut atb = [0.0f64; 3];
    for row in rows {
        let basis = &row.0;
        let b = rhs(row);
        for i in 0..3 {
            for j in 0..3 {
                ata[i][j] += basis[i] * basis[j];
            }
            atb[i] += basis[i] * b;
        }
    }

    // Augment and eliminate.
    let mut m = [[0.0f64; 4]; 3];
    for i in 0..3 {
        m[i][..3].copy_from_slice(&ata[i]);
        m[i][3] = atb[i];
    }

    for col in 0..3 {
        let mut pivot_row = col;
        for row in col + 1..3 {
            if m[row][col].abs() > m[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        if m[pivot_row][col].abs() < 1e-12 {
            bail!("degenerate calibration geometry (singular normal equations)");
        }
        m.swap(col, pivot_row);
        for row in 0..3 {
            if row == col {
                continue;
            }
            let factor = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    Ok([m[0][3] / m[0][0], m[1][3] / m[1][1], m[2][3] / m[2][2]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationTarget;

    fn sample(index: usize, x: f32, y: f32, points: Vec<(f32, f32)>) -> CalibrationSample {
        CalibrationSample {
            target: CalibrationTarget { index, x, y },
            points,
        }
    }

    /// Targets on a known affine map: raw = (screen_x / 1000 - 0.5, screen_y / 1000 - 0.5).
    fn perfect_samples() -> Vec<CalibrationSample> {
        [
            (100.0, 100.0),
            (900.0, 100.0),
            (500.0, 500.0),
            (100.0, 900.0),
            (900.0, 900.0),
        ]
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| {
            let raw = (x / 1000.0 - 0.5, y / 1000.0 - 0.5);
            sample(i, x, y, vec![raw; 4])
        })
        .collect()
    }

    #[test]
    fn perfect_samples_fit_with_full_quality() {
        let result = fit_transform(&perfect_samples(), &CalibrationConfig::default()).unwrap();
        assert!(result.mean_error_px < 1e-3, "residual {}", result.mean_error_px);
        assert!(result.quality > 0.999);

        // The fitted transform reproduces the screen points.
        let (x, y) = result.apply(-0.4, -0.4);
        assert!((x - 100.0).abs() < 1e-2);
        assert!((y - 100.0).abs() < 1e-2);
    }

    #[test]
    fn quality_decreases_with_residual() {
        let clean = fit_transform(&perfect_samples(), &CalibrationConfig::default()).unwrap();

        let mut noisy_samples = perfect_samples();
        for (i, sample) in noisy_samples.iter_mut().enumerate() {
            for (j, point) in sample.points.iter_mut().enumerate() {
                let sign = if (i + j) % 2 == 0 { 1.0 } else { -1.0 };
                point.0 += 0.05 * sign;
                point.1 -= 0.05 * sign;
            }
        }
        let noisy = fit_transform(&noisy_samples, &CalibrationConfig::default()).unwrap();

        assert!(noisy.mean_error_px > clean.mean_error_px);
        assert!(noisy.quality < clean.quality);
        assert!(noisy.quality > 0.0);
    }

    #[test]
    fn too_few_points_is_an_error() {
        let samples = vec![sample(0, 500.0, 500.0, vec![(0.0, 0.0)])];
        assert!(fit_transform(&samples, &CalibrationConfig::default()).is_err());
    }

    #[test]
    fn collinear_targets_are_degenerate() {
        // All points identical: the normal matrix is singular.
        let samples = vec![
            sample(0, 100.0, 100.0, vec![(0.1, 0.1); 5]),
            sample(1, 900.0, 900.0, vec![(0.1, 0.1); 5]),
        ];
        assert!(fit_transform(&samples, &CalibrationConfig::default()).is_err());
    }
}
