// THEORY:
// Per-frame speed is a finite difference of detected keypoints, so it carries
// the detector's jitter twice. The `smoothing` module applies a
// Savitzky-Golay filter: every sample is replaced by the value, at that
// sample, of the least-squares polynomial fitted to the window around it.
//
// Key architectural principles:
// 1.  **One Projection Matrix**: For a fixed window and order the fit is linear
//     in the samples. `V (VᵀV)⁻¹ Vᵀ` maps a window of samples to the fitted
//     values at every position of that window, so it is computed once.
// 2.  **Edges Interpolate**: The first and last half-windows are read off the
//     polynomial fitted to the first and last full window instead of padding.
// 3.  **Short Series Shrink the Window**: A series shorter than the window uses
//     the largest odd window it can hold. If that window cannot support the
//     polynomial order, the series is returned unchanged.

use crate::error::{FieldError, Result};
use nalgebra::DMatrix;

pub const DEFAULT_SPEED_WINDOW: usize = 91;
pub const DEFAULT_SPEED_ORDER: usize = 4;

/// Rejects a window that is even or too small for the polynomial order.
pub fn check_params(window: usize, order: usize) -> Result<()> {
    if window % 2 == 0 || window <= order {
        return Err(FieldError::Config(format!(
            "smoothing window must be odd and larger than the order, got window {window} order {order}"
        )));
    }
    Ok(())
}

/// Savitzky-Golay smoothing of `series` with polynomial `order` over `window` samples.
pub fn savitzky_golay(series: &[f64], window: usize, order: usize) -> Result<Vec<f64>> {
    check_params(window, order)?;

    let n = series.len();
    let window = if n >= window {
        window
    } else if n % 2 == 1 {
        n
    } else {
        n.saturating_sub(1)
    };
    if window <= order {
        return Ok(series.to_vec());
    }

    let projection = projection_matrix(window, order)?;
    let half = window / 2;
    let last_start = n - window;

    Ok((0..n)
        .map(|i| {
            let (start, row) = if i < half {
                (0, i)
            } else if i >= n - half {
                (last_start, i - last_start)
            } else {
                (i - half, half)
            };
            (0..window).map(|j| projection[(row, j)] * series[start + j]).sum()
        })
        .collect())
}

/// Hat matrix of the polynomial fit over one window. Positions are scaled to
/// [-1, 1] to keep the normal equations well conditioned.
fn projection_matrix(window: usize, order: usize) -> Result<DMatrix<f64>> {
    let half = (window / 2) as f64;
    let vandermonde = DMatrix::from_fn(window, order + 1, |i, power| {
        ((i as f64 - half) / half).powi(power as i32)
    });
    let normal = vandermonde.transpose() * &vandermonde;
    let inverse = normal
        .try_inverse()
        .ok_or_else(|| FieldError::Config(format!("cannot fit order {order} over {window} samples")))?;
    Ok(&vandermonde * inverse * vandermonde.transpose())
}
