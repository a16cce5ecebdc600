// THEORY:
// The behavior classifier is run on every window independently, so its
// probabilities jitter from one frame to the next even when the animal keeps
// doing the same thing. The `kalman` module treats the true class
// probabilities as a slowly drifting hidden state and the classifier output as
// a noisy, slightly blurred measurement of it.
//
// Model, for K classes:
// 1.  **Transition**: identity. Behavior persists unless evidence says otherwise;
//     drift is absorbed by the process noise `q I`.
// 2.  **Observation**: `H = (1 - c) I + (c / K) 11ᵀ`. A fraction `c` of every
//     class's mass is smeared evenly over all classes, which is how a
//     classifier confuses neighbouring windows. Measurement noise is `r I`.
// 3.  **Gaps**: Rows without a measurement only run the predict step and stay
//     missing in the output; the filter state still carries across them.
// 4.  **Smoothing**: Optionally a Rauch-Tung-Striebel backward pass refines each
//     estimate with later measurements.
// Input values must be finite and within [0, 1]; one NaN would poison every
// later state. Every output row is clipped to [0, 1] and renormalized into a
// distribution.

use crate::error::{FieldError, Result};
use nalgebra::{DMatrix, DVector};
use tracing::warn;

/// Tunables of the probability filter.
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanConfig {
    /// Share of probability mass the observation smears over all classes.
    pub coupling: f64,
    pub process_noise: f64,
    pub measurement_noise: f64,
    /// Diagonal of the initial state covariance.
    pub initial_covariance: f64,
    /// Run the backward smoothing pass after filtering.
    pub smooth: bool,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            coupling: 0.1,
            process_noise: 1e-3,
            measurement_noise: 5e-2,
            initial_covariance: 1.0,
            smooth: false,
        }
    }
}

impl KalmanConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.coupling) {
            return Err(FieldError::Config(format!("coupling must be in [0, 1), got {}", self.coupling)));
        }
        if self.process_noise <= 0.0 || self.measurement_noise <= 0.0 || self.initial_covariance <= 0.0 {
            return Err(FieldError::Config("filter noise terms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Denoises a stream of probability rows. `None` rows are gaps.
pub fn denoise(rows: &[Option<Vec<f64>>], classes: usize, config: &KalmanConfig) -> Result<Vec<Option<Vec<f64>>>> {
    if let Some(bad) = rows.iter().flatten().find(|row| row.len() != classes) {
        return Err(FieldError::ClassCountMismatch {
            expected: classes,
            got: bad.len(),
        });
    }
    for row in rows.iter().flatten() {
        check_probabilities(row)?;
    }
    if classes == 0 || rows.iter().all(Option::is_none) {
        return Ok(vec![None; rows.len()]);
    }

    let filter = ProbabilityFilter::new(classes, config);
    let mut states = filter.forward(rows);
    if config.smooth {
        filter.smooth(&mut states);
    }

    Ok(rows
        .iter()
        .zip(states)
        .map(|(row, state)| row.as_ref().map(|_| normalize(state.mean.as_slice())))
        .collect())
}

/// Rejects a row holding anything other than finite values in [0, 1].
pub fn check_probabilities(row: &[f64]) -> Result<()> {
    match row.iter().position(|value| !(0.0..=1.0).contains(value)) {
        Some(class) => Err(FieldError::InvalidProbability {
            class,
            value: row[class],
        }),
        None => Ok(()),
    }
}

/// Clips to [0, 1] and rescales to sum 1; an all-zero row becomes uniform.
pub fn normalize(row: &[f64]) -> Vec<f64> {
    let clipped: Vec<f64> = row.iter().map(|v| v.clamp(0.0, 1.0)).collect();
    let total: f64 = clipped.iter().sum();
    if total <= 0.0 {
        return vec![1.0 / row.len() as f64; row.len()];
    }
    clipped.into_iter().map(|v| v / total).collect()
}

struct FilterState {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    /// Covariance after the predict step, before the update.
    predicted_covariance: DMatrix<f64>,
}

struct ProbabilityFilter {
    h: DMatrix<f64>,
    q: DMatrix<f64>,
    r: DMatrix<f64>,
    initial_mean: DVector<f64>,
    initial_covariance: DMatrix<f64>,
}

impl ProbabilityFilter {
    fn new(classes: usize, config: &KalmanConfig) -> Self {
        let k = classes as f64;
        let scaled_identity = |scale: f64| DMatrix::<f64>::identity(classes, classes) * scale;
        let h = scaled_identity(1.0 - config.coupling) + DMatrix::from_element(classes, classes, config.coupling / k);
        Self {
            h,
            q: scaled_identity(config.process_noise),
            r: scaled_identity(config.measurement_noise),
            initial_mean: DVector::from_element(classes, 1.0 / k),
            initial_covariance: scaled_identity(config.initial_covariance),
        }
    }

    fn forward(&self, rows: &[Option<Vec<f64>>]) -> Vec<FilterState> {
        let mut mean = self.initial_mean.clone();
        let mut covariance = self.initial_covariance.clone();
        let mut states = Vec::with_capacity(rows.len());

        for row in rows {
            // --- Predict (identity transition) ---
            covariance += &self.q;
            let predicted_covariance = covariance.clone();

            // --- Update ---
            if let Some(row) = row {
                let z = DVector::from_column_slice(row.as_slice());
                let innovation = z - &self.h * &mean;
                let s = &self.h * &covariance * self.h.transpose() + &self.r;
                match s.try_inverse() {
                    Some(s_inv) => {
                        let gain = &covariance * self.h.transpose() * s_inv;
                        mean += &gain * innovation;
                        let identity = DMatrix::<f64>::identity(mean.len(), mean.len());
                        covariance = (identity - &gain * &self.h) * &covariance;
                    }
                    None => warn!("singular innovation covariance, measurement skipped"),
                }
            }

            states.push(FilterState {
                mean: mean.clone(),
                covariance: covariance.clone(),
                predicted_covariance,
            });
        }
        states
    }

    /// Rauch-Tung-Striebel pass over filtered states, in place.
    fn smooth(&self, states: &mut [FilterState]) {
        for t in (0..states.len().saturating_sub(1)).rev() {
            let Some(predicted_inv) = states[t + 1].predicted_covariance.clone().try_inverse() else {
                continue;
            };
            let gain = &states[t].covariance * predicted_inv;
            // With an identity transition the prediction of t+1 is the filtered mean at t.
            let mean = &states[t].mean + &gain * (&states[t + 1].mean - &states[t].mean);
            let covariance = &states[t].covariance
                + &gain * (&states[t + 1].covariance - &states[t + 1].predicted_covariance) * gain.transpose();
            states[t].mean = mean;
            states[t].covariance = covariance;
        }
    }
}
