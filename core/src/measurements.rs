//! Measurement models for the localization filter.
//!
//! This module defines the generic measurement model trait and the four sensor
//! variants fused by the particle filter: IMU heading (yaw), world-frame
//! accelerometer, camera pose, and beacon position. Each variant is a plain
//! value type that owns its observation matrix and noise covariance; the
//! filter holds one instance per sensor and fills in the observed values as
//! readings arrive.
//!
//! All models are linear selections of state components, so the expected
//! measurement is simply `H * x`. Angular components wrap their innovation to
//! $(-\pi, \pi]$ before the likelihood is evaluated.

use std::fmt::{self, Display};

use nalgebra::{DMatrix, DVector};

use crate::{STATE_SIZE, wrap_angle};

/// Heading observation variance in rad^2, derived empirically for the IMU's
/// fused heading output.
pub const YAW_VARIANCE: f64 = 5.163132e-7;
/// World-frame accelerometer variance in (m/s^2)^2, per axis.
pub const ACCELEROMETER_VARIANCE: f64 = 1e-9;
/// Camera pose variance, per axis (m^2 for position, rad^2 for heading).
pub const CAMERA_VARIANCE: f64 = 1e-4;
/// Beacon position variance in m^2, per axis.
pub const BEACON_VARIANCE: f64 = 1e-4;

/// Generic measurement model trait for all sensor variants.
///
/// A model scores how well a candidate state explains an observed value. The
/// observation matrix, noise covariance, and innovation convention are owned
/// by the variant; the filter only needs this interface to run a correction.
pub trait MeasurementModel {
    /// Get the dimension of the measurement vector
    fn get_dimension(&self) -> usize;
    /// Get the observed value in vector format
    fn get_vector(&self) -> DVector<f64>;
    /// Get the measurement noise covariance in matrix format
    fn get_noise(&self) -> DMatrix<f64>;
    /// Get the linear observation matrix H mapping state space to measurement space
    fn get_observation_matrix(&self) -> DMatrix<f64>;
    /// Get the expected measurement for a state: `H * x`
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        self.get_observation_matrix() * state
    }
    /// Measurement residual for a state: observed minus expected.
    ///
    /// Variants with angular components override this to wrap those rows.
    fn innovation(&self, state: &DVector<f64>) -> DVector<f64> {
        self.get_vector() - self.get_expected_measurement(state)
    }
}

/// Build a selection matrix with one row per selected state index.
fn selection_matrix(indices: &[usize]) -> DMatrix<f64> {
    let mut h = DMatrix::<f64>::zeros(indices.len(), STATE_SIZE);
    for (row, &index) in indices.iter().enumerate() {
        h[(row, index)] = 1.0;
    }
    h
}

/// IMU heading measurement model
///
/// One-dimensional observation of the heading component. The heading comes
/// from the motor controller's IMU, already fused and gravity-referenced.
#[derive(Clone, Debug)]
pub struct YawMeasurement {
    /// Observed heading in radians
    pub yaw: f64,
    /// Observation variance in rad^2
    pub variance: f64,
}

impl Default for YawMeasurement {
    fn default() -> Self {
        YawMeasurement {
            yaw: 0.0,
            variance: YAW_VARIANCE,
        }
    }
}

impl Display for YawMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "YawMeasurement(yaw: {:.4} rad, variance: {:.3e})",
            self.yaw, self.variance
        )
    }
}

impl MeasurementModel for YawMeasurement {
    fn get_dimension(&self) -> usize {
        1
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.yaw])
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![self.variance]))
    }
    fn get_observation_matrix(&self) -> DMatrix<f64> {
        selection_matrix(&[2])
    }
    fn innovation(&self, state: &DVector<f64>) -> DVector<f64> {
        let expected = self.get_expected_measurement(state);
        DVector::from_vec(vec![wrap_angle(self.yaw - expected[0])])
    }
}

/// World-frame accelerometer measurement model
///
/// Two-dimensional observation of the world-frame acceleration components.
/// The rotation from the body frame into the world frame happens upstream on
/// the motor controller, which knows the fused orientation.
#[derive(Clone, Debug)]
pub struct AccelerometerMeasurement {
    /// Observed world-frame acceleration x in m/s^2
    pub ax: f64,
    /// Observed world-frame acceleration y in m/s^2
    pub ay: f64,
    /// Observation variance per axis in (m/s^2)^2
    pub variance: f64,
}

impl Default for AccelerometerMeasurement {
    fn default() -> Self {
        AccelerometerMeasurement {
            ax: 0.0,
            ay: 0.0,
            variance: ACCELEROMETER_VARIANCE,
        }
    }
}

impl Display for AccelerometerMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AccelerometerMeasurement(ax: {:.4}, ay: {:.4} m/s^2, variance: {:.3e})",
            self.ax, self.ay, self.variance
        )
    }
}

impl MeasurementModel for AccelerometerMeasurement {
    fn get_dimension(&self) -> usize {
        2
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.ax, self.ay])
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![self.variance, self.variance]))
    }
    fn get_observation_matrix(&self) -> DMatrix<f64> {
        selection_matrix(&[6, 7])
    }
}

/// Camera pose measurement model
///
/// Three-dimensional observation of position and heading produced by the
/// companion node's marker tracking. Position rows are meters, the heading
/// row is radians and wraps its innovation.
#[derive(Clone, Debug)]
pub struct CameraPoseMeasurement {
    /// Observed world-frame position x in meters
    pub x: f64,
    /// Observed world-frame position y in meters
    pub y: f64,
    /// Observed heading in radians
    pub yaw: f64,
    /// Observation variance per axis
    pub variance: f64,
}

impl Default for CameraPoseMeasurement {
    fn default() -> Self {
        CameraPoseMeasurement {
            x: 0.0,
            y: 0.0,
            yaw: 0.0,
            variance: CAMERA_VARIANCE,
        }
    }
}

impl Display for CameraPoseMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CameraPoseMeasurement(x: {:.3}, y: {:.3} m, yaw: {:.4} rad, variance: {:.3e})",
            self.x, self.y, self.yaw, self.variance
        )
    }
}

impl MeasurementModel for CameraPoseMeasurement {
    fn get_dimension(&self) -> usize {
        3
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.x, self.y, self.yaw])
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.variance,
            self.variance,
            self.variance,
        ]))
    }
    fn get_observation_matrix(&self) -> DMatrix<f64> {
        selection_matrix(&[0, 1, 2])
    }
    fn innovation(&self, state: &DVector<f64>) -> DVector<f64> {
        let expected = self.get_expected_measurement(state);
        DVector::from_vec(vec![
            self.x - expected[0],
            self.y - expected[1],
            wrap_angle(self.yaw - expected[2]),
        ])
    }
}

/// Beacon position measurement model
///
/// Two-dimensional observation of the world-frame position from the beacon
/// triangulation system. No heading information.
#[derive(Clone, Debug)]
pub struct BeaconPositionMeasurement {
    /// Observed world-frame position x in meters
    pub x: f64,
    /// Observed world-frame position y in meters
    pub y: f64,
    /// Observation variance per axis in m^2
    pub variance: f64,
}

impl Default for BeaconPositionMeasurement {
    fn default() -> Self {
        BeaconPositionMeasurement {
            x: 0.0,
            y: 0.0,
            variance: BEACON_VARIANCE,
        }
    }
}

impl Display for BeaconPositionMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BeaconPositionMeasurement(x: {:.3}, y: {:.3} m, variance: {:.3e})",
            self.x, self.y, self.variance
        )
    }
}

impl MeasurementModel for BeaconPositionMeasurement {
    fn get_dimension(&self) -> usize {
        2
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.x, self.y])
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![self.variance, self.variance]))
    }
    fn get_observation_matrix(&self) -> DMatrix<f64> {
        selection_matrix(&[0, 1])
    }
}
