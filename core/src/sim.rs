//! Simulation utilities and CSV trace output for the localization filter.
//!
//! This module provides:
//! - A struct (`EstimateRecord`) for recording one cycle of the companion
//!   node's estimate history to CSV
//! - A dead-reckoning reference integrator for generating ground truth from
//!   an encoder control sequence
//! - A canned drive profile used by the controller role of the binary and by
//!   the integration tests

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChassisGeometry, EncoderData, RobotState, forward};

/// One row of the companion node's estimate trace.
///
/// Fields mirror the state vector plus the bookkeeping a postmortem needs:
/// the encoder rates that drove the cycle, the effective sample size after
/// any correction, and the telemetry link's latency estimate.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EstimateRecord {
    /// Wall-clock timestamp of the cycle, RFC 3339
    pub time: String,
    /// World-frame position x in meters
    pub x: f64,
    /// World-frame position y in meters
    pub y: f64,
    /// Heading in radians
    pub yaw: f64,
    /// Body-frame forward velocity in m/s
    pub vx: f64,
    /// Body-frame lateral velocity in m/s
    pub vy: f64,
    /// Heading rate in rad/s
    pub yaw_rate: f64,
    /// Left wheel rate that drove this cycle in m/s
    pub left_rate: f64,
    /// Right wheel rate that drove this cycle in m/s
    pub right_rate: f64,
    /// Effective sample size of the population after this cycle
    pub effective_sample_size: f64,
    /// One-way telemetry latency estimate in seconds
    pub latency: f64,
}

impl EstimateRecord {
    /// Build a record from the current estimate and cycle bookkeeping.
    pub fn from_estimate(
        timestamp: DateTime<Utc>,
        estimate: &RobotState,
        control: &EncoderData,
        effective_sample_size: f64,
        latency: f64,
    ) -> EstimateRecord {
        EstimateRecord {
            time: timestamp.to_rfc3339(),
            x: estimate.x,
            y: estimate.y,
            yaw: estimate.yaw,
            vx: estimate.vx,
            vy: estimate.vy,
            yaw_rate: estimate.yaw_rate,
            left_rate: control.left_rate,
            right_rate: control.right_rate,
            effective_sample_size,
            latency,
        }
    }

    /// Reads a CSV file and returns a vector of `EstimateRecord` structs.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }

    /// Writes a vector of EstimateRecord structs to a CSV file.
    ///
    /// # Arguments
    /// * `records` - Vector of EstimateRecord structs to write
    /// * `path` - Path where the CSV file will be saved
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Integrate a control sequence through the noiseless motion model.
///
/// Produces the ground-truth trajectory a drive profile implies, one state
/// per control step, starting from (and not including) `initial`. Used by the
/// integration tests to compare the filter's estimate against truth.
pub fn dead_reckon(
    initial: &RobotState,
    controls: &[(EncoderData, f64)],
    geometry: &ChassisGeometry,
) -> Vec<RobotState> {
    let mut state = *initial;
    let mut states = Vec::with_capacity(controls.len());
    for (control, dt) in controls {
        forward(&mut state, control, geometry, *dt);
        states.push(state);
    }
    states
}

/// Canned drive profile: ramp up, cruise straight, then arc.
///
/// Returns the encoder rates a well-behaved drive base would report at time
/// `t` seconds into the profile. Deterministic so the controller role and the
/// tests agree on the trajectory.
pub fn drive_profile(t: f64) -> EncoderData {
    if t < 2.0 {
        // Ramp both wheels from rest to 1 m/s
        let rate = 0.5 * t;
        EncoderData::new_from_rates(rate, rate)
    } else if t < 6.0 {
        EncoderData::new_from_rates(1.0, 1.0)
    } else if t < 10.0 {
        // Gentle left arc
        EncoderData::new_from_rates(0.8, 1.0)
    } else {
        EncoderData::new_from_rates(0.0, 0.0)
    }
}
