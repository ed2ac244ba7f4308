//! Wheeled-robot localization toolbox built around a particle filter and an
//! encoder telemetry link.
//!
//! This crate estimates the planar pose and velocity of a differential-drive
//! robot by fusing wheel-encoder odometry with heading, accelerometer, camera
//! pose, and beacon position observations. The encoder rates are produced on a
//! real-time motor controller and shipped to the companion compute node over a
//! small UDP transaction protocol ([`udp`]) whose dual timestamps also measure
//! one-way network latency. The companion node runs the filter ([`particle`])
//! and applies measurement corrections ([`measurements`]) as observations
//! arrive.
//!
//! The sensors themselves are external collaborators: this crate assumes yaw,
//! acceleration, camera pose, and beacon position arrive as already-parsed
//! numeric observations and does not contain camera calibration, marker-map
//! handling, or video capture.
//!
//! Primarily built off of two crate dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filter.
//! - [`rand`](https://crates.io/crates/rand) / [`rand_distr`](https://crates.io/crates/rand_distr): Provide the sampling machinery for the Monte-Carlo state representation.
//!
//! # State definition
//!
//! The nine-state planar vector is used everywhere in this crate. Every model
//! (motion and measurement) references components by this fixed ordering:
//!
//! $$
//! x = [p_x, p_y, \psi, v_x, v_y, \dot{\psi}, a_x, a_y, \ddot{\psi}]
//! $$
//!
//! Where:
//! - $p_x$, $p_y$ are the world-frame position in meters.
//! - $\psi$ is the heading in radians, wrapped to $(-\pi, \pi]$.
//! - $v_x$, $v_y$ are the body-frame forward and lateral velocities in m/s.
//! - $\dot{\psi}$ is the heading rate in rad/s.
//! - $a_x$, $a_y$ are the world-frame accelerations in m/s^2.
//! - $\ddot{\psi}$ is the heading acceleration in rad/s^2.
//!
//! # Motion model
//!
//! The control input is the pair of encoder-derived wheel surface speeds. For
//! a track width $W$ the differential-drive kinematics are:
//!
//! $$
//! v = \frac{u_l + u_r}{2} \qquad \omega = \frac{u_r - u_l}{W}
//! $$
//!
//! Position integrates the body velocity rotated through the midpoint heading
//! (second-order in the heading change over the step):
//!
//! $$
//! \psi_m = \psi + \tfrac{1}{2}\omega t \\\\
//! p_x(+) = p_x + (v_x \cos\psi_m - v_y \sin\psi_m)\\,t \\\\
//! p_y(+) = p_y + (v_x \sin\psi_m + v_y \cos\psi_m)\\,t
//! $$
//!
//! The forward velocity and heading rate snap to the encoder-implied values,
//! the lateral velocity persists as a slip state driven only by process noise,
//! and the acceleration states are refreshed from the finite difference of the
//! world-frame velocity across the step.

pub mod measurements;
pub mod particle;
pub mod sim;
pub mod telemetry;
pub mod udp;

use std::fmt::Display;

use nalgebra::DVector;

/// Number of components in the planar state vector.
pub const STATE_SIZE: usize = 9;

/// Wrap an angle to the interval $(-\pi, \pi]$.
///
/// Heading and heading-difference quantities are wrapped before use so that a
/// robot sitting at $\pi$ radians and an observation at $-\pi$ radians agree.
pub fn wrap_angle(angle: f64) -> f64 {
    let mut wrapped = angle % std::f64::consts::TAU;
    if wrapped > std::f64::consts::PI {
        wrapped -= std::f64::consts::TAU;
    } else if wrapped <= -std::f64::consts::PI {
        wrapped += std::f64::consts::TAU;
    }
    wrapped
}

/// Basic structure for holding one cycle of encoder telemetry as a control
/// input to the motion model.
///
/// Rates are wheel surface speeds in m/s, positive forward. The conversion
/// from raw encoder ticks is the motor controller's responsibility; by the
/// time a value reaches this crate it is a linear rate.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EncoderData {
    /// Left wheel surface speed in m/s
    pub left_rate: f64,
    /// Right wheel surface speed in m/s
    pub right_rate: f64,
}

impl Display for EncoderData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EncoderData {{ left: {:.3} m/s, right: {:.3} m/s }}",
            self.left_rate, self.right_rate
        )
    }
}

impl EncoderData {
    /// Create a new EncoderData instance with both rates zero
    pub fn new() -> EncoderData {
        EncoderData {
            left_rate: 0.0,
            right_rate: 0.0,
        }
    }

    /// Create a new EncoderData instance from left and right wheel rates in m/s
    pub fn new_from_rates(left_rate: f64, right_rate: f64) -> EncoderData {
        EncoderData {
            left_rate,
            right_rate,
        }
    }

    /// Body-frame forward speed implied by the two wheel rates, in m/s
    pub fn body_speed(&self) -> f64 {
        0.5 * (self.left_rate + self.right_rate)
    }

    /// Turn rate implied by the two wheel rates for the given track width, in rad/s
    pub fn turn_rate(&self, track_width: f64) -> f64 {
        (self.right_rate - self.left_rate) / track_width
    }

    /// True when both wheels report exactly zero rate.
    ///
    /// Used by callers as a stationarity hint for the zero-velocity update.
    pub fn is_stationary(&self) -> bool {
        self.left_rate == 0.0 && self.right_rate == 0.0
    }
}

/// Physical layout of the drive base needed by the kinematics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChassisGeometry {
    /// Lateral distance between the left and right wheel contact patches in meters
    pub track_width: f64,
}

impl Default for ChassisGeometry {
    fn default() -> Self {
        ChassisGeometry {
            track_width: DEFAULT_TRACK_WIDTH,
        }
    }
}

/// Track width of the reference drive base in meters.
pub const DEFAULT_TRACK_WIDTH: f64 = 0.55;

impl ChassisGeometry {
    /// Create a chassis description from a track width in meters.
    ///
    /// # Panics
    /// Panics if `track_width` is not strictly positive; the kinematics divide
    /// by it.
    pub fn new(track_width: f64) -> ChassisGeometry {
        assert!(track_width > 0.0, "Track width must be positive");
        ChassisGeometry { track_width }
    }
}

/// Planar robot state.
///
/// Component ordering and indices are fixed system-wide; see the crate-level
/// documentation. [`RobotState::to_vector`] and [`RobotState::from_vector`]
/// convert losslessly to and from the flat `DVector` representation used by
/// the measurement models.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RobotState {
    /// World-frame position x in meters
    pub x: f64,
    /// World-frame position y in meters
    pub y: f64,
    /// Heading in radians, wrapped to (-pi, pi]
    pub yaw: f64,
    /// Body-frame forward velocity in m/s
    pub vx: f64,
    /// Body-frame lateral velocity in m/s
    pub vy: f64,
    /// Heading rate in rad/s
    pub yaw_rate: f64,
    /// World-frame acceleration x in m/s^2
    pub ax: f64,
    /// World-frame acceleration y in m/s^2
    pub ay: f64,
    /// Heading acceleration in rad/s^2
    pub yaw_accel: f64,
}

impl Display for RobotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RobotState {{ pos: ({:.3}, {:.3}) m, yaw: {:.2} deg, vel: ({:.3}, {:.3}) m/s, yaw rate: {:.3} rad/s }}",
            self.x,
            self.y,
            self.yaw.to_degrees(),
            self.vx,
            self.vy,
            self.yaw_rate
        )
    }
}

impl RobotState {
    /// Create a new RobotState with all components zero
    pub fn new() -> RobotState {
        RobotState::default()
    }

    /// Flatten the state into a 9-element vector using the fixed index map
    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.x,
            self.y,
            self.yaw,
            self.vx,
            self.vy,
            self.yaw_rate,
            self.ax,
            self.ay,
            self.yaw_accel,
        ])
    }

    /// Rebuild a state from a 9-element vector using the fixed index map
    ///
    /// # Panics
    /// Panics if the vector is not exactly [`STATE_SIZE`] elements long.
    pub fn from_vector(state: &DVector<f64>) -> RobotState {
        assert_eq!(
            state.len(),
            STATE_SIZE,
            "State vector must be exactly {} elements long",
            STATE_SIZE
        );
        RobotState {
            x: state[0],
            y: state[1],
            yaw: state[2],
            vx: state[3],
            vy: state[4],
            yaw_rate: state[5],
            ax: state[6],
            ay: state[7],
            yaw_accel: state[8],
        }
    }

    /// World-frame velocity implied by the body-frame velocity and heading
    pub fn world_velocity(&self) -> (f64, f64) {
        let (sin, cos) = self.yaw.sin_cos();
        (
            cos * self.vx - sin * self.vy,
            sin * self.vx + cos * self.vy,
        )
    }

    /// Propagate the state through the differential-drive kinematics.
    ///
    /// This is the deterministic part of the motion model; the particle filter
    /// layers per-particle process noise on top. The forward velocity and
    /// heading rate snap to the encoder-implied values, the lateral velocity
    /// persists as a slip state, and the acceleration states are refreshed
    /// from the finite difference of the world-frame velocity over the step.
    ///
    /// # Arguments
    /// * `control` - Encoder rates for this cycle.
    /// * `geometry` - Drive base layout; supplies the track width.
    /// * `dt` - Time step in seconds, must be strictly positive.
    pub fn forward(&mut self, control: &EncoderData, geometry: &ChassisGeometry, dt: f64) {
        debug_assert!(dt > 0.0, "Time step must be positive");
        let speed = control.body_speed();
        let omega = control.turn_rate(geometry.track_width);

        // World-frame velocity entering the step, for the acceleration states
        let (wvx_0, wvy_0) = self.world_velocity();

        // Midpoint heading for the position integration
        let yaw_mid = self.yaw + 0.5 * omega * dt;
        let (sin_m, cos_m) = yaw_mid.sin_cos();
        self.x += (cos_m * self.vx - sin_m * self.vy) * dt;
        self.y += (sin_m * self.vx + cos_m * self.vy) * dt;
        self.yaw = wrap_angle(self.yaw + omega * dt);

        let previous_rate = self.yaw_rate;
        self.vx = speed;
        self.yaw_rate = omega;

        // World-frame velocity leaving the step
        let (wvx_1, wvy_1) = self.world_velocity();
        self.ax = (wvx_1 - wvx_0) / dt;
        self.ay = (wvy_1 - wvy_0) / dt;
        self.yaw_accel = (omega - previous_rate) / dt;
    }
}

/// Free-function form of [`RobotState::forward`] for callers that iterate
/// over particle populations.
pub fn forward(state: &mut RobotState, control: &EncoderData, geometry: &ChassisGeometry, dt: f64) {
    state.forward(control, geometry, dt);
}
