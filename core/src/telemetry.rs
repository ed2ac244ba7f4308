//! Encoder telemetry wire format and timestamp helpers.
//!
//! One telemetry exchange carries a single fixed-layout binary record: two
//! encoder rates and two timestamps, all little-endian IEEE-754 doubles, 32
//! bytes total. There is no framing, header, or version field, so both peers
//! must agree on the layout exactly; a datagram of any other size is the only
//! corruption signal available and is rejected by the transport.
//!
//! The two timestamps are distinct fields with distinct owners: the motor
//! controller stamps [`TelemetryPacket::controller_send_time`] immediately
//! before transmission and the companion node stamps
//! [`TelemetryPacket::companion_recv_time`] at receipt before echoing the
//! record back. Their difference estimates the one-way network delay, which
//! the companion uses to time-align measurement updates.

use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::EncoderData;

/// Well-known UDP port shared by the telemetry client and server roles.
pub const TELEMETRY_PORT: u16 = 6789;

/// Exact wire size of a telemetry record in bytes.
pub const PACKET_SIZE: usize = 32;

/// Single-byte control signal: begin the periodic telemetry exchange.
pub const START_SIGNAL: u8 = 0x01;
/// Single-byte control signal: end the periodic telemetry exchange.
pub const STOP_SIGNAL: u8 = 0x02;

/// Wall-clock time in seconds since the Unix epoch, with fractional part.
///
/// Both peers stamp packets with this clock. The protocol only ever compares
/// stamps across the two hosts, so it assumes they are roughly synchronized
/// (e.g. by NTP); within one host the stamps are self-consistent.
pub fn wall_clock_seconds() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        // Clock is set before 1970; negative offset keeps deltas meaningful
        Err(err) => -err.duration().as_secs_f64(),
    }
}

/// One cycle of encoder telemetry with dual timestamps.
///
/// Transient: created per transaction, filled by the controller, stamped by
/// the companion, and consumed by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    /// Left wheel surface speed in m/s
    pub left_encoder_rate: f64,
    /// Right wheel surface speed in m/s
    pub right_encoder_rate: f64,
    /// Controller wall clock at transmission, seconds since the Unix epoch
    pub controller_send_time: f64,
    /// Companion wall clock at receipt, seconds since the Unix epoch
    pub companion_recv_time: f64,
}

impl Display for TelemetryPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TelemetryPacket {{ left: {:.3} m/s, right: {:.3} m/s, sent: {:.6} s, received: {:.6} s }}",
            self.left_encoder_rate,
            self.right_encoder_rate,
            self.controller_send_time,
            self.companion_recv_time
        )
    }
}

impl From<&TelemetryPacket> for EncoderData {
    fn from(packet: &TelemetryPacket) -> Self {
        EncoderData {
            left_rate: packet.left_encoder_rate,
            right_rate: packet.right_encoder_rate,
        }
    }
}

fn read_f64(bytes: &[u8; PACKET_SIZE], offset: usize) -> f64 {
    let mut field = [0u8; 8];
    field.copy_from_slice(&bytes[offset..offset + 8]);
    f64::from_le_bytes(field)
}

impl TelemetryPacket {
    /// Create a packet carrying encoder rates with both timestamps unset.
    pub fn new(left_encoder_rate: f64, right_encoder_rate: f64) -> TelemetryPacket {
        TelemetryPacket {
            left_encoder_rate,
            right_encoder_rate,
            controller_send_time: 0.0,
            companion_recv_time: 0.0,
        }
    }

    /// Encode into the fixed 32-byte wire layout.
    ///
    /// Field order is left rate, right rate, send time, receive time, each a
    /// little-endian f64 at byte offsets 0, 8, 16, and 24.
    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut bytes = [0u8; PACKET_SIZE];
        bytes[0..8].copy_from_slice(&self.left_encoder_rate.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.right_encoder_rate.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.controller_send_time.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.companion_recv_time.to_le_bytes());
        bytes
    }

    /// Decode from the fixed 32-byte wire layout.
    pub fn from_bytes(bytes: &[u8; PACKET_SIZE]) -> TelemetryPacket {
        TelemetryPacket {
            left_encoder_rate: read_f64(bytes, 0),
            right_encoder_rate: read_f64(bytes, 8),
            controller_send_time: read_f64(bytes, 16),
            companion_recv_time: read_f64(bytes, 24),
        }
    }

    /// Stamp the controller send time with the local wall clock.
    pub fn stamp_send_time(&mut self) {
        self.controller_send_time = wall_clock_seconds();
    }

    /// Stamp the companion receive time with the local wall clock.
    pub fn stamp_recv_time(&mut self) {
        self.companion_recv_time = wall_clock_seconds();
    }

    /// Estimated one-way network delay: receive stamp minus send stamp.
    ///
    /// Meaningful only after both peers have stamped the packet. Clock skew
    /// between the hosts biases this directly.
    pub fn one_way_latency(&self) -> f64 {
        self.companion_recv_time - self.controller_send_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_wire_layout() {
        let packet = TelemetryPacket {
            left_encoder_rate: 1.25,
            right_encoder_rate: -0.75,
            controller_send_time: 1234.5,
            companion_recv_time: 1234.625,
        };
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), PACKET_SIZE);
        assert_eq!(bytes[0..8], 1.25f64.to_le_bytes());
        assert_eq!(bytes[8..16], (-0.75f64).to_le_bytes());
        assert_eq!(bytes[16..24], 1234.5f64.to_le_bytes());
        assert_eq!(bytes[24..32], 1234.625f64.to_le_bytes());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let packet = TelemetryPacket {
            left_encoder_rate: 0.333,
            right_encoder_rate: 2.5,
            controller_send_time: 1700000000.123456,
            companion_recv_time: 1700000000.125,
        };
        assert_eq!(TelemetryPacket::from_bytes(&packet.to_bytes()), packet);
    }

    #[test]
    fn test_new_leaves_timestamps_unset() {
        let packet = TelemetryPacket::new(1.0, 2.0);
        assert_eq!(packet.controller_send_time, 0.0);
        assert_eq!(packet.companion_recv_time, 0.0);
    }

    #[test]
    fn test_one_way_latency() {
        let mut packet = TelemetryPacket::new(0.0, 0.0);
        packet.controller_send_time = 100.0;
        packet.companion_recv_time = 100.025;
        assert_approx_eq!(packet.one_way_latency(), 0.025, 1e-12);
    }

    #[test]
    fn test_stamps_advance() {
        let mut packet = TelemetryPacket::new(0.0, 0.0);
        packet.stamp_send_time();
        let first = packet.controller_send_time;
        assert!(first > 0.0);
        packet.stamp_recv_time();
        assert!(packet.companion_recv_time >= first);
    }

    #[test]
    fn test_encoder_data_conversion() {
        let packet = TelemetryPacket::new(0.4, 0.6);
        let control = EncoderData::from(&packet);
        assert_approx_eq!(control.left_rate, 0.4, 1e-12);
        assert_approx_eq!(control.right_rate, 0.6, 1e-12);
    }
}
