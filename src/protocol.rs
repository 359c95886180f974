//! GATT UUIDs, the role byte protocol, sink naming and default sizing
//! constants for shio sensors.
//!
//! All UUIDs belong to the shio vendor namespace
//! `47eaXXXX-a0e4-554e-5282-0afcd3246970`.

use uuid::Uuid;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service UUID advertised by every shio sensor.
///
/// Used as the scan filter, so only shio devices are ever reported as
/// discovered.
pub const SHIO_SERVICE_UUID: Uuid = Uuid::from_u128(0x47ea1400_a0e4_554e_5282_0afcd3246970);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Microphone sample stream.
///
/// Each notification carries little-endian signed 16-bit samples, two bytes
/// per sample.  See [`crate::parse::decode_samples`].
pub const MIC_DATA_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x47ea1402_a0e4_554e_5282_0afcd3246970);

/// Role characteristic.  The host writes a single [`ROLE_MASTER`] or
/// [`ROLE_SLAVE`] byte to it.
///
/// Devices that do not expose this characteristic are skipped when a role is
/// assigned.
pub const ROLE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x47ea1403_a0e4_554e_5282_0afcd3246970);

// ── Role byte protocol ────────────────────────────────────────────────────────

/// Role byte for the master device (`'m'`).
pub const ROLE_MASTER: u8 = 0x6D;

/// Role byte for a slave device (`'s'`).
pub const ROLE_SLAVE: u8 = 0x73;

// ── Sinks ─────────────────────────────────────────────────────────────────────

/// File name of the ML result sink.  Truncated at the start of every
/// Predicting session.
pub const ML_OUTPUT_FILE: &str = "shio_ml_output.txt";

/// File name of the per-channel sample log, e.g. `shio_log_ch1.txt`.
pub fn log_file_name(channel: usize) -> String {
    format!("shio_log_ch{channel}.txt")
}

// ── Default sizing ────────────────────────────────────────────────────────────

/// Samples accumulated per channel before the plot window is flushed.
pub const DEFAULT_PLOT_FILL: usize = 20;

/// Samples kept per channel in the plot display window.
pub const DEFAULT_PLOT_WINDOW: usize = 1000;

/// Samples per channel in one inference tensor.
pub const DEFAULT_SAMPLES_PER_CHANNEL: usize = 1024;

/// Number of channels in one inference tensor.  The model input shape is
/// `[1, channel_count, samples_per_channel]`.
pub const DEFAULT_INFERENCE_CHANNELS: usize = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_bytes_are_ascii_m_and_s() {
        assert_eq!(ROLE_MASTER, b'm');
        assert_eq!(ROLE_SLAVE, b's');
    }

    #[test]
    fn log_file_names_follow_channel_numbers() {
        assert_eq!(log_file_name(1), "shio_log_ch1.txt");
        assert_eq!(log_file_name(12), "shio_log_ch12.txt");
    }

    #[test]
    fn characteristics_share_the_service_namespace() {
        let suffix = |u: Uuid| u.as_u128() & 0x0000_ffff_ffff_ffff_ffff_ffff_ffff;
        assert_eq!(suffix(MIC_DATA_CHARACTERISTIC), suffix(SHIO_SERVICE_UUID));
        assert_eq!(suffix(ROLE_CHARACTERISTIC), suffix(SHIO_SERVICE_UUID));
    }
}
