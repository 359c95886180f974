//! Binary decoder for shio microphone notification payloads.
//!
//! The decoder is pure (no I/O, no allocation beyond the returned vector) and
//! is safe to call from any async or sync context.

// ── Samples ───────────────────────────────────────────────────────────────────

/// Decode a microphone payload into signed 16-bit samples.
///
/// Input layout (repeated for the full slice):
/// ```text
/// [LO HI] → sample = i16::from_le_bytes([LO, HI])
/// ```
///
/// A trailing byte that does not form a full pair is silently dropped; a
/// malformed packet is never an error.
///
/// ```
/// # use shio_rs::parse::decode_samples;
/// assert_eq!(decode_samples(&[0x01, 0x00, 0xFF, 0xFF]), vec![1, -1]);
/// assert_eq!(decode_samples(&[0x01]), Vec::<i16>::new());
/// ```
pub fn decode_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Encode samples in the microphone wire format.  Used by the simulator.
pub fn encode_samples(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
