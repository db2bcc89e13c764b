//! μ-law ↔ linear PCM conversion and base64 payload framing.
//!
//! The telephony transport carries base64-encoded G.711 μ-law at 8kHz mono;
//! the recognizer wants 16-bit linear PCM at the same rate. Everything here is
//! stateless and allocation-per-call; the decode table is built once at
//! startup. No resampling happens anywhere on the hot path.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// ITU-T G.711 μ-law byte → linear PCM sample lookup (sign/exponent/mantissa).
static ULAW_TO_PCM: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let ulaw = !(i as u8);
        let sign = ulaw & 0x80;
        let exponent = (ulaw >> 4) & 0x07;
        let mantissa = ulaw & 0x0F;

        let mut linear = ((i32::from(mantissa) << 3) + BIAS) << exponent;
        linear -= BIAS;

        *slot = if sign != 0 { -linear as i16 } else { linear as i16 };
    }
    table
});

/// Decode one μ-law byte to a linear sample.
#[inline]
pub fn ulaw_byte_to_pcm(byte: u8) -> i16 {
    ULAW_TO_PCM[byte as usize]
}

/// Encode one linear sample as a μ-law byte (bias 0x84, clip 32635).
pub fn pcm_sample_to_ulaw(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0 };
    let mut magnitude = i32::from(sample).abs();
    if magnitude > CLIP {
        magnitude = CLIP;
    }
    magnitude += BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (magnitude & mask) == 0 {
        mask >>= 1;
        exponent -= 1;
    }

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Convert μ-law bytes to linear samples.
pub fn ulaw_to_samples(ulaw: &[u8]) -> Vec<i16> {
    ulaw.iter().map(|&b| ulaw_byte_to_pcm(b)).collect()
}

/// Convert μ-law bytes to 16-bit little-endian PCM bytes (recognizer wire format).
pub fn ulaw_to_pcm(ulaw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ulaw.len() * 2);
    for &b in ulaw {
        out.extend_from_slice(&ulaw_byte_to_pcm(b).to_le_bytes());
    }
    out
}

/// Convert linear samples to μ-law bytes.
pub fn samples_to_ulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| pcm_sample_to_ulaw(s)).collect()
}

/// Convert 16-bit little-endian PCM bytes to μ-law. An odd trailing byte is
/// truncated (a partial sample cannot be encoded).
pub fn pcm_to_ulaw(pcm: &[u8]) -> Vec<u8> {
    let even = &pcm[..pcm.len() - (pcm.len() % 2)];
    even.chunks_exact(2)
        .map(|c| pcm_sample_to_ulaw(i16::from_le_bytes([c[0], c[1]])))
        .collect()
}

/// Decode a base64 media payload to raw μ-law bytes. Malformed base64 is a
/// `MalformedFrame` error; the caller logs it and drops the frame, the
/// session is never torn down over one bad frame.
pub fn decode_payload(b64: &str) -> VoiceResult<Vec<u8>> {
    BASE64
        .decode(b64)
        .map_err(|e| VoiceError::MalformedFrame(format!("invalid base64 payload: {e}")))
}

/// Encode raw μ-law bytes as a base64 media payload.
pub fn encode_payload(ulaw: &[u8]) -> String {
    BASE64.encode(ulaw)
}
