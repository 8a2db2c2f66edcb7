//! Float <-> PCM16 conversion.
//!
//! Encoding clamps to [-1, 1] and scales negative values by 0x8000 and
//! non-negative values by 0x7FFF, truncating toward zero like an
//! `Int16Array` store. Decoding divides by the same factor so both range
//! ends survive a round trip exactly.

const NEG_SCALE: f32 = 32768.0; // 0x8000
const POS_SCALE: f32 = 32767.0; // 0x7FFF

pub fn float_to_pcm16(v: f32) -> i16 {
    let v = if v.is_nan() { 0.0 } else { v.clamp(-1.0, 1.0) };
    if v < 0.0 {
        (v * NEG_SCALE) as i16
    } else {
        (v * POS_SCALE) as i16
    }
}

pub fn pcm16_to_float(s: i16) -> f32 {
    if s < 0 {
        f32::from(s) / NEG_SCALE
    } else {
        f32::from(s) / POS_SCALE
    }
}
