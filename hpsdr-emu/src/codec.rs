//! 24-bit signed big-endian IQ packing and 16-bit microphone packing.
//!
//! This is the hot path: every producer tick calls [`pack_iq_24`] once per
//! sample per active DDC, so these functions never allocate.

use num_complex::Complex;

/// `2^23 - 1`, the positive full-scale value of a 24-bit signed sample.
const FULL_SCALE: f64 = 8_388_607.0;
const MIN_24: f64 = -8_388_608.0;
const MAX_24: f64 = 8_388_607.0;

/// Packs one real component `x` (expected in `[-1, 1]`) into a 24-bit signed
/// big-endian value, clamping rather than wrapping on overflow.
pub fn pack_i24(x: f64) -> [u8; 3] {
    let scaled = (x * FULL_SCALE).round().clamp(MIN_24, MAX_24) as i32;
    let be = scaled.to_be_bytes();
    [be[1], be[2], be[3]]
}

/// Inverse of [`pack_i24`]: sign-extends into the high-order 24 bits of a
/// 32-bit integer, then normalizes by `2^31`.
pub fn unpack_i24(bytes: [u8; 3]) -> f64 {
    let widened = ((bytes[0] as i32) << 24) | ((bytes[1] as i32) << 16) | ((bytes[2] as i32) << 8);
    widened as f64 / 2_147_483_648.0
}

/// Packs a complex IQ sample as `[I(3B), Q(3B)]`, 6 bytes total.
pub fn pack_iq_24(sample: Complex<f64>) -> [u8; 6] {
    let i = pack_i24(sample.re);
    let q = pack_i24(sample.im);
    [i[0], i[1], i[2], q[0], q[1], q[2]]
}

/// Unpacks a complex IQ sample from a 6-byte `[I(3B), Q(3B)]` slice.
///
/// Panics if `bytes` is shorter than 6 bytes; callers own buffer layout and
/// are expected to have validated packet length already.
pub fn unpack_iq_24(bytes: &[u8]) -> Complex<f64> {
    let i = unpack_i24([bytes[0], bytes[1], bytes[2]]);
    let q = unpack_i24([bytes[3], bytes[4], bytes[5]]);
    Complex::new(i, q)
}

/// Packs a 16-bit microphone sample, big-endian.
pub fn pack_mic_16(v: i16) -> [u8; 2] {
    v.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_tolerance() {
        for x in [-1.0 + f64::EPSILON, -0.5, 0.0, 0.25, 0.75, 1.0 - 1.0 / 8_388_608.0] {
            let packed = pack_i24(x);
            let unpacked = unpack_i24(packed);
            assert!(
                (unpacked - x).abs() <= 1.0 / 8_388_608.0,
                "x={x} unpacked={unpacked}"
            );
        }
    }

    #[test]
    fn clamps_rather_than_wraps_on_overflow() {
        let packed = pack_i24(5.0);
        let unpacked = unpack_i24(packed);
        assert!((unpacked - 1.0).abs() < 1e-6);

        let packed = pack_i24(-5.0);
        let unpacked = unpack_i24(packed);
        assert!((unpacked - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn iq_roundtrip() {
        let sample = Complex::new(0.3, -0.6);
        let packed = pack_iq_24(sample);
        let unpacked = unpack_iq_24(&packed);
        assert!((unpacked.re - sample.re).abs() < 1e-6);
        assert!((unpacked.im - sample.im).abs() < 1e-6);
    }

    #[test]
    fn mic_packs_big_endian() {
        assert_eq!(pack_mic_16(0x0102), [0x01, 0x02]);
        assert_eq!(pack_mic_16(-1), [0xFF, 0xFF]);
    }
}
