//! Synthetic per-DDC signal generation: a phase-continuous test tone plus
//! independent Gaussian noise on I and Q, built the way software radio
//! simulators commonly synthesize a receive signal: `rand_distr::Normal`
//! sampled through a `rand` RNG, added to a complex carrier.

use std::f64::consts::TAU;

use num_complex::Complex;
use rand::{rngs::SmallRng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Per-DDC phase-continuous tone generator with additive Gaussian noise.
///
/// One [`SignalGenerator`] is owned exclusively by a single producer task —
/// it is never shared, so its phase accumulators need no synchronization.
#[derive(derive_more::Debug)]
pub struct SignalGenerator {
    tone_hz: f64,
    noise_level: f64,
    /// One phase accumulator per DDC, radians, kept reduced modulo 2*pi.
    phase: Vec<f64>,
    #[debug(skip)]
    rng: SmallRng,
}

impl SignalGenerator {
    pub fn new(max_ddcs: usize, tone_hz: f64, noise_level: f64) -> Self {
        Self {
            tone_hz,
            noise_level,
            phase: vec![0.0; max_ddcs],
            rng: SmallRng::from_entropy(),
        }
    }

    /// Fills `out` with `out.len()` complex samples for `ddc` at
    /// `sample_rate_hz`, advancing that DDC's phase accumulator.
    ///
    /// This is the hot path: no allocation happens here, only writes into
    /// the caller-owned buffer.
    pub fn generate_into(&mut self, out: &mut [Complex<f64>], ddc: usize, sample_rate_hz: u32) {
        let step = TAU * self.tone_hz / sample_rate_hz as f64;
        let noise = if self.noise_level > 0.0 {
            Some(Normal::new(0.0, self.noise_level).expect("noise_level must be finite and >= 0"))
        } else {
            None
        };

        let mut phase = self.phase[ddc];
        for sample in out.iter_mut() {
            let mut value = Complex::from_polar(1.0, phase);
            if let Some(noise) = &noise {
                value.re += noise.sample(&mut self.rng);
                value.im += noise.sample(&mut self.rng);
            }
            *sample = value;

            phase += step;
            if phase >= TAU {
                phase -= TAU;
            }
        }
        self.phase[ddc] = phase;
    }

    /// Convenience wrapper around [`Self::generate_into`] for call sites
    /// that don't already own a buffer (tests, the echo path's recording
    /// side is not this — TX IQ is recorded from the host, not generated).
    pub fn generate(&mut self, n: usize, ddc: usize, sample_rate_hz: u32) -> Vec<Complex<f64>> {
        let mut out = vec![Complex::new(0.0, 0.0); n];
        self.generate_into(&mut out, ddc, sample_rate_hz);
        out
    }
}
