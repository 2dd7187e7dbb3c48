//! Records TX IQ during push-to-talk and replays it on RX with a
//! per-frequency phase-continuous shift, heavily attenuated.
//!
//! The state machine and the persistent per-`(tx_freq, rx_freq)` phase
//! accumulator are a `parking_lot::Mutex`-guarded record/playback pair, the
//! same lock discipline used elsewhere in this crate to guard shared
//! producer/consumer buffer state.

use std::{collections::HashMap, f64::consts::TAU};

use num_complex::Complex;
use parking_lot::Mutex;

/// Linear attenuation applied to echoed playback (~80 dB down).
const ECHO_ATTENUATION: f64 = 1e-4;

/// Maximum number of distinct `(tx_freq, rx_freq)` phase accumulators kept
/// at once. Bounded so a host that sweeps frequencies can't grow this
/// unboundedly.
const MAX_PHASE_KEYS: usize = 16;

#[derive(Default)]
struct Inner {
    /// Samples currently being recorded while PTT is asserted, plus the
    /// TX frequency they were recorded at.
    recording: Vec<Complex<f64>>,
    recording_tx_freq: u32,

    /// The last committed recording, looped on playback. `None` until the
    /// first PTT release.
    playback: Option<Vec<Complex<f64>>>,
    playback_tx_freq: u32,
    read_cursor: usize,

    /// Persistent phase accumulators keyed by `(tx_freq, rx_freq)`, radians.
    phase: HashMap<(u32, u32), f64>,
}

/// Records host TX IQ during PTT and replays it on RX with a frequency
/// shift once PTT releases.
#[derive(Default)]
pub struct EchoBuffer {
    inner: Mutex<Inner>,
}

impl EchoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends samples to the in-progress recording. Call only while PTT is
    /// asserted; has no effect otherwise (callers gate on PTT state in the
    /// protocol server, which tracks the idle/recording transition itself).
    pub fn record(&self, samples: &[Complex<f64>], tx_freq: u32) {
        let mut inner = self.inner.lock();
        inner.recording_tx_freq = tx_freq;
        inner.recording.extend_from_slice(samples);
    }

    /// Swaps the in-progress recording into the playback slot and resets
    /// the read cursor. Must run before the next producer tick reads from
    /// the playback slot — taking this lock here and in [`Self::read`] is
    /// what gives that ordering.
    pub fn commit_on_ptt_release(&self) {
        let mut inner = self.inner.lock();
        if inner.recording.is_empty() {
            return;
        }
        inner.playback = Some(std::mem::take(&mut inner.recording));
        inner.playback_tx_freq = inner.recording_tx_freq;
        inner.read_cursor = 0;
    }

    /// Fills `out` with samples from the playback slot, shifted by `tx_freq -
    /// rx_freq` and attenuated. Fills with zeros if nothing has been
    /// committed yet. Never allocates: `out` is caller-owned and reused every
    /// tick.
    pub fn read_into(&self, out: &mut [Complex<f64>], rx_freq: u32, sample_rate_hz: u32) {
        let mut inner = self.inner.lock();

        let empty = match &inner.playback {
            None => true,
            Some(playback) => playback.is_empty(),
        };
        if empty {
            out.fill(Complex::new(0.0, 0.0));
            return;
        }

        let tx_freq = inner.playback_tx_freq;
        let delta_hz = tx_freq as f64 - rx_freq as f64;
        let step = TAU * delta_hz / sample_rate_hz as f64;

        if inner.phase.len() >= MAX_PHASE_KEYS && !inner.phase.contains_key(&(tx_freq, rx_freq)) {
            // evict an arbitrary entry to bound growth; which one doesn't
            // matter, since a stale key will simply be recreated at phase 0
            // if the host retunes back to it.
            if let Some(key) = inner.phase.keys().next().copied() {
                inner.phase.remove(&key);
            }
        }
        let mut phase = *inner.phase.entry((tx_freq, rx_freq)).or_insert(0.0);

        let mut cursor = inner.read_cursor;
        let playback = inner.playback.as_ref().expect("checked non-empty above");
        for sample in out.iter_mut() {
            *sample = playback[cursor] * Complex::from_polar(ECHO_ATTENUATION, phase);

            cursor = (cursor + 1) % playback.len();
            phase += step;
            if phase >= TAU {
                phase -= TAU;
            } else if phase < 0.0 {
                phase += TAU;
            }
        }

        inner.read_cursor = cursor;
        inner.phase.insert((tx_freq, rx_freq), phase);
    }

    pub fn has_playback(&self) -> bool {
        self.inner.lock().playback.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_resets_to_start_after_commit() {
        let echo = EchoBuffer::new();
        let samples: Vec<Complex<f64>> = (0..8).map(|i| Complex::new(i as f64 / 8.0, 0.0)).collect();
        echo.record(&samples, 7_100_000);
        echo.commit_on_ptt_release();

        // rx_freq == tx_freq => zero shift, only attenuation applied.
        let mut out = vec![Complex::new(0.0, 0.0); 1];
        echo.read_into(&mut out, 7_100_000, 48_000);
        let expected = samples[0] * ECHO_ATTENUATION;
        assert!((out[0] - expected).norm() < 1e-9);
    }

    #[test]
    fn idle_reads_return_zero() {
        let echo = EchoBuffer::new();
        let mut out = vec![Complex::new(1.0, 1.0); 4];
        echo.read_into(&mut out, 7_100_000, 48_000);
        assert!(out.iter().all(|s| s.norm() == 0.0));
    }

    #[test]
    fn playback_loops() {
        let echo = EchoBuffer::new();
        let samples: Vec<Complex<f64>> = (0..4).map(|i| Complex::new(i as f64, 0.0)).collect();
        echo.record(&samples, 7_100_000);
        echo.commit_on_ptt_release();

        let mut out = vec![Complex::new(0.0, 0.0); 6];
        echo.read_into(&mut out, 7_100_000, 48_000);
        assert_eq!(out.len(), 6);
        // index 4 should wrap back to sample 0, scaled.
        assert!((out[4] - samples[0] * ECHO_ATTENUATION).norm() < 1e-9);
    }

    #[test]
    fn phase_continuous_across_read_calls() {
        let echo = EchoBuffer::new();
        let samples = vec![Complex::new(1.0, 0.0); 1000];
        echo.record(&samples, 7_100_100);
        echo.commit_on_ptt_release();

        let mut a = vec![Complex::new(0.0, 0.0); 100];
        let mut b = vec![Complex::new(0.0, 0.0); 100];
        echo.read_into(&mut a, 7_100_000, 48_000);
        echo.read_into(&mut b, 7_100_000, 48_000);
        // with continuous phase, the shift magnitude stays constant.
        for sample in a.iter().chain(b.iter()) {
            assert!((sample.norm() - ECHO_ATTENUATION).abs() < 1e-9);
        }
    }
}
