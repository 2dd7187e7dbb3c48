//! Shared, mutable radio state.
//!
//! One [`RadioState`] is created per protocol server and lives for the
//! lifetime of that server. The inbound command task and the outbound
//! producer task(s) hold an `Arc<RadioState>` each; every field is updated
//! and read independently, with no cross-field transactions.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
};

use parking_lot::Mutex;

/// Sample rates Protocol 1 and Protocol 2 both allow hosts to select.
pub const VALID_SAMPLE_RATES: [u32; 4] = [48_000, 96_000, 192_000, 384_000];

/// Default tuned frequency for TX and every RX channel at startup.
pub const DEFAULT_FREQ_HZ: u32 = 7_100_000;

/// The four telemetry addresses Protocol 1 rotates its control response
/// through, in order.
pub const CTRL_ROTOR_ADDRS: [u8; 4] = [0x00, 0x08, 0x10, 0x18];

#[derive(Debug)]
pub struct RadioState {
    max_ddcs: usize,

    sample_rate_hz: AtomicU32,
    n_active_ddc: AtomicU32,
    tx_freq_hz: AtomicU32,
    rx_freq_hz: Vec<AtomicU32>,

    running: AtomicBool,
    ptt: AtomicBool,
    tx_drive_level: AtomicU8,

    seq_out: AtomicU32,
    ctrl_rotor: AtomicU8,

    peer: Mutex<Option<SocketAddr>>,
}

impl RadioState {
    pub fn new(max_ddcs: usize, default_sample_rate_hz: u32) -> Self {
        assert!(VALID_SAMPLE_RATES.contains(&default_sample_rate_hz));

        Self {
            max_ddcs,
            sample_rate_hz: AtomicU32::new(default_sample_rate_hz),
            n_active_ddc: AtomicU32::new(1),
            tx_freq_hz: AtomicU32::new(DEFAULT_FREQ_HZ),
            rx_freq_hz: (0..max_ddcs).map(|_| AtomicU32::new(DEFAULT_FREQ_HZ)).collect(),
            running: AtomicBool::new(false),
            ptt: AtomicBool::new(false),
            tx_drive_level: AtomicU8::new(0),
            seq_out: AtomicU32::new(0),
            ctrl_rotor: AtomicU8::new(0),
            peer: Mutex::new(None),
        }
    }

    pub fn max_ddcs(&self) -> usize {
        self.max_ddcs
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz.load(Ordering::Relaxed)
    }

    /// Sets the sample rate, clamping to 48 kHz and logging a warning if the
    /// caller passes something outside [`VALID_SAMPLE_RATES`] rather than
    /// propagating an error for it.
    pub fn set_sample_rate_hz(&self, rate: u32) {
        let rate = if VALID_SAMPLE_RATES.contains(&rate) {
            rate
        } else {
            tracing::warn!(requested = rate, "invalid sample rate, clamping to 48000");
            48_000
        };
        self.sample_rate_hz.store(rate, Ordering::Relaxed);
    }

    pub fn n_active_ddc(&self) -> usize {
        self.n_active_ddc.load(Ordering::Relaxed) as usize
    }

    pub fn set_n_active_ddc(&self, n: usize) {
        let clamped = n.clamp(1, self.max_ddcs);
        if clamped != n {
            tracing::warn!(requested = n, max = self.max_ddcs, "invalid n_active_ddc, clamping into range");
        }
        self.n_active_ddc.store(clamped as u32, Ordering::Relaxed);
    }

    pub fn tx_freq_hz(&self) -> u32 {
        self.tx_freq_hz.load(Ordering::Relaxed)
    }

    pub fn set_tx_freq_hz(&self, freq: u32) {
        self.tx_freq_hz.store(freq, Ordering::Relaxed);
    }

    pub fn rx_freq_hz(&self, ddc: usize) -> u32 {
        self.rx_freq_hz[ddc].load(Ordering::Relaxed)
    }

    /// Frequencies for DDCs beyond `max_ddcs` are accepted but ignored.
    pub fn set_rx_freq_hz(&self, ddc: usize, freq: u32) {
        if let Some(slot) = self.rx_freq_hz.get(ddc) {
            slot.store(freq, Ordering::Relaxed);
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Transitions `running`. On the rising edge `seq_out` is reset to 0
    /// first so that any task observing `running == true` also observes the
    /// fresh sequence number.
    pub fn set_running(&self, running: bool) {
        if running {
            self.seq_out.store(0, Ordering::Relaxed);
        }
        self.running.store(running, Ordering::Release);
    }

    pub fn ptt(&self) -> bool {
        self.ptt.load(Ordering::Acquire)
    }

    pub fn set_ptt(&self, ptt: bool) {
        self.ptt.store(ptt, Ordering::Release);
    }

    pub fn tx_drive_level(&self) -> u8 {
        self.tx_drive_level.load(Ordering::Relaxed)
    }

    pub fn set_tx_drive_level(&self, level: u8) {
        self.tx_drive_level.store(level, Ordering::Relaxed);
    }

    /// Returns the current sequence number and advances it, wrapping modulo
    /// 2^32.
    pub fn next_seq_out(&self) -> u32 {
        self.seq_out.fetch_add(1, Ordering::Relaxed)
    }

    /// Advances the Protocol 1 control-response rotor and returns the
    /// address it now points at.
    pub fn advance_ctrl_rotor(&self) -> u8 {
        let idx = self
            .ctrl_rotor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| {
                Some((i + 1) % CTRL_ROTOR_ADDRS.len() as u8)
            })
            .expect("update fn always returns Some");
        CTRL_ROTOR_ADDRS[idx as usize]
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    pub fn set_peer(&self, addr: SocketAddr) {
        *self.peer.lock() = Some(addr);
    }
}
