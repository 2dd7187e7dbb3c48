//! Protocol 1: a single UDP socket carrying discovery, start/stop, a 5-byte
//! control-word command set, and a fixed 1032-byte double-sub-frame data
//! stream.
//!
//! The server shape — a struct owning a socket and a `CancellationToken`,
//! built with `new` / `with_shutdown` and driven to completion by `serve` —
//! matches [`crate::protocol2::Protocol2Server`].

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::UdpSocket, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{pack_iq_24, unpack_iq_24},
    config::RadioConfig,
    echo::EchoBuffer,
    error::Error,
    signal::SignalGenerator,
    state::RadioState,
};

const DISCOVERY_REPLY_LEN: usize = 60;
const DATA_PACKET_LEN: usize = 1032;
const SUBFRAME_LEN: usize = 512;
const SUBFRAME_PAYLOAD_LEN: usize = 504;
const SYNC: [u8; 3] = [0x7F, 0x7F, 0x7F];

/// Arbitrary but fixed endpoint byte used in the `0xEF 0xFE 0x01 <ep>` data
/// header; real Metis boxes use the USB endpoint number here, which has no
/// meaning over this UDP transport, so any constant value is accepted.
const ENDPOINT_BYTE: u8 = 0x06;

const PROTOCOL_VERSION: u8 = 0;
const MERCURY_FW_VERSION: u8 = 35;
const PENNY_VERSION: u16 = 22;
const METIS_VERSION: u16 = 27;
const SUPPLY_VOLTS_NOMINAL: u16 = 0x3200;

/// The four telemetry addresses the control response rotates through.
use crate::state::CTRL_ROTOR_ADDRS;

/// A single-socket Protocol 1 server.
pub struct Protocol1Server {
    socket: Arc<UdpSocket>,
    config: RadioConfig,
    state: Arc<RadioState>,
    echo: Arc<EchoBuffer>,
    shutdown: CancellationToken,
}

impl Protocol1Server {
    pub fn new(socket: UdpSocket, config: RadioConfig) -> Self {
        let max_ddcs = config.hw.max_ddcs();
        Self {
            socket: Arc::new(socket),
            config,
            state: Arc::new(RadioState::new(max_ddcs, 48_000)),
            echo: Arc::new(EchoBuffer::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Runs the inbound command loop and the outbound producer concurrently
    /// until shutdown is signaled.
    pub async fn serve(self) -> Result<(), Error> {
        let producer_socket = self.socket.clone();
        let producer_state = self.state.clone();
        let producer_echo = self.echo.clone();
        let producer_config = self.config;
        let producer_shutdown = self.shutdown.clone();

        let producer = tokio::spawn(async move {
            run_producer(
                producer_socket,
                producer_state,
                producer_echo,
                producer_config,
                producer_shutdown,
            )
            .await;
        });

        self.run_inbound().await;
        let _ = producer.await;
        Ok(())
    }

    async fn run_inbound(&self) {
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                        Err(error) => tracing::warn!(?error, "protocol1 recv failed"),
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) {
        if datagram.len() < 3 {
            tracing::debug!(len = datagram.len(), "protocol1: short datagram, ignoring");
            return;
        }
        self.state.set_peer(peer);

        match datagram[0..3] {
            [0xEF, 0xFE, 0x02] => {
                let reply = build_discovery_reply(&self.config, self.state.running());
                if let Err(error) = self.socket.send_to(&reply, peer).await {
                    tracing::warn!(?error, "protocol1: discovery reply send failed");
                }
            }
            [0xEF, 0xFE, 0x04] => {
                if datagram.len() < 4 {
                    tracing::debug!("protocol1: truncated start/stop command");
                    return;
                }
                let running = datagram[3] & 0x01 != 0;
                self.state.set_running(running);
            }
            [0xEF, 0xFE, 0x01] => {
                self.handle_host_data(datagram);
            }
            _ => {
                tracing::debug!(magic = ?&datagram[0..3], "protocol1: unrecognized datagram");
            }
        }
    }

    fn handle_host_data(&self, datagram: &[u8]) {
        if datagram.len() < DATA_PACKET_LEN {
            tracing::debug!(len = datagram.len(), "protocol1: short host data packet");
            return;
        }
        let body = &datagram[8..];
        for subframe in [&body[..SUBFRAME_LEN], &body[SUBFRAME_LEN..2 * SUBFRAME_LEN]] {
            self.handle_subframe(subframe);
        }
    }

    fn handle_subframe(&self, subframe: &[u8]) {
        if subframe[0..3] != SYNC {
            tracing::debug!("protocol1: subframe missing sync bytes");
            return;
        }
        let control = &subframe[3..8];
        let ptt = control[0] & 0x01 != 0;
        let addr = control[0] & 0xFE;
        let was_ptt = self.state.ptt();
        self.state.set_ptt(ptt);
        apply_control_command(&self.state, addr, control);

        if self.config.echo_enabled {
            if ptt {
                let payload = &subframe[8..8 + SUBFRAME_PAYLOAD_LEN];
                let samples = decode_host_tx_iq(payload);
                self.echo.record(&samples, self.state.tx_freq_hz());
            }
            else if was_ptt {
                // falling edge: commit before the next producer tick reads
                // the playback slot.
                self.echo.commit_on_ptt_release();
            }
        }
    }
}

/// Applies a decoded Protocol 1 control command to shared state. Unknown
/// addresses are logged, not mutated, per the component's dispatch table.
fn apply_control_command(state: &RadioState, addr: u8, control: &[u8]) {
    match addr {
        0x00 => {
            let rate = match control[1] & 0x03 {
                0 => 48_000,
                1 => 96_000,
                2 => 192_000,
                _ => 384_000,
            };
            state.set_sample_rate_hz(rate);
            let n_ddc = ((control[4] >> 3) & 0x07) as usize + 1;
            state.set_n_active_ddc(n_ddc);
        }
        0x02 => {
            let freq = u32::from_be_bytes([control[1], control[2], control[3], control[4]]);
            state.set_tx_freq_hz(freq);
        }
        0x04..=0x10 => {
            let ddc = ((addr - 0x04) / 2) as usize;
            let freq = u32::from_be_bytes([control[1], control[2], control[3], control[4]]);
            state.set_rx_freq_hz(ddc, freq);
        }
        0x12 => {
            state.set_tx_drive_level(control[1]);
        }
        _ => {
            tracing::debug!(addr, "protocol1: parsed, non-mutating control address");
        }
    }
}

/// Interprets a 504-byte host sub-frame payload as 63 blocks of `[I(3B)
/// Q(3B) Mic(2B)]`, matching the outbound block layout at `nddc = 1`.
fn decode_host_tx_iq(payload: &[u8]) -> Vec<num_complex::Complex<f64>> {
    const BLOCK_LEN: usize = 8;
    payload
        .chunks_exact(BLOCK_LEN)
        .map(|block| unpack_iq_24(&block[0..6]))
        .collect()
}

fn build_discovery_reply(config: &RadioConfig, running: bool) -> [u8; DISCOVERY_REPLY_LEN] {
    let mut reply = [0u8; DISCOVERY_REPLY_LEN];
    reply[0] = 0xEF;
    reply[1] = 0xFE;
    reply[2] = if running { 0x03 } else { 0x02 };
    reply[3..9].copy_from_slice(&config.mac);
    reply[9] = MERCURY_FW_VERSION;
    reply[10] = config.hw.board_code();
    reply[11] = PROTOCOL_VERSION;
    reply[14..16].copy_from_slice(&MERCURY_FW_VERSION_U16.to_be_bytes());
    reply[16..18].copy_from_slice(&PENNY_VERSION.to_be_bytes());
    reply[18..20].copy_from_slice(&METIS_VERSION.to_be_bytes());
    reply[20] = config.hw.max_ddcs() as u8;
    reply
}

const MERCURY_FW_VERSION_U16: u16 = MERCURY_FW_VERSION as u16;

/// Runs the timer-driven outbound producer: builds one 1032-byte data
/// packet per tick, targeting `sample_rate / (2 * spr)` packets per second.
/// The period is recomputed every tick so rate/DDC-count changes take
/// effect immediately; falling behind by more than one period causes the
/// next tick to fire immediately rather than bursting to catch up, per the
/// no-backlog discipline of the concurrency model.
async fn run_producer(
    socket: Arc<UdpSocket>,
    state: Arc<RadioState>,
    echo: Arc<EchoBuffer>,
    config: RadioConfig,
    shutdown: CancellationToken,
) {
    let mut signal = SignalGenerator::new(state.max_ddcs(), config.tone_hz, config.noise_level);
    let mut packet = [0u8; DATA_PACKET_LEN];
    let mut ddc_scratch: Vec<Vec<num_complex::Complex<f64>>> =
        (0..state.max_ddcs()).map(|_| Vec::new()).collect();
    let mut next_tick = Instant::now();

    loop {
        if !state.running() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(5)) => continue,
            }
        }

        let Some(peer) = state.peer() else {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(5)) => continue,
            }
        };

        let nddc = state.n_active_ddc();
        let sample_rate = state.sample_rate_hz();
        let spr = spr_for(nddc);
        let period = Duration::from_secs_f64(2.0 * spr as f64 / sample_rate as f64);

        next_tick += period;
        let now = Instant::now();
        if now > next_tick + period {
            // fell behind by more than one packet period: skip ahead
            // instead of accumulating backlog.
            next_tick = now;
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep_until(next_tick) => {}
        }

        build_data_packet(
            &mut packet,
            &state,
            &echo,
            &mut signal,
            &mut ddc_scratch,
            nddc,
            sample_rate,
            spr,
        );

        if let Err(error) = socket.send_to(&packet, peer).await {
            tracing::warn!(?error, "protocol1: data packet send failed");
        }
    }
}

/// `spr = floor(504 / (6*nddc + 2))`, the samples-per-DDC-per-sub-frame.
fn spr_for(nddc: usize) -> usize {
    SUBFRAME_PAYLOAD_LEN / (6 * nddc + 2)
}

fn build_data_packet(
    packet: &mut [u8; DATA_PACKET_LEN],
    state: &RadioState,
    echo: &EchoBuffer,
    signal: &mut SignalGenerator,
    ddc_scratch: &mut [Vec<num_complex::Complex<f64>>],
    nddc: usize,
    sample_rate: u32,
    spr: usize,
) {
    packet[0] = 0xEF;
    packet[1] = 0xFE;
    packet[2] = 0x01;
    packet[3] = ENDPOINT_BYTE;
    packet[4..8].copy_from_slice(&state.next_seq_out().to_be_bytes());

    let ptt = state.ptt();
    let tx_drive_level = state.tx_drive_level();

    for subframe in packet[8..].chunks_exact_mut(SUBFRAME_LEN) {
        build_subframe(
            subframe,
            state,
            echo,
            signal,
            ddc_scratch,
            nddc,
            sample_rate,
            spr,
            ptt,
            tx_drive_level,
        );
    }
}

fn build_subframe(
    subframe: &mut [u8],
    state: &RadioState,
    echo: &EchoBuffer,
    signal: &mut SignalGenerator,
    ddc_scratch: &mut [Vec<num_complex::Complex<f64>>],
    nddc: usize,
    sample_rate: u32,
    spr: usize,
    ptt: bool,
    tx_drive_level: u8,
) {
    subframe[0..3].copy_from_slice(&SYNC);

    let addr = state.advance_ctrl_rotor();
    subframe[3..8].copy_from_slice(&telemetry_word(addr, ptt, tx_drive_level));

    // Fill one buffer of `spr` samples per active DDC before interleaving,
    // so the signal generator and echo buffer are each called once per
    // DDC per sub-frame rather than once per sample.
    let use_echo = echo.has_playback();
    for ddc in 0..nddc {
        ddc_scratch[ddc].resize(spr, num_complex::Complex::new(0.0, 0.0));
        if ddc == 0 && use_echo {
            echo.read_into(&mut ddc_scratch[0], state.rx_freq_hz(0), sample_rate);
        } else {
            signal.generate_into(&mut ddc_scratch[ddc], ddc, sample_rate);
        }
    }

    let payload = &mut subframe[8..8 + SUBFRAME_PAYLOAD_LEN];
    payload.fill(0);

    let block_len = 6 * nddc + 2;
    for (k, block) in payload.chunks_exact_mut(block_len).take(spr).enumerate() {
        for ddc in 0..nddc {
            block[ddc * 6..ddc * 6 + 6].copy_from_slice(&pack_iq_24(ddc_scratch[ddc][k]));
        }
        // trailing 2 bytes of the block are mic, left zero.
    }
}

fn telemetry_word(addr: u8, ptt: bool, tx_drive_level: u8) -> [u8; 5] {
    let mut word = [addr | 0x80 | (ptt as u8), 0, 0, 0, 0];

    let (field_a, field_b): (u16, u16) = match addr {
        a if a == CTRL_ROTOR_ADDRS[0] => (0, PENNY_VERSION),
        a if a == CTRL_ROTOR_ADDRS[1] => {
            let power = tx_power_reading(ptt, tx_drive_level);
            (power, power)
        }
        a if a == CTRL_ROTOR_ADDRS[2] => {
            let power = tx_power_reading(ptt, tx_drive_level);
            (power / 4, power / 2)
        }
        a if a == CTRL_ROTOR_ADDRS[3] => {
            let power = tx_power_reading(ptt, tx_drive_level);
            (power / 8, SUPPLY_VOLTS_NOMINAL)
        }
        _ => (0, 0),
    };

    word[1..3].copy_from_slice(&field_a.to_be_bytes());
    word[3..5].copy_from_slice(&field_b.to_be_bytes());
    word
}

/// Synthetic forward-power-ish reading scaled by TX drive level; zero on RX.
fn tx_power_reading(ptt: bool, tx_drive_level: u8) -> u16 {
    if ptt {
        tx_drive_level as u16 * 257
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HardwareKind;

    fn test_config() -> RadioConfig {
        RadioConfig::new(HardwareKind::Hermes, [0x00, 0x1C, 0xC0, 0xA1, 0xB2, 0xC3])
    }

    #[test]
    fn discovery_reply_has_expected_fields() {
        let reply = build_discovery_reply(&test_config(), false);
        assert_eq!(reply.len(), 60);
        assert_eq!(reply[0], 0xEF);
        assert_eq!(reply[1], 0xFE);
        assert_eq!(reply[2], 0x02);
        assert_eq!(reply[10], 1); // Hermes board code
        assert_eq!(reply[11], 0);
        assert_eq!(reply[20], 4); // Hermes max_ddcs
    }

    #[test]
    fn spr_matches_known_values() {
        assert_eq!(spr_for(1), 63);
        assert_eq!(spr_for(2), 36);
        assert_eq!(spr_for(3), 25);
        assert_eq!(spr_for(4), 19);
    }

    #[test]
    fn data_packet_starts_with_magic_and_sync() {
        let state = RadioState::new(4, 48_000);
        let echo = EchoBuffer::new();
        let mut signal = SignalGenerator::new(4, 1000.0, 0.0);
        let mut scratch: Vec<Vec<num_complex::Complex<f64>>> = (0..4).map(|_| Vec::new()).collect();
        let mut packet = [0u8; DATA_PACKET_LEN];

        build_data_packet(&mut packet, &state, &echo, &mut signal, &mut scratch, 1, 48_000, 63);

        assert_eq!(&packet[0..3], &[0xEF, 0xFE, 0x01]);
        assert_eq!(&packet[8..11], &SYNC);
        assert_eq!(&packet[8 + SUBFRAME_LEN..8 + SUBFRAME_LEN + 3], &SYNC);
    }

    #[test]
    fn control_response_rotates_in_order() {
        let state = RadioState::new(4, 48_000);
        let echo = EchoBuffer::new();
        let mut signal = SignalGenerator::new(4, 1000.0, 0.0);
        let mut scratch: Vec<Vec<num_complex::Complex<f64>>> = (0..4).map(|_| Vec::new()).collect();
        let mut packet = [0u8; DATA_PACKET_LEN];

        let mut addrs = Vec::new();
        for _ in 0..2 {
            build_data_packet(&mut packet, &state, &echo, &mut signal, &mut scratch, 1, 48_000, 63);
            addrs.push(packet[8 + 3] & 0x7E);
            addrs.push(packet[8 + SUBFRAME_LEN + 3] & 0x7E);
        }
        assert_eq!(addrs, vec![0x00, 0x08, 0x10, 0x18]);
    }

    #[test]
    fn sample_rate_command_updates_state() {
        let state = RadioState::new(4, 48_000);
        // C0 = 0x00 (address, PTT clear), C1 = 0x02 (192k), C4 bits 3..5 = 001 (2 DDCs)
        apply_control_command(&state, 0x00, &[0x00, 0x02, 0x00, 0x00, 0b0000_1000]);
        assert_eq!(state.sample_rate_hz(), 192_000);
        assert_eq!(state.n_active_ddc(), 2);
    }

    #[test]
    fn tx_vfo_command_updates_state() {
        let state = RadioState::new(4, 48_000);
        apply_control_command(&state, 0x02, &[0x02, 0x00, 0x6C, 0xD3, 0x60]);
        assert_eq!(state.tx_freq_hz(), 0x006CD360);
    }

    #[test]
    fn decode_host_tx_iq_produces_63_samples() {
        let payload = [0u8; SUBFRAME_PAYLOAD_LEN];
        let samples = decode_host_tx_iq(&payload);
        assert_eq!(samples.len(), 63);
    }
}
