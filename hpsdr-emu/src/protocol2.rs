//! Protocol 2: six inbound UDP sockets (ports 1024-1029) plus one outbound
//! socket per active DDC (ports 1035+d), driven by a 10 Hz high-priority
//! status/command channel instead of Protocol 1's discrete start/stop.
//!
//! Socket ownership and the `new` / `with_shutdown` / `serve` shape mirror
//! [`crate::protocol1::Protocol1Server`].

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use num_complex::Complex;
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
const HP_STATUS_LEN: usize = 60;
const MIC_FRAME_LEN: usize = 132;
const MIC_SAMPLES_PER_FRAME: usize = 64;
const IQ_PACKET_LEN: usize = 1444;
const IQ_SAMPLES_PER_FRAME: usize = 238;
const BITS_PER_SAMPLE: u16 = 24;

const PROTOCOL_VERSION: u8 = 2;
const MERCURY_FW_VERSION: u16 = 35;
const PENNY_VERSION: u16 = 22;
const METIS_VERSION: u16 = 27;

/// Base outbound port for DDC `0`'s IQ stream; DDC `d` sends from
/// `DDC_BASE_PORT + d`.
const DDC_BASE_PORT: u16 = 1035;
/// Per the wire spec, the destination port is the source port plus 10.
const DDC_DEST_OFFSET: u16 = 10;

/// The six inbound sockets and the per-DDC outbound sockets a Protocol 2
/// server needs, already bound by the caller.
pub struct Protocol2Sockets {
    /// Port 1024: discovery + general config.
    pub discovery: UdpSocket,
    /// Port 1025: RX-specific config inbound, HP status outbound.
    pub rx_config: UdpSocket,
    /// Port 1026: TX-specific config inbound, mic outbound.
    pub tx_config: UdpSocket,
    /// Port 1027: high-priority command inbound.
    pub hp_command: UdpSocket,
    /// Port 1028: TX audio inbound (discarded).
    pub tx_audio: UdpSocket,
    /// Port 1029: TX IQ inbound.
    pub tx_iq: UdpSocket,
    /// Ports 1035..1035+max_ddcs-1: per-DDC IQ outbound, indexed by DDC.
    pub ddc: Vec<UdpSocket>,
}

pub struct Protocol2Server {
    sockets: Protocol2Sockets,
    config: RadioConfig,
    state: Arc<RadioState>,
    echo: Arc<EchoBuffer>,
    shutdown: CancellationToken,
}

impl Protocol2Server {
    pub fn new(sockets: Protocol2Sockets, config: RadioConfig) -> Self {
        let max_ddcs = config.hw.max_ddcs();
        Self {
            sockets,
            config,
            state: Arc::new(RadioState::new(max_ddcs, 192_000)),
            echo: Arc::new(EchoBuffer::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn serve(self) -> Result<(), Error> {
        let Protocol2Sockets {
            discovery,
            rx_config,
            tx_config,
            hp_command,
            tx_audio,
            tx_iq,
            ddc,
        } = self.sockets;

        let state = self.state;
        let echo = self.echo;
        let config = self.config;
        let shutdown = self.shutdown;
        let ddc0_sample_count = Arc::new(AtomicU64::new(0));

        let rx_config = Arc::new(rx_config);
        let tx_config = Arc::new(tx_config);

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(run_discovery(
            discovery,
            config,
            state.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(run_rx_config(rx_config.clone(), state.clone(), shutdown.clone())));
        tasks.push(tokio::spawn(run_hp_status(rx_config.clone(), state.clone(), shutdown.clone())));
        tasks.push(tokio::spawn(run_tx_config(tx_config.clone(), state.clone(), shutdown.clone())));
        tasks.push(tokio::spawn(run_mic_stream(tx_config.clone(), state.clone(), shutdown.clone())));
        tasks.push(tokio::spawn(run_hp_command(
            hp_command,
            state.clone(),
            echo.clone(),
            config,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(run_tx_audio(tx_audio, shutdown.clone())));
        tasks.push(tokio::spawn(run_tx_iq(
            tx_iq,
            state.clone(),
            echo.clone(),
            config,
            shutdown.clone(),
        )));

        for (d, socket) in ddc.into_iter().enumerate() {
            tasks.push(tokio::spawn(run_ddc_stream(
                d,
                socket,
                state.clone(),
                echo.clone(),
                config,
                ddc0_sample_count.clone(),
                shutdown.clone(),
            )));
        }

        for task in tasks {
            let _ = task.await;
        }

        Ok(())
    }
}

fn build_discovery_reply(config: &RadioConfig) -> [u8; DISCOVERY_REPLY_LEN] {
    let mut reply = [0u8; DISCOVERY_REPLY_LEN];
    reply[4] = 0x02;
    reply[5..11].copy_from_slice(&config.mac);
    reply[11] = config.hw.board_code();
    reply[12] = PROTOCOL_VERSION;
    reply[14..16].copy_from_slice(&MERCURY_FW_VERSION.to_be_bytes());
    reply[16..18].copy_from_slice(&PENNY_VERSION.to_be_bytes());
    reply[18..20].copy_from_slice(&METIS_VERSION.to_be_bytes());
    reply[20] = config.hw.max_ddcs() as u8;
    reply
}

async fn run_discovery(
    socket: UdpSocket,
    config: RadioConfig,
    state: Arc<RadioState>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv_from(&mut buf) => {
                let Ok((len, peer)) = result else {
                    tracing::warn!("protocol2: discovery recv failed");
                    continue;
                };
                state.set_peer(peer);
                if len < 5 || buf[0..4] != [0, 0, 0, 0] {
                    tracing::debug!("protocol2: unrecognized port 1024 datagram");
                    continue;
                }
                match buf[4] {
                    0x02 => {
                        let reply = build_discovery_reply(&config);
                        if let Err(error) = socket.send_to(&reply, peer).await {
                            tracing::warn!(?error, "protocol2: discovery reply send failed");
                        }
                    }
                    0x00 => tracing::debug!("protocol2: general config received, not applied"),
                    other => tracing::debug!(status = other, "protocol2: unknown port 1024 status byte"),
                }
            }
        }
    }
}

async fn run_rx_config(socket: Arc<UdpSocket>, state: Arc<RadioState>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; IQ_PACKET_LEN];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv_from(&mut buf) => {
                let Ok((len, peer)) = result else {
                    tracing::warn!("protocol2: rx-config recv failed");
                    continue;
                };
                state.set_peer(peer);
                if len < 24 {
                    tracing::debug!(len, "protocol2: short rx-config packet");
                    continue;
                }

                let bitmask = buf[7];
                let n_active = bitmask.count_ones().max(1) as usize;
                state.set_n_active_ddc(n_active);

                let offset = 18;
                if len >= offset + 2 {
                    let khz = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
                    state.set_sample_rate_hz(khz as u32 * 1000);
                }
            }
        }
    }
}

async fn run_tx_config(socket: Arc<UdpSocket>, state: Arc<RadioState>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; IQ_PACKET_LEN];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((_len, peer)) => {
                        state.set_peer(peer);
                        tracing::debug!("protocol2: tx-config received, logged only");
                    }
                    Err(error) => tracing::warn!(?error, "protocol2: tx-config recv failed"),
                }
            }
        }
    }
}

async fn run_hp_command(
    socket: UdpSocket,
    state: Arc<RadioState>,
    echo: Arc<EchoBuffer>,
    config: RadioConfig,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; IQ_PACKET_LEN];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv_from(&mut buf) => {
                let Ok((len, peer)) = result else {
                    tracing::warn!("protocol2: hp-command recv failed");
                    continue;
                };
                state.set_peer(peer);
                if len < 346 {
                    tracing::debug!(len, "protocol2: short hp-command packet");
                    continue;
                }

                let running = buf[4] & 0x01 != 0;
                let ptt = buf[4] & 0x02 != 0;
                let was_ptt = state.ptt();
                state.set_running(running);
                state.set_ptt(ptt);
                if config.echo_enabled && was_ptt && !ptt {
                    // falling edge: commit before the next DDC-stream tick
                    // reads the playback slot.
                    echo.commit_on_ptt_release();
                }

                for ddc in 0..state.max_ddcs().min(12) {
                    let offset = 9 + ddc * 4;
                    let freq = u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
                    state.set_rx_freq_hz(ddc, freq);
                }

                let tx_freq = u32::from_be_bytes([buf[329], buf[330], buf[331], buf[332]]);
                state.set_tx_freq_hz(tx_freq);
                state.set_tx_drive_level(buf[345]);
            }
        }
    }
}

async fn run_tx_audio(socket: UdpSocket, shutdown: CancellationToken) {
    let mut buf = vec![0u8; IQ_PACKET_LEN];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv_from(&mut buf) => {
                if result.is_ok() {
                    tracing::debug!("protocol2: tx-audio received, discarded");
                }
            }
        }
    }
}

async fn run_tx_iq(
    socket: UdpSocket,
    state: Arc<RadioState>,
    echo: Arc<EchoBuffer>,
    config: RadioConfig,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; IQ_PACKET_LEN];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv_from(&mut buf) => {
                let Ok((len, peer)) = result else {
                    tracing::warn!("protocol2: tx-iq recv failed");
                    continue;
                };
                state.set_peer(peer);
                if len < 4 + 1440 {
                    tracing::debug!(len, "protocol2: short tx-iq packet");
                    continue;
                }
                if config.echo_enabled && state.ptt() {
                    let samples: Vec<Complex<f64>> = buf[4..4 + 1440].chunks_exact(6).map(unpack_iq_24).collect();
                    echo.record(&samples, state.tx_freq_hz());
                }
            }
        }
    }
}

fn build_hp_status(seq: u32, ptt: bool, tx_drive_level: u8) -> [u8; HP_STATUS_LEN] {
    let mut status = [0u8; HP_STATUS_LEN];
    status[0..4].copy_from_slice(&seq.to_be_bytes());
    status[4] = ptt as u8;
    status[5] = 0; // no ADC overload

    let power = if ptt { tx_drive_level as u16 * 257 } else { 0 };
    status[6..8].copy_from_slice(&power.to_be_bytes());
    status[14..16].copy_from_slice(&power.to_be_bytes());
    status[22..24].copy_from_slice(&(power / 4).to_be_bytes());
    status
}

/// Runs the 10 Hz high-priority status emitter from the same socket that
/// receives RX-specific config, as the wire spec puts both on port 1025.
async fn run_hp_status(socket: Arc<UdpSocket>, state: Arc<RadioState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut seq: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                let Some(peer) = state.peer() else { continue };
                let status = build_hp_status(seq, state.ptt(), state.tx_drive_level());
                seq = seq.wrapping_add(1);
                if let Err(error) = socket.send_to(&status, peer).await {
                    tracing::warn!(?error, "protocol2: hp status send failed");
                }
            }
        }
    }
}

/// Runs the 48 kHz all-zero mic stream from the same socket that receives
/// TX-specific config, as the wire spec puts both on port 1026.
async fn run_mic_stream(socket: Arc<UdpSocket>, state: Arc<RadioState>, shutdown: CancellationToken) {
    let period = Duration::from_secs_f64(MIC_SAMPLES_PER_FRAME as f64 / 48_000.0);
    let frame = [0u8; MIC_FRAME_LEN];
    let mut seq: u32 = 0;
    let mut next_tick = Instant::now();

    loop {
        if !state.running() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(20)) => continue,
            }
        }
        let Some(peer) = state.peer() else {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(20)) => continue,
            }
        };

        next_tick += period;
        let now = Instant::now();
        if now > next_tick + period {
            next_tick = now;
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep_until(next_tick) => {}
        }

        let mut out = frame;
        out[0..4].copy_from_slice(&seq.to_be_bytes());
        seq = seq.wrapping_add(1);
        if let Err(error) = socket.send_to(&out, peer).await {
            tracing::warn!(?error, "protocol2: mic frame send failed");
        }
    }
}

/// Builds and sends a single DDC's IQ stream from its own fixed-source-port
/// socket, gated on `running` and that DDC's index falling within
/// `n_active_ddc`.
#[allow(clippy::too_many_arguments)]
async fn run_ddc_stream(
    ddc: usize,
    socket: UdpSocket,
    state: Arc<RadioState>,
    echo: Arc<EchoBuffer>,
    config: RadioConfig,
    ddc0_sample_count: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    let mut signal = SignalGenerator::new(1, config.tone_hz, config.noise_level);
    let mut samples = vec![Complex::new(0.0, 0.0); IQ_SAMPLES_PER_FRAME];
    let mut packet = [0u8; IQ_PACKET_LEN];
    let mut seq: u32 = 0;
    let mut next_tick = Instant::now();

    loop {
        if ddc >= state.max_ddcs() || ddc >= state.n_active_ddc() || !state.running() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(10)) => continue,
            }
        }
        let Some(peer) = state.peer() else {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(10)) => continue,
            }
        };

        let sample_rate = state.sample_rate_hz();
        let period = Duration::from_secs_f64(IQ_SAMPLES_PER_FRAME as f64 / sample_rate as f64);

        next_tick += period;
        let now = Instant::now();
        if now > next_tick + period {
            next_tick = now;
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep_until(next_tick) => {}
        }

        if ddc == 0 && echo.has_playback() {
            echo.read_into(&mut samples, state.rx_freq_hz(0), sample_rate);
        } else {
            signal.generate_into(&mut samples, 0, sample_rate);
        }

        let timestamp = if ddc == 0 {
            ddc0_sample_count.fetch_add(IQ_SAMPLES_PER_FRAME as u64, Ordering::Relaxed)
        } else {
            ddc0_sample_count.load(Ordering::Relaxed)
        };

        build_ddc_packet(&mut packet, seq, timestamp, &samples);
        seq = seq.wrapping_add(1);

        let dest = SocketAddr::new(peer.ip(), DDC_BASE_PORT + ddc as u16 + DDC_DEST_OFFSET);
        if let Err(error) = socket.send_to(&packet, dest).await {
            tracing::warn!(?error, ddc, "protocol2: ddc iq send failed");
        }
    }
}

fn build_ddc_packet(packet: &mut [u8; IQ_PACKET_LEN], seq: u32, timestamp: u64, samples: &[Complex<f64>]) {
    packet[0..4].copy_from_slice(&seq.to_be_bytes());
    packet[4..12].copy_from_slice(&timestamp.to_be_bytes());
    packet[12..14].copy_from_slice(&BITS_PER_SAMPLE.to_be_bytes());
    packet[14..16].copy_from_slice(&(IQ_SAMPLES_PER_FRAME as u16).to_be_bytes());

    for (i, sample) in samples.iter().enumerate() {
        let offset = 16 + i * 6;
        packet[offset..offset + 6].copy_from_slice(&pack_iq_24(*sample));
    }
}
