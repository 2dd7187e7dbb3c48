//! End-to-end exercises of discovery, start/stop, control, and echo
//! behavior, driven over real loopback UDP sockets against a live
//! [`hpsdr_emu::run`] instance.
//!
//! All scenarios for one protocol share a single server instance and run
//! sequentially in one `#[tokio::test]`, since Protocol 1 always binds a
//! fixed port (1024) and a second concurrently-running test in this process
//! would fail to bind.

use std::time::Duration;

use hpsdr_emu::{
    codec::unpack_iq_24,
    config::{HardwareKind, RadioConfig},
    ProtocolVersion,
};
use tokio::{net::UdpSocket, time::timeout};
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_millis(200);

async fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind client socket");
    socket.connect("127.0.0.1:1024").await.expect("connect to server");
    socket
}

async fn recv(socket: &UdpSocket, buf: &mut [u8]) -> usize {
    timeout(RECV_TIMEOUT, socket.recv(buf))
        .await
        .expect("recv timed out")
        .expect("recv failed")
}

#[tokio::test]
async fn protocol1_end_to_end() {
    let shutdown = CancellationToken::new();
    let config = RadioConfig::new(HardwareKind::Hermes, [0x00, 0x1C, 0xC0, 0xA1, 0xB2, 0xC3]);
    let server = tokio::spawn(hpsdr_emu::run(config, ProtocolVersion::V1, shutdown.clone()));
    // let the server bind before the client starts sending.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let socket = client().await;
    let mut buf = [0u8; 2048];

    // discovery.
    let mut discovery = vec![0u8; 63];
    discovery[0..3].copy_from_slice(&[0xEF, 0xFE, 0x02]);
    socket.send(&discovery).await.unwrap();
    let len = recv(&socket, &mut buf).await;
    assert_eq!(len, 60);
    assert_eq!(buf[0], 0xEF);
    assert_eq!(buf[1], 0xFE);
    assert_eq!(buf[2], 0x02);
    assert_eq!(buf[10], 1); // Hermes board code
    assert_eq!(buf[11], 0); // protocol version
    assert_eq!(buf[20], 4); // Hermes max_ddcs

    // start, 1 DDC stream.
    socket.send(&[0xEF, 0xFE, 0x04, 0x01]).await.unwrap();
    let len = recv(&socket, &mut buf).await;
    assert_eq!(len, 1032);
    assert_eq!(u32::from_be_bytes(buf[4..8].try_into().unwrap()), 0);
    assert_eq!(&buf[8..11], &[0x7F, 0x7F, 0x7F]);

    let spr = 63;
    let samples: Vec<_> = (0..spr)
        .map(|k| unpack_iq_24(&buf[8 + 8 + k * 8..8 + 8 + k * 8 + 6]))
        .collect();
    let mean_sq: f64 = samples.iter().map(|s| s.norm_sqr()).sum::<f64>() / spr as f64;
    let rms = mean_sq.sqrt() / std::f64::consts::SQRT_2;
    assert!((rms - std::f64::consts::FRAC_1_SQRT_2).abs() < 0.05, "rms={rms}");

    // sample rate + DDC count change: C1=0x02 (192k), C4 bits3..5=001 (2 DDCs).
    let mut packet = vec![0u8; 1032];
    packet[0..4].copy_from_slice(&[0xEF, 0xFE, 0x01, 0x06]);
    packet[8..11].copy_from_slice(&[0x7F, 0x7F, 0x7F]);
    packet[11..16].copy_from_slice(&[0x00, 0x02, 0x00, 0x00, 0b0000_1000]);
    packet[8 + 512..8 + 512 + 3].copy_from_slice(&[0x7F, 0x7F, 0x7F]);
    socket.send(&packet).await.unwrap();

    // poll packets until the new 2-DDC block layout takes effect: once it
    // does, the second DDC's slot (bytes 6..12 of the first 14-byte block)
    // carries real tone samples instead of being absent entirely.
    let mut saw_second_ddc = false;
    for _ in 0..20 {
        let len = recv(&socket, &mut buf).await;
        assert_eq!(len, 1032);
        let block = &buf[16..30];
        let ddc0 = unpack_iq_24(&block[0..6]);
        let ddc1 = unpack_iq_24(&block[6..12]);
        if ddc0.norm() > 0.1 && ddc1.norm() > 0.1 {
            saw_second_ddc = true;
            break;
        }
    }
    assert!(saw_second_ddc, "expected a 2-DDC packet after the sample-rate/DDC-count command");

    // control-response rotor cycles 0x00, 0x08, 0x10, 0x18 in order.
    let mut addrs = Vec::new();
    while addrs.len() < 8 {
        let len = recv(&socket, &mut buf).await;
        assert_eq!(len, 1032);
        addrs.push(buf[8 + 3] & 0x7E);
        addrs.push(buf[8 + 512 + 3] & 0x7E);
    }
    // the rotor is shared across every sub-frame emitted by the server, so
    // any 4 consecutive entries form one full cycle.
    let start = addrs.iter().position(|&a| a == 0x00).expect("rotor includes 0x00");
    let cycle: Vec<u8> = addrs[start..start + 4].to_vec();
    assert_eq!(cycle, vec![0x00, 0x08, 0x10, 0x18]);

    shutdown.cancel();
    server.await.expect("server task panicked").expect("server returned error");
}

#[tokio::test]
async fn protocol1_echo_round_trip() {
    let shutdown = CancellationToken::new();
    let config = RadioConfig::new(HardwareKind::Hermes, [0x00, 0x1C, 0xC0, 0xA1, 0xB2, 0xC5])
        .with_echo_enabled(true)
        .with_noise_level(0.0);
    let server = tokio::spawn(hpsdr_emu::run(config, ProtocolVersion::V1, shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(30)).await;

    let socket = client().await;
    let mut buf = [0u8; 2048];

    // discovery first, so the server learns our address.
    let mut discovery = vec![0u8; 63];
    discovery[0..3].copy_from_slice(&[0xEF, 0xFE, 0x02]);
    socket.send(&discovery).await.unwrap();
    recv(&socket, &mut buf).await;

    socket.send(&[0xEF, 0xFE, 0x04, 0x01]).await.unwrap();
    recv(&socket, &mut buf).await;

    // set TX VFO to 7.100 MHz (matches the default RX0 frequency, so the
    // echo shift is zero and only the attenuation applies).
    let mut tx_vfo = vec![0u8; 1032];
    tx_vfo[0..4].copy_from_slice(&[0xEF, 0xFE, 0x01, 0x06]);
    tx_vfo[8..11].copy_from_slice(&[0x7F, 0x7F, 0x7F]);
    tx_vfo[11..16].copy_from_slice(&[0x02, 0x00, 0x6C, 0xD3, 0x60]); // 0x006CD360 = 7_100_000
    tx_vfo[8 + 512..8 + 512 + 3].copy_from_slice(&[0x7F, 0x7F, 0x7F]);
    socket.send(&tx_vfo).await.unwrap();
    recv(&socket, &mut buf).await;

    // PTT on, send a few packets of host TX IQ encoding a 500 Hz tone.
    let tone: Vec<f64> = (0..256).map(|n| (std::f64::consts::TAU * 500.0 * n as f64 / 48_000.0).sin()).collect();
    for chunk in tone.chunks(63) {
        let mut p = vec![0u8; 1032];
        p[0..4].copy_from_slice(&[0xEF, 0xFE, 0x01, 0x06]);
        p[8..11].copy_from_slice(&[0x7F, 0x7F, 0x7F]);
        p[11] = 0x01; // C0 address 0x00, PTT bit set
        p[8 + 512..8 + 512 + 3].copy_from_slice(&[0x7F, 0x7F, 0x7F]);
        p[8 + 512 + 3] = 0x01; // mirror the PTT bit in sub-frame B so PTT
                                // doesn't fall until the explicit "off" packet
        let payload = &mut p[16..16 + 504];
        for (k, &sample) in chunk.iter().enumerate() {
            let packed = hpsdr_emu::codec::pack_iq_24(num_complex::Complex::new(sample, 0.0));
            payload[k * 8..k * 8 + 6].copy_from_slice(&packed);
        }
        socket.send(&p).await.unwrap();
        recv(&socket, &mut buf).await;
    }

    // PTT off commits the recording.
    let mut ptt_off = vec![0u8; 1032];
    ptt_off[0..4].copy_from_slice(&[0xEF, 0xFE, 0x01, 0x06]);
    ptt_off[8..11].copy_from_slice(&[0x7F, 0x7F, 0x7F]);
    ptt_off[8 + 512..8 + 512 + 3].copy_from_slice(&[0x7F, 0x7F, 0x7F]);
    socket.send(&ptt_off).await.unwrap();
    recv(&socket, &mut buf).await;

    // the next few packets' DDC0 samples should now be the attenuated echo.
    let mut found = false;
    for _ in 0..10 {
        let len = recv(&socket, &mut buf).await;
        assert_eq!(len, 1032);
        let sample = unpack_iq_24(&buf[16..22]);
        if sample.norm() > 0.0 {
            // attenuated by ~1e-4 relative to the recorded unit-amplitude tone.
            assert!(sample.norm() < 1e-3, "echoed sample too large: {sample:?}");
            found = true;
            break;
        }
    }
    assert!(found, "expected a non-zero echoed sample");

    shutdown.cancel();
    server.await.expect("server task panicked").expect("server returned error");
}
