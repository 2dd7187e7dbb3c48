//! Network emulation of an OpenHPSDR transceiver.
//!
//! This crate is the protocol state engine: synthetic per-channel IQ
//! generation, an echo/loopback buffer, and two independent UDP
//! wire-protocol servers (Protocol 1 and Protocol 2) that let a host SDR
//! application discover, configure, and stream from this emulator exactly
//! as it would a real radio.
//!
//! Everything outside the wire protocols and signal path — CLI parsing,
//! logging setup, process-lifetime signal handling — belongs to the
//! embedding binary (see `hpsdr-emu-server`), which builds a [`RadioConfig`]
//! and a [`CancellationToken`] and hands both to [`run`].

pub mod codec;
pub mod config;
pub mod echo;
pub mod error;
pub mod protocol1;
pub mod protocol2;
pub mod signal;
pub mod state;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

pub use crate::{
    config::{HardwareKind, RadioConfig},
    error::{BindError, ConfigError, Error},
};

/// Which OpenHPSDR wire protocol to speak. The two are independent servers;
/// a process runs exactly one, each with its own socket family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

/// Hardware generations that only ever shipped with Protocol 2 firmware.
/// Asking this emulator to pretend to be one of these over Protocol 1 is a
/// [`ConfigError::ProtocolMismatch`], not a silently-accepted combination.
const PROTOCOL2_ONLY: [HardwareKind; 5] = [
    HardwareKind::Angelia,
    HardwareKind::Orion,
    HardwareKind::OrionMkII,
    HardwareKind::Saturn,
    HardwareKind::SaturnMkII,
];

/// Validates `config` against `protocol`, binds the sockets that protocol
/// needs, and runs the corresponding server until `shutdown` is cancelled.
///
/// Returns once every task has exited, which — barring `send`/`recv`
/// failures, which are logged and swallowed internally per the error design
/// — only happens after `shutdown.cancel()`.
pub async fn run(config: RadioConfig, protocol: ProtocolVersion, shutdown: CancellationToken) -> Result<(), Error> {
    validate_config(&config, protocol)?;

    match protocol {
        ProtocolVersion::V1 => {
            let socket = bind_udp(1024).await?;
            protocol1::Protocol1Server::new(socket, config)
                .with_shutdown(shutdown)
                .serve()
                .await
        }
        ProtocolVersion::V2 => {
            let sockets = bind_protocol2_sockets(config.hw.max_ddcs()).await?;
            protocol2::Protocol2Server::new(sockets, config)
                .with_shutdown(shutdown)
                .serve()
                .await
        }
    }
}

fn validate_config(config: &RadioConfig, protocol: ProtocolVersion) -> Result<(), ConfigError> {
    if protocol == ProtocolVersion::V1 && PROTOCOL2_ONLY.contains(&config.hw) {
        return Err(ConfigError::ProtocolMismatch { hw: config.hw, protocol: 1 });
    }
    Ok(())
}

async fn bind_udp(port: u16) -> Result<UdpSocket, BindError> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    UdpSocket::bind(addr)
        .await
        .map_err(|source| BindError::Udp { addr, source })
}

async fn bind_protocol2_sockets(max_ddcs: usize) -> Result<protocol2::Protocol2Sockets, BindError> {
    let discovery = bind_udp(1024).await?;
    let rx_config = bind_udp(1025).await?;
    let tx_config = bind_udp(1026).await?;
    let hp_command = bind_udp(1027).await?;
    let tx_audio = bind_udp(1028).await?;
    let tx_iq = bind_udp(1029).await?;

    let mut ddc = Vec::with_capacity(max_ddcs);
    for d in 0..max_ddcs {
        ddc.push(bind_udp(1035 + d as u16).await?);
    }

    Ok(protocol2::Protocol2Sockets {
        discovery,
        rx_config,
        tx_config,
        hp_command,
        tx_audio,
        tx_iq,
        ddc,
    })
}
