use std::net::SocketAddr;

/// Errors that can occur while assembling a [`crate::config::RadioConfig`].
///
/// These are fatal: the caller should report them and exit before any socket
/// is bound.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("hardware {hw:?} does not support protocol {protocol} (Angelia and newer require protocol 2 firmware semantics)")]
    ProtocolMismatch { hw: crate::config::HardwareKind, protocol: u8 },

    #[error("malformed MAC address: {0}")]
    MalformedMac(String),
}

/// Errors binding the UDP sockets a protocol server needs.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Udp {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error returned by [`crate::run`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),
}
