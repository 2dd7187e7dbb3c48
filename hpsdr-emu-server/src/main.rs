use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::{eyre, Result};
use hpsdr_emu::{
    config::{parse_mac, HardwareKind, RadioConfig},
    ProtocolVersion,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Emulates an OpenHPSDR software-defined-radio transceiver over the network.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Which OpenHPSDR wire protocol to speak.
    #[arg(long, value_enum, default_value = "1")]
    protocol: Protocol,

    /// Hardware board to emulate.
    #[arg(long, value_enum, default_value = "hermes")]
    radio: Radio,

    /// MAC address to report at discovery, colon-separated hex.
    #[arg(long, default_value = "00:1C:C0:A2:00:01")]
    mac: String,

    /// Test tone frequency in Hz.
    #[arg(long, default_value_t = RadioConfig::DEFAULT_TONE_HZ)]
    freq: f64,

    /// Standard deviation of the Gaussian noise added to I and Q.
    #[arg(long, default_value_t = RadioConfig::DEFAULT_NOISE_LEVEL)]
    noise: f64,

    /// Record TX IQ during push-to-talk and replay it on RX with a
    /// frequency shift.
    #[arg(long)]
    echo: bool,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Protocol {
    #[value(name = "1")]
    V1,
    #[value(name = "2")]
    V2,
}

impl From<Protocol> for ProtocolVersion {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::V1 => ProtocolVersion::V1,
            Protocol::V2 => ProtocolVersion::V2,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum Radio {
    Atlas,
    Hermes,
    HermesIi,
    Angelia,
    Orion,
    #[value(name = "orion-mk2")]
    OrionMkIi,
    HermesLite,
    Saturn,
    #[value(name = "saturn-mk2")]
    SaturnMkIi,
}

impl From<Radio> for HardwareKind {
    fn from(value: Radio) -> Self {
        match value {
            Radio::Atlas => HardwareKind::Atlas,
            Radio::Hermes => HardwareKind::Hermes,
            Radio::HermesIi => HardwareKind::HermesII,
            Radio::Angelia => HardwareKind::Angelia,
            Radio::Orion => HardwareKind::Orion,
            Radio::OrionMkIi => HardwareKind::OrionMkII,
            Radio::HermesLite => HardwareKind::HermesLite,
            Radio::Saturn => HardwareKind::Saturn,
            Radio::SaturnMkIi => HardwareKind::SaturnMkII,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    }
    else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mac = parse_mac(&args.mac).map_err(|error| eyre!(error))?;
    let config = RadioConfig::new(args.radio.into(), mac)
        .with_tone_hz(args.freq)
        .with_noise_level(args.noise)
        .with_echo_enabled(args.echo);

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, draining sockets");
            signal_shutdown.cancel();
        }
    });

    match hpsdr_emu::run(config, args.protocol.into(), shutdown).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(error @ hpsdr_emu::Error::Bind(_)) => {
            tracing::error!(%error, "failed to bind");
            Ok(ExitCode::FAILURE)
        }
        Err(error) => Err(error.into()),
    }
}
