use super::ledger::SnapshotFormat;
use super::network::address::{format_address, parse_address, AddressError};
use clap::Parser;
use libp2p::identity::{ed25519, Keypair};
use std::{fs, io, path::PathBuf};
use thiserror::Error;

#[derive(Parser, Debug, Clone)]
#[command(name = "nano", about = "Peer-to-peer chat node that keeps a balance ledger")]
pub struct Args {
    /// port to listen to
    #[arg(long, default_value_t = 3000)]
    pub port: u16,

    /// host to listen to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// protocol to use (only tcp)
    #[arg(long, default_value = "tcp")]
    pub protocol: String,

    /// comma separated peers to connect to
    #[arg(long, default_value = "")]
    pub peers: String,

    /// hex encoded ed25519 secret key; a fresh key is generated if absent
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// host used when a recipient is given as a bare port
    #[arg(long, default_value = "127.0.0.1")]
    pub recipient_host: String,

    /// print ledger snapshots as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid bind address: {0}")]
    Address(#[from] AddressError),
    #[error("failed to read key file: {0}")]
    KeyFile(#[from] io::Error),
    #[error("key file is not hex: {0}")]
    KeyHex(#[from] hex::FromHexError),
    #[error("key file does not hold an ed25519 secret key: {0}")]
    Key(#[from] libp2p::identity::error::DecodingError),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `protocol://host:port`
    pub bind_address: String,
    pub peers: Vec<String>,
    pub key_file: Option<PathBuf>,
    pub recipient_host: String,
    pub snapshot_format: SnapshotFormat,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let bind_address = format_address(&args.protocol, &args.host, args.port);
        parse_address(&bind_address)?;

        Ok(Config {
            bind_address,
            peers: split_peers(&args.peers),
            key_file: args.key_file,
            recipient_host: args.recipient_host,
            snapshot_format: if args.json {
                SnapshotFormat::Json
            } else {
                SnapshotFormat::Plain
            },
        })
    }

    pub fn keypair(&self) -> Result<Keypair, ConfigError> {
        match &self.key_file {
            Some(path) => load_keypair(&fs::read_to_string(path)?),
            None => Ok(Keypair::generate_ed25519()),
        }
    }
}

pub fn split_peers(peers: &str) -> Vec<String> {
    peers
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Parses a hex encoded 32 byte ed25519 secret key.
pub fn load_keypair(hex_secret: &str) -> Result<Keypair, ConfigError> {
    let mut bytes = hex::decode(hex_secret.trim())?;
    let secret = ed25519::SecretKey::from_bytes(&mut bytes)?;
    Ok(Keypair::Ed25519(secret.into()))
}

pub fn public_key_hex(keypair: &Keypair) -> String {
    match keypair {
        Keypair::Ed25519(keypair) => hex::encode(keypair.public().encode()),
        other => hex::encode(other.public().to_protobuf_encoding()),
    }
}

/// A bare port means a node on `recipient_host`; everything else (peer id,
/// multiaddr, `protocol://host:port`) is passed through.
pub fn resolve_recipient(recipient: &str, recipient_host: &str) -> String {
    match recipient.parse::<u16>() {
        Ok(port) => format_address("tcp", recipient_host, port),
        Err(_) => recipient.to_string(),
    }
}
