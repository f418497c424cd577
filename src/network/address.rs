use libp2p::{multiaddr::Protocol, Multiaddr};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    #[error("address `{0}` is not of the form protocol://host:port")]
    Malformed(String),
    #[error("transport protocol `{0}` is not supported (only tcp)")]
    UnsupportedProtocol(String),
    #[error("invalid port in `{0}`")]
    InvalidPort(String),
    #[error("invalid multiaddr `{0}`")]
    InvalidMultiaddr(String),
}

/// `protocol://host:port`
pub fn format_address(protocol: &str, host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("{}://[{}]:{}", protocol, host, port)
    } else {
        format!("{}://{}:{}", protocol, host, port)
    }
}

/// Turns `protocol://host:port` (or a literal multiaddr) into a multiaddr.
/// Hosts that are neither IPs nor `localhost` become `/dns` components,
/// which can be dialed but not listened on.
pub fn parse_address(address: &str) -> Result<Multiaddr, AddressError> {
    let address = address.trim();
    if address.starts_with('/') {
        return address
            .parse()
            .map_err(|_| AddressError::InvalidMultiaddr(address.to_string()));
    }

    let (protocol, rest) = address
        .split_once("://")
        .ok_or_else(|| AddressError::Malformed(address.to_string()))?;
    if !protocol.eq_ignore_ascii_case("tcp") {
        return Err(AddressError::UnsupportedProtocol(protocol.to_string()));
    }

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| AddressError::Malformed(address.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| AddressError::InvalidPort(address.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(AddressError::Malformed(address.to_string()));
    }

    let mut multiaddr = Multiaddr::empty();
    if host.eq_ignore_ascii_case("localhost") {
        multiaddr.push(Protocol::Ip4([127, 0, 0, 1].into()));
    } else {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => multiaddr.push(Protocol::Ip4(ip)),
            Ok(IpAddr::V6(ip)) => multiaddr.push(Protocol::Ip6(ip)),
            Err(_) => multiaddr.push(Protocol::Dns(host.to_string().into())),
        }
    }
    multiaddr.push(Protocol::Tcp(port));
    Ok(multiaddr)
}
