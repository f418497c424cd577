use super::message::Envelope;
use super::request_response::BincodeCodec;
use libp2p::core::ProtocolName;
use serde::{Deserialize, Serialize};

pub const EXCHANGE_PROTOCOL_ID: &[u8] = b"/nano/chat/0.1";

#[derive(Clone)]
pub struct ExchangeProtocol;

impl ProtocolName for ExchangeProtocol {
    fn protocol_name(&self) -> &[u8] {
        EXCHANGE_PROTOCOL_ID
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum ExchangeResponse {
    /// Envelope was decoded and handed to the plugins
    Ack,
    /// Unknown opcode or undecodable payload
    Bad,
}

pub type ExchangeCodec = BincodeCodec<ExchangeProtocol, Envelope, ExchangeResponse>;
