use super::discovery::DiscoveryMessage;
use libp2p::{identity::Keypair, identity::PublicKey, PeerId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use thiserror::Error;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u32);

impl Opcode {
    pub const DISCOVERY: Opcode = Opcode(1);
    pub const CHAT: Opcode = Opcode(1000);
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "opcode({})", self.0)
    }
}

/// A message kind that can travel inside an [`Envelope`].
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {
    const OPCODE: Opcode;
    const NAME: &'static str;

    fn into_payload(self) -> Payload;
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub message: String,
}

impl WireMessage for ChatMessage {
    const OPCODE: Opcode = Opcode::CHAT;
    const NAME: &'static str = "chat";

    fn into_payload(self) -> Payload {
        Payload::Chat(self)
    }
}

/// Decoded form of every registered message kind. Plugins match on it and
/// ignore the variants they don't handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Chat(ChatMessage),
    Discovery(DiscoveryMessage),
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Protobuf encoded public key of the signer
    pub public_key: Vec<u8>,
    pub bytes: Vec<u8>,
}

/// What actually goes over the wire.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub signature: Option<Signature>,
}

impl Envelope {
    pub fn new<M: WireMessage>(message: &M) -> Result<Self, bincode::Error> {
        Ok(Envelope {
            opcode: M::OPCODE,
            payload: bincode::serialize(message)?,
            signature: None,
        })
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.payload.len());
        bytes.extend_from_slice(&self.opcode.0.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn sign(mut self, keypair: &Keypair) -> anyhow::Result<Self> {
        let bytes = keypair.sign(&self.signing_bytes())?;
        self.signature = Some(Signature {
            public_key: keypair.public().to_protobuf_encoding(),
            bytes,
        });
        Ok(self)
    }

    /// True only if the envelope carries a valid signature made by `peer`.
    pub fn is_signed_by(&self, peer: &PeerId) -> bool {
        let signature = match &self.signature {
            Some(s) => s,
            None => return false,
        };
        let public_key = match PublicKey::from_protobuf_encoding(&signature.public_key) {
            Ok(k) => k,
            Err(_) => return false,
        };
        public_key.to_peer_id() == *peer
            && public_key.verify(&self.signing_bytes(), &signature.bytes)
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{0} is already registered as `{1}`")]
    Duplicate(Opcode, &'static str),
    #[error("{0} is not registered")]
    Unknown(Opcode),
    #[error("failed to decode `{name}` payload: {source}")]
    Decode {
        name: &'static str,
        #[source]
        source: bincode::Error,
    },
}

type Decoder = fn(&[u8]) -> Result<Payload, bincode::Error>;

fn decode_as<M: WireMessage>(bytes: &[u8]) -> Result<Payload, bincode::Error> {
    Ok(bincode::deserialize::<M>(bytes)?.into_payload())
}

/// Maps opcodes to decodable message kinds.
#[derive(Clone, Default)]
pub struct MessageRegistry {
    decoders: HashMap<Opcode, (&'static str, Decoder)>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: WireMessage>(&mut self) -> Result<(), RegistryError> {
        if let Some((name, _)) = self.decoders.get(&M::OPCODE) {
            return Err(RegistryError::Duplicate(M::OPCODE, *name));
        }
        self.decoders
            .insert(M::OPCODE, (M::NAME, decode_as::<M> as Decoder));
        Ok(())
    }

    pub fn is_registered(&self, opcode: Opcode) -> bool {
        self.decoders.contains_key(&opcode)
    }

    pub fn decode(&self, envelope: &Envelope) -> Result<Payload, RegistryError> {
        let (name, decoder) = *self
            .decoders
            .get(&envelope.opcode)
            .ok_or(RegistryError::Unknown(envelope.opcode))?;
        decoder(&envelope.payload).map_err(|source| RegistryError::Decode { name, source })
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.decoders.iter().map(|(op, (name, _))| (op, name)))
            .finish()
    }
}
