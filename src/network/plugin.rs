use super::message::Payload;
use super::NetworkHandle;
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};

/// Everything a plugin gets to see about one inbound message.
pub struct PluginContext {
    message: Payload,
    sender: PeerId,
    sender_address: Option<Multiaddr>,
    signed: bool,
    network: NetworkHandle,
}

impl PluginContext {
    pub fn new(
        message: Payload,
        sender: PeerId,
        sender_address: Option<Multiaddr>,
        signed: bool,
        network: NetworkHandle,
    ) -> Self {
        Self {
            message,
            sender,
            sender_address,
            signed,
            network,
        }
    }

    pub fn message(&self) -> &Payload {
        &self.message
    }

    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// Address of the connection the message arrived on, if still known
    pub fn sender_address(&self) -> Option<&Multiaddr> {
        self.sender_address.as_ref()
    }

    /// Whether the envelope carried a valid signature by `sender`
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }
}

/// Behavioural extension of the network. Plugins are invoked in
/// registration order, one inbound message at a time, from a dispatch
/// task separate from the swarm loop.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once per inbound message of any registered type.
    async fn on_receive(&self, ctx: &PluginContext) -> anyhow::Result<()>;

    async fn on_peer_connected(
        &self,
        _peer: PeerId,
        _address: Multiaddr,
        _network: &NetworkHandle,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
