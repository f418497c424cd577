use super::message::{Opcode, Payload, WireMessage};
use super::plugin::{Plugin, PluginContext};
use super::{NetworkHandle, SendContext};
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use log::{debug, info};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: String,
    pub addrs: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// Sent to every newly connected peer
    Hello { listen_addrs: Vec<String> },
    /// Answer to `Hello`: the peers we know, minus the one asking
    Peers { peers: Vec<PeerRecord> },
}

impl WireMessage for DiscoveryMessage {
    const OPCODE: Opcode = Opcode::DISCOVERY;
    const NAME: &'static str = "discovery";

    fn into_payload(self) -> Payload {
        Payload::Discovery(self)
    }
}

fn parse_addrs(addrs: &[String]) -> Vec<Multiaddr> {
    addrs.iter().filter_map(|a| a.parse().ok()).collect()
}

/// Peer discovery: greets new connections with our listen addresses,
/// answers greetings with the known peers and dials peers it learns about.
#[derive(Default)]
pub struct DiscoveryPlugin;

impl DiscoveryPlugin {
    async fn on_hello(&self, ctx: &PluginContext, listen_addrs: &[String]) -> anyhow::Result<()> {
        let network = ctx.network();
        let sender = *ctx.sender();
        for address in parse_addrs(listen_addrs) {
            network.add_address(sender, address).await?;
        }

        let peers = network
            .peers()
            .await?
            .into_iter()
            .filter(|p| p.peer_id != sender && !p.addresses.is_empty())
            .map(|p| PeerRecord {
                peer_id: p.peer_id.to_base58(),
                addrs: p.addresses.iter().map(|a| a.to_string()).collect(),
            })
            .collect();
        network
            .notify(sender, SendContext::signed(), &DiscoveryMessage::Peers { peers })
            .await
    }

    async fn on_peers(&self, ctx: &PluginContext, records: &[PeerRecord]) -> anyhow::Result<()> {
        let network = ctx.network();
        let known = network.peers().await?;
        for record in records {
            let peer_id = match record.peer_id.parse::<PeerId>() {
                Ok(p) => p,
                Err(_) => {
                    debug!("(discovery) ignoring malformed peer id {}", record.peer_id);
                    continue;
                }
            };
            let connected = known.iter().any(|k| k.peer_id == peer_id && k.connected);
            if peer_id == network.peer_id() || connected {
                continue;
            }
            let addrs = parse_addrs(&record.addrs);
            for address in &addrs {
                network.add_address(peer_id, address.clone()).await?;
            }
            if let Some(address) = addrs.into_iter().next() {
                info!("Discovered {} at {}", peer_id, address);
                network.dial(address).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for DiscoveryPlugin {
    fn name(&self) -> &'static str {
        "discovery"
    }

    async fn on_receive(&self, ctx: &PluginContext) -> anyhow::Result<()> {
        match ctx.message() {
            Payload::Discovery(DiscoveryMessage::Hello { listen_addrs }) => {
                self.on_hello(ctx, listen_addrs).await
            }
            Payload::Discovery(DiscoveryMessage::Peers { peers }) => {
                self.on_peers(ctx, peers).await
            }
            _ => Ok(()),
        }
    }

    async fn on_peer_connected(
        &self,
        peer: PeerId,
        _address: Multiaddr,
        network: &NetworkHandle,
    ) -> anyhow::Result<()> {
        let listen_addrs = network
            .listen_addresses()
            .await?
            .iter()
            .map(|a| a.to_string())
            .collect();
        network
            .notify(peer, SendContext::signed(), &DiscoveryMessage::Hello { listen_addrs })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::message::{ChatMessage, MessageRegistry};
    use super::super::NetworkBuilder;
    use super::*;
    use std::time::Duration;

    fn registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register::<DiscoveryMessage>().unwrap();
        registry.register::<ChatMessage>().unwrap();
        registry
    }

    fn node() -> NetworkHandle {
        let network = NetworkBuilder::new()
            .address("tcp://127.0.0.1:0")
            .registry(registry())
            .add_plugin(DiscoveryPlugin)
            .build()
            .unwrap();
        let handle = network.handle();
        tokio::spawn(network.listen());
        handle
    }

    /// Polls until `handle` knows `peer` with at least one address, and
    /// optionally with a live connection.
    async fn knows(handle: &NetworkHandle, peer: PeerId, connected: bool) -> bool {
        for _ in 0..250 {
            let peers = handle.peers().await.unwrap();
            if peers.iter().any(|p| {
                p.peer_id == peer && !p.addresses.is_empty() && (p.connected || !connected)
            }) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn first_listen_address(handle: &NetworkHandle) -> String {
        for _ in 0..250 {
            if let Some(address) = handle.listen_addresses().await.unwrap().first() {
                return address.to_string();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("node never started listening");
    }

    #[tokio::test]
    async fn third_node_is_found_through_a_shared_peer() {
        let hub = node();
        let a = node();
        let b = node();

        let hub_address = first_listen_address(&hub).await;
        first_listen_address(&a).await;
        first_listen_address(&b).await;

        assert_eq!(a.bootstrap(&[hub_address.clone()]).await, 1);
        assert!(knows(&hub, a.peer_id(), false).await);

        assert_eq!(b.bootstrap(&[hub_address]).await, 1);

        // b learns about a from the hub and dials it
        assert!(knows(&b, a.peer_id(), true).await);
    }

    #[test]
    fn peers_message_skips_bad_addresses() {
        let addrs = vec![
            "/ip4/127.0.0.1/tcp/3000".to_string(),
            "nonsense".to_string(),
        ];
        assert_eq!(parse_addrs(&addrs).len(), 1);
    }
}
