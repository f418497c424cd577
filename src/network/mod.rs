pub mod address;
pub mod discovery;
pub mod exchange;
pub mod message;
pub mod plugin;
mod request_response;

use self::address::parse_address;
use self::exchange::{ExchangeCodec, ExchangeProtocol, ExchangeResponse};
use self::message::{Envelope, MessageRegistry, WireMessage};
use self::plugin::{Plugin, PluginContext};
use anyhow::{anyhow, Context};
use futures::StreamExt;
use libp2p::{
    core::{
        muxing::StreamMuxerBox,
        transport::{upgrade::Version, Boxed},
        upgrade::SelectUpgrade,
    },
    dns::TokioDnsConfig,
    identity::Keypair,
    mplex::MplexConfig,
    noise,
    request_response::{
        ProtocolSupport, RequestId, RequestResponse, RequestResponseEvent, RequestResponseMessage,
        ResponseChannel,
    },
    swarm::{DialError, SwarmBuilder, SwarmEvent},
    tcp::TokioTcpConfig,
    yamux::YamuxConfig,
    Multiaddr, NetworkBehaviour, PeerId, Swarm, Transport,
};
use log::{debug, error, info, warn};
use std::{collections::HashMap, fmt, time::Duration};
use tokio::{
    io, select,
    sync::{mpsc, oneshot},
};

/// How long `client` waits for a fresh connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(NetworkBehaviour)]
#[behaviour(out_event = "BehaviourEvent", event_process = false)]
struct Behaviour {
    exchange: RequestResponse<ExchangeCodec>,
}

impl Behaviour {
    fn new() -> Self {
        let exchange = RequestResponse::new(
            ExchangeCodec::default(),
            std::iter::once((ExchangeProtocol, ProtocolSupport::Full)),
            Default::default(),
        );

        Behaviour { exchange }
    }
}

pub enum BehaviourEvent {
    Exchange(RequestResponseEvent<Envelope, ExchangeResponse>),
}

impl From<RequestResponseEvent<Envelope, ExchangeResponse>> for BehaviourEvent {
    fn from(event: RequestResponseEvent<Envelope, ExchangeResponse>) -> Self {
        BehaviourEvent::Exchange(event)
    }
}

pub struct CustomExecutor;
impl libp2p::core::Executor for CustomExecutor {
    fn exec(
        &self,
        future: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'static + Send>>,
    ) {
        tokio::task::spawn(future);
    }
}

/// Uses TCP encrypted using noise DH and MPlex for multiplexing
pub fn build_transport(identity_keypair: &Keypair) -> io::Result<Boxed<(PeerId, StreamMuxerBox)>> {
    // noise config
    let keypair = noise::Keypair::<noise::X25519>::new()
        .into_authentic(identity_keypair)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let noise_config = noise::NoiseConfig::xx(keypair).into_authenticated();

    Ok(TokioDnsConfig::system(TokioTcpConfig::new().nodelay(true))?
        .upgrade(Version::V1)
        .authenticate(noise_config)
        .multiplex(SelectUpgrade::new(
            YamuxConfig::default(),
            MplexConfig::new(),
        ))
        .timeout(Duration::from_secs(20))
        .map(|(peer_id, muxer), _| (peer_id, StreamMuxerBox::new(muxer)))
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
        .boxed())
}

/// Options for a single outbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendContext {
    pub sign: bool,
}

impl SendContext {
    pub fn signed() -> Self {
        Self { sign: true }
    }

    pub fn unsigned() -> Self {
        Self { sign: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub connected: bool,
    pub addresses: Vec<Multiaddr>,
}

#[derive(Debug)]
pub enum Target {
    Peer(PeerId),
    Address(Multiaddr),
}

#[derive(Debug)]
pub enum Command {
    Dial {
        address: Multiaddr,
    },
    Connect {
        target: Target,
        sender: oneshot::Sender<anyhow::Result<PeerId>>,
    },
    Send {
        peer_id: PeerId,
        envelope: Envelope,
        /// `None` for fire and forget
        sender: Option<oneshot::Sender<anyhow::Result<ExchangeResponse>>>,
    },
    AddAddress {
        peer_id: PeerId,
        address: Multiaddr,
    },
    Peers {
        sender: oneshot::Sender<Vec<PeerInfo>>,
    },
    ListenAddrs {
        sender: oneshot::Sender<Vec<Multiaddr>>,
    },
}

enum Inbound {
    Message(PluginContext),
    PeerConnected { peer_id: PeerId, address: Multiaddr },
}

/// Collects identity, bind address, message registry and plugins, then
/// builds a listening [`Network`].
#[derive(Default)]
pub struct NetworkBuilder {
    keypair: Option<Keypair>,
    address: Option<String>,
    registry: MessageRegistry,
    plugins: Vec<Box<dyn Plugin>>,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// `protocol://host:port`, see [`address::format_address`]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Plugins see inbound messages in the order they were added.
    pub fn add_plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn build(self) -> anyhow::Result<Network> {
        let keypair = self.keypair.unwrap_or_else(Keypair::generate_ed25519);
        let address = self
            .address
            .ok_or_else(|| anyhow!("no bind address configured"))?;
        let listen_on = parse_address(&address)?;

        let peer_id = keypair.public().to_peer_id();
        let transport = build_transport(&keypair)?;
        let mut swarm = SwarmBuilder::new(transport, Behaviour::new(), peer_id)
            .executor(Box::new(CustomExecutor))
            .build();

        swarm
            .listen_on(listen_on.clone())
            .with_context(|| format!("failed to listen on {}", listen_on))?;
        debug!("(swarm) listening on {}", listen_on);

        let (command_sender, command_receiver) = mpsc::channel(32);
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();

        Ok(Network {
            keypair,
            peer_id,
            swarm,
            registry: self.registry,
            plugins: self.plugins,

            command_sender,
            command_receiver,
            inbound_sender,
            inbound_receiver: Some(inbound_receiver),

            listen_addrs: Vec::new(),
            connected: Default::default(),
            address_book: Default::default(),
            pending_outbound: Default::default(),
            pending_dials: Vec::new(),
        })
    }
}

pub struct Network {
    /// keypair of the node
    keypair: Keypair,
    peer_id: PeerId,

    swarm: Swarm<Behaviour>,
    registry: MessageRegistry,
    plugins: Vec<Box<dyn Plugin>>,

    command_sender: mpsc::Sender<Command>,
    command_receiver: mpsc::Receiver<Command>,
    inbound_sender: mpsc::UnboundedSender<Inbound>,
    /// Handed to the dispatch task once `listen` starts
    inbound_receiver: Option<mpsc::UnboundedReceiver<Inbound>>,

    listen_addrs: Vec<Multiaddr>,
    /// Remote address of the first live connection to each peer
    connected: HashMap<PeerId, Multiaddr>,
    /// Dialable addresses learned from outbound connections and discovery
    address_book: HashMap<PeerId, Vec<Multiaddr>>,

    pending_outbound:
        HashMap<(PeerId, RequestId), oneshot::Sender<anyhow::Result<ExchangeResponse>>>,
    pending_dials: Vec<(Multiaddr, oneshot::Sender<anyhow::Result<PeerId>>)>,
}

impl Network {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn handle(&self) -> NetworkHandle {
        NetworkHandle {
            peer_id: self.peer_id,
            keypair: self.keypair.clone(),
            command_sender: self.command_sender.clone(),
        }
    }

    /// Serves inbound connections and commands until the process exits.
    /// Plugins run on their own task so they can freely call back into the
    /// network through their handle.
    pub async fn listen(mut self) {
        if let Some(inbound_receiver) = self.inbound_receiver.take() {
            let plugins = std::mem::take(&mut self.plugins);
            tokio::spawn(dispatch(plugins, inbound_receiver, self.handle()));
        }

        loop {
            select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(val) => {
                            self.command_handler(val)
                        },
                        None => {return},
                    }
                }
                swarm_event = self.swarm.next() => {
                    match swarm_event {
                        Some(event) => {
                            self.swarm_event_handler(event);
                        }
                        None => {return}
                    }
                }
            }
        }
    }

    fn known_peer_at(&self, address: &Multiaddr) -> Option<PeerId> {
        self.connected
            .iter()
            .find(|(_, a)| *a == address)
            .map(|(p, _)| *p)
            .or_else(|| {
                self.address_book
                    .iter()
                    .find(|(_, addrs)| addrs.contains(address))
                    .map(|(p, _)| *p)
            })
    }

    fn remember_address(&mut self, peer_id: PeerId, address: Multiaddr) {
        if peer_id == self.peer_id {
            return;
        }
        let addrs = self.address_book.entry(peer_id).or_default();
        if !addrs.contains(&address) {
            addrs.push(address.clone());
            self.swarm
                .behaviour_mut()
                .exchange
                .add_address(&peer_id, address);
        }
    }

    /// Answers every waiting `client` whose address matches, and forgets
    /// the ones that stopped waiting.
    fn fail_pending_dials(&mut self, matches: impl Fn(&Multiaddr) -> bool, error: &DialError) {
        let (failed, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_dials)
            .into_iter()
            .filter(|(_, sender)| !sender.is_closed())
            .partition(|(a, _)| matches(a));
        self.pending_dials = pending;
        for (address, sender) in failed {
            let _ = sender.send(Err(anyhow!("could not connect to {}: {}", address, error)));
        }
    }

    fn peer_infos(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerId> = self
            .connected
            .keys()
            .chain(self.address_book.keys())
            .copied()
            .collect();
        peers.sort_by_key(|p| p.to_bytes());
        peers.dedup();
        peers
            .into_iter()
            .map(|peer_id| PeerInfo {
                peer_id,
                connected: self.connected.contains_key(&peer_id),
                addresses: self
                    .address_book
                    .get(&peer_id)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect()
    }

    fn command_handler(&mut self, command: Command) {
        match command {
            Command::Dial { address } => {
                if let Err(e) = self.swarm.dial(address.clone()) {
                    warn!("(swarm) failed to dial {}: {}", address, e);
                }
            }
            Command::Connect { target, sender } => match target {
                Target::Peer(peer_id) => {
                    let result = if peer_id == self.peer_id {
                        Err(anyhow!("{} is our own peer id", peer_id))
                    } else if self.connected.contains_key(&peer_id)
                        || self.address_book.contains_key(&peer_id)
                    {
                        Ok(peer_id)
                    } else {
                        Err(anyhow!("no known address for peer {}", peer_id))
                    };
                    let _ = sender.send(result);
                }
                Target::Address(address) => {
                    if self.listen_addrs.contains(&address) {
                        let _ = sender.send(Err(anyhow!("{} is our own address", address)));
                    } else if let Some(peer_id) = self.known_peer_at(&address) {
                        let _ = sender.send(Ok(peer_id));
                    } else {
                        match self.swarm.dial(address.clone()) {
                            Ok(()) => self.pending_dials.push((address, sender)),
                            Err(e) => {
                                let _ = sender.send(Err(e.into()));
                            }
                        }
                    }
                }
            },
            Command::Send {
                peer_id,
                envelope,
                sender,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .exchange
                    .send_request(&peer_id, envelope);
                if let Some(sender) = sender {
                    self.pending_outbound.insert((peer_id, request_id), sender);
                }
            }
            Command::AddAddress { peer_id, address } => self.remember_address(peer_id, address),
            Command::Peers { sender } => {
                let _ = sender.send(self.peer_infos());
            }
            Command::ListenAddrs { sender } => {
                let _ = sender.send(self.listen_addrs.clone());
            }
        }
    }

    fn inbound_request_handler(
        &mut self,
        peer: PeerId,
        envelope: Envelope,
        channel: ResponseChannel<ExchangeResponse>,
    ) {
        let response = match self.registry.decode(&envelope) {
            Ok(payload) => {
                let ctx = PluginContext::new(
                    payload,
                    peer,
                    self.connected.get(&peer).cloned(),
                    envelope.is_signed_by(&peer),
                    self.handle(),
                );
                if self.inbound_sender.send(Inbound::Message(ctx)).is_err() {
                    error!("(exchange) plugin dispatcher is gone, dropping message");
                }
                ExchangeResponse::Ack
            }
            Err(e) => {
                warn!("(exchange) dropping message from {}: {}", peer, e);
                ExchangeResponse::Bad
            }
        };

        if self
            .swarm
            .behaviour_mut()
            .exchange
            .send_response(channel, response)
            .is_err()
        {
            debug!("(exchange) {} went away before the response was sent", peer);
        }
    }

    fn exchange_event_handler(&mut self, event: RequestResponseEvent<Envelope, ExchangeResponse>) {
        match event {
            RequestResponseEvent::Message { peer, message } => match message {
                RequestResponseMessage::Request {
                    request, channel, ..
                } => self.inbound_request_handler(peer, request, channel),
                RequestResponseMessage::Response {
                    request_id,
                    response,
                } => {
                    if let Some(sender) = self.pending_outbound.remove(&(peer, request_id)) {
                        let _ = sender.send(Ok(response));
                    }
                }
            },
            RequestResponseEvent::OutboundFailure {
                peer,
                request_id,
                error,
            } => {
                warn!(
                    "(exchange) request {} to {} failed: {}",
                    request_id, peer, error
                );
                if let Some(sender) = self.pending_outbound.remove(&(peer, request_id)) {
                    let _ = sender.send(Err(error.into()));
                }
            }
            RequestResponseEvent::InboundFailure {
                peer,
                request_id,
                error,
            } => {
                debug!(
                    "(exchange) inbound request {} from {} failed: {}",
                    request_id, peer, error
                );
            }
            RequestResponseEvent::ResponseSent { .. } => {}
        }
    }

    fn swarm_event_handler<E: fmt::Debug>(&mut self, event: SwarmEvent<BehaviourEvent, E>) {
        match event {
            SwarmEvent::Behaviour(BehaviourEvent::Exchange(event)) => {
                self.exchange_event_handler(event)
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                let address = endpoint.get_remote_address().clone();
                debug!("(swarm) connection established {} {}", peer_id, address);

                if endpoint.is_dialer() {
                    self.remember_address(peer_id, address.clone());
                }
                let first = !self.connected.contains_key(&peer_id);
                self.connected.entry(peer_id).or_insert_with(|| address.clone());

                let (resolved, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_dials)
                    .into_iter()
                    .partition(|(a, _)| *a == address);
                self.pending_dials = pending;
                for (_, sender) in resolved {
                    let _ = sender.send(Ok(peer_id));
                }

                if first {
                    info!("Connected to {} at {}", peer_id, address);
                    let _ = self
                        .inbound_sender
                        .send(Inbound::PeerConnected { peer_id, address });
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!(
                    "(swarm) connection closed {} {} {:?}",
                    peer_id, num_established, cause
                );
                if num_established == 0 {
                    self.connected.remove(&peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!("(swarm) outgoing connection to {:?} failed: {}", peer_id, error);
                let failed: Vec<Multiaddr> = match &error {
                    DialError::Transport(attempts) => {
                        attempts.iter().map(|(a, _)| a.clone()).collect()
                    }
                    DialError::WrongPeerId { endpoint, .. } => {
                        vec![endpoint.get_remote_address().clone()]
                    }
                    _ => Vec::new(),
                };
                if failed.is_empty() && peer_id.is_none() {
                    // no way to tell which dial this was
                    self.fail_pending_dials(|_| true, &error);
                } else {
                    self.fail_pending_dials(|a| failed.contains(a), &error);
                }
            }
            SwarmEvent::IncomingConnection {
                local_addr,
                send_back_addr,
            } => {
                debug!(
                    "(swarm) incoming connection {:?} {:?} ",
                    local_addr, send_back_addr
                );
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.listen_addrs.push(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.retain(|a| *a != address);
            }
            SwarmEvent::ListenerError { error, .. } => {
                error!("(swarm) listener error {}", error);
            }
            _ => {}
        }
    }
}

async fn dispatch(
    plugins: Vec<Box<dyn Plugin>>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    network: NetworkHandle,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Message(ctx) => {
                for plugin in &plugins {
                    if let Err(e) = plugin.on_receive(&ctx).await {
                        warn!("({}) failed to handle message: {:#}", plugin.name(), e);
                    }
                }
            }
            Inbound::PeerConnected { peer_id, address } => {
                for plugin in &plugins {
                    if let Err(e) = plugin
                        .on_peer_connected(peer_id, address.clone(), &network)
                        .await
                    {
                        warn!("({}) failed to greet {}: {:#}", plugin.name(), peer_id, e);
                    }
                }
            }
        }
    }
}

/// Cloneable way into a running [`Network`].
#[derive(Clone)]
pub struct NetworkHandle {
    peer_id: PeerId,
    keypair: Keypair,
    command_sender: mpsc::Sender<Command>,
}

impl fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkHandle")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

impl NetworkHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn command(&self, command: Command) -> anyhow::Result<()> {
        self.command_sender
            .send(command)
            .await
            .map_err(|_| anyhow!("network is not running"))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> anyhow::Result<T> {
        let (sender, receiver) = oneshot::channel();
        self.command(command(sender)).await?;
        receiver
            .await
            .map_err(|_| anyhow!("network dropped the request"))
    }

    /// Best effort dial of every peer. Returns how many dials were issued.
    pub async fn bootstrap<S: AsRef<str>>(&self, peers: &[S]) -> usize {
        let mut dialed = 0;
        for peer in peers.iter().map(|p| p.as_ref().trim()).filter(|p| !p.is_empty()) {
            match parse_address(peer) {
                Ok(address) => match self.dial(address).await {
                    Ok(()) => dialed += 1,
                    Err(e) => warn!("Bootstrap dial of {} failed: {}", peer, e),
                },
                Err(e) => warn!("Skipping bootstrap peer {}: {}", peer, e),
            }
        }
        dialed
    }

    pub async fn dial(&self, address: Multiaddr) -> anyhow::Result<()> {
        self.command(Command::Dial { address }).await
    }

    pub async fn add_address(&self, peer_id: PeerId, address: Multiaddr) -> anyhow::Result<()> {
        self.command(Command::AddAddress { peer_id, address }).await
    }

    pub async fn peers(&self) -> anyhow::Result<Vec<PeerInfo>> {
        self.request(|sender| Command::Peers { sender }).await
    }

    pub async fn listen_addresses(&self) -> anyhow::Result<Vec<Multiaddr>> {
        self.request(|sender| Command::ListenAddrs { sender }).await
    }

    /// Resolves a peer id, a multiaddr or a `protocol://host:port` address
    /// to a peer that messages can be sent to, dialing it if needed.
    /// A peer id only has to be known; whether it is reachable right now
    /// shows up as an error from [`Client::tell`].
    pub async fn client(&self, address: &str) -> anyhow::Result<Client> {
        let address = address.trim();
        let target = match address.parse::<PeerId>() {
            Ok(peer_id) => Target::Peer(peer_id),
            Err(_) => Target::Address(parse_address(address)?),
        };
        let result = tokio::time::timeout(
            CONNECT_TIMEOUT,
            self.request(|sender| Command::Connect { target, sender }),
        )
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", address))??;

        Ok(Client {
            peer_id: result?,
            network: self.clone(),
        })
    }

    fn envelope<M: WireMessage>(&self, ctx: SendContext, message: &M) -> anyhow::Result<Envelope> {
        let envelope = Envelope::new(message)?;
        if ctx.sign {
            envelope.sign(&self.keypair)
        } else {
            Ok(envelope)
        }
    }

    /// Fire and forget send to `peer_id`.
    pub async fn notify<M: WireMessage>(
        &self,
        peer_id: PeerId,
        ctx: SendContext,
        message: &M,
    ) -> anyhow::Result<()> {
        let envelope = self.envelope(ctx, message)?;
        self.command(Command::Send {
            peer_id,
            envelope,
            sender: None,
        })
        .await
    }
}

/// A resolved recipient.
#[derive(Debug, Clone)]
pub struct Client {
    peer_id: PeerId,
    network: NetworkHandle,
}

impl Client {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Sends `message` and waits until the peer acknowledged it.
    pub async fn tell<M: WireMessage>(&self, ctx: SendContext, message: &M) -> anyhow::Result<()> {
        let envelope = self.network.envelope(ctx, message)?;
        let peer_id = self.peer_id;
        let response = self
            .network
            .request(|sender| Command::Send {
                peer_id,
                envelope,
                sender: Some(sender),
            })
            .await??;
        match response {
            ExchangeResponse::Ack => Ok(()),
            ExchangeResponse::Bad => Err(anyhow!("{} rejected the message", peer_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::message::{ChatMessage, Payload};
    use super::*;
    use async_trait::async_trait;

    struct Recorder(mpsc::UnboundedSender<(Payload, PeerId, bool)>);

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn on_receive(&self, ctx: &PluginContext) -> anyhow::Result<()> {
            let _ = self
                .0
                .send((ctx.message().clone(), *ctx.sender(), ctx.is_signed()));
            Ok(())
        }
    }

    fn registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register::<ChatMessage>().unwrap();
        registry
    }

    async fn listen_address(handle: &NetworkHandle) -> Multiaddr {
        for _ in 0..100 {
            if let Some(address) = handle.listen_addresses().await.unwrap().into_iter().next() {
                return address;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("node never started listening");
    }

    #[test]
    fn builder_rejects_missing_or_unsupported_addresses() {
        assert!(NetworkBuilder::new().build().is_err());
        assert!(NetworkBuilder::new()
            .address("kcp://127.0.0.1:0")
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn signed_chat_reaches_the_remote_plugin() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = NetworkBuilder::new()
            .address("tcp://127.0.0.1:0")
            .registry(registry())
            .add_plugin(Recorder(tx))
            .build()
            .unwrap();
        let receiver_handle = receiver.handle();
        tokio::spawn(receiver.listen());

        let sender = NetworkBuilder::new()
            .address("tcp://127.0.0.1:0")
            .registry(registry())
            .build()
            .unwrap();
        let sender_handle = sender.handle();
        tokio::spawn(sender.listen());

        let address = listen_address(&receiver_handle).await;
        let client = sender_handle.client(&address.to_string()).await.unwrap();
        assert_eq!(client.peer_id(), receiver_handle.peer_id());

        let message = ChatMessage {
            message: "42".to_string(),
        };
        client.tell(SendContext::signed(), &message).await.unwrap();
        client
            .tell(SendContext::unsigned(), &message)
            .await
            .unwrap();

        let (payload, from, signed) = rx.recv().await.unwrap();
        assert_eq!(payload, Payload::Chat(message.clone()));
        assert_eq!(from, sender_handle.peer_id());
        assert!(signed);

        let (_, _, signed) = rx.recv().await.unwrap();
        assert!(!signed);

        // the peer id now resolves without dialing
        let again = sender_handle
            .client(&receiver_handle.peer_id().to_base58())
            .await
            .unwrap();
        assert_eq!(again.peer_id(), receiver_handle.peer_id());
    }

    #[tokio::test]
    async fn dialing_ourselves_fails_without_waiting() {
        let node = NetworkBuilder::new()
            .address("tcp://127.0.0.1:0")
            .build()
            .unwrap();
        let handle = node.handle();
        tokio::spawn(node.listen());

        let own = listen_address(&handle).await;
        let started = std::time::Instant::now();
        let err = handle.client(&own.to_string()).await.unwrap_err();
        assert!(err.to_string().contains("our own address"), "{:#}", err);
        assert!(handle
            .client(&handle.peer_id().to_base58())
            .await
            .is_err());
        assert!(started.elapsed() < CONNECT_TIMEOUT / 2);
    }

    #[tokio::test]
    async fn refused_dial_fails_without_waiting() {
        let node = NetworkBuilder::new()
            .address("tcp://127.0.0.1:0")
            .build()
            .unwrap();
        let handle = node.handle();
        tokio::spawn(node.listen());

        // grab a free port and close it again so nothing listens there
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let started = std::time::Instant::now();
        let err = handle
            .client(&format!("tcp://127.0.0.1:{}", port))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not connect"), "{:#}", err);
        assert!(started.elapsed() < CONNECT_TIMEOUT / 2);
    }

    #[tokio::test]
    async fn unknown_peer_cannot_be_resolved() {
        let node = NetworkBuilder::new()
            .address("tcp://127.0.0.1:0")
            .build()
            .unwrap();
        let handle = node.handle();
        tokio::spawn(node.listen());

        let stranger = Keypair::generate_ed25519().public().to_peer_id();
        assert!(handle.client(&stranger.to_base58()).await.is_err());
        assert!(handle.client("not an address").await.is_err());
    }
}
