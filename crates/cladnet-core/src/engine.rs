//! Tunneling Engine
//!
//! Moves packets between the virtual interface and the UDP socket:
//! - encapsulation: interface -> registry lookup -> policy -> (seal) -> UDP
//! - decapsulation: UDP -> (open) -> IPv4 check -> interface
//!
//! Both loops are released together by a single start signal fired once the
//! interface is up and the socket is bound, and stopped by a shutdown watch
//! that cancels their pending read and receive.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use cladnet_crypto::KeyManager;
use cladnet_network::packet::{ipv4_destination, Ipv4Header};
use cladnet_network::{
    NetworkError, UdpTransport, UdpTransportBuilder, VirtualInterface, INTERFACE_BUFFER_SIZE,
    MAX_DATAGRAM_SIZE,
};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::registry::PeerRegistry;
use crate::rule::PeerState;

/// Pause after a failed read so a persistent error does not spin
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Back-to-back read or receive failures before the engine gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 100;

/// Interface lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Unconfigured,
    Configuring,
    Tunneling,
    Closing,
    Released,
    Failed,
}

impl EngineState {
    /// The state published for this host in the networking rule
    pub fn peer_state(&self) -> Option<PeerState> {
        match self {
            EngineState::Unconfigured => None,
            EngineState::Configuring => Some(PeerState::Configuring),
            EngineState::Tunneling => Some(PeerState::Tunneling),
            EngineState::Closing => Some(PeerState::Closing),
            EngineState::Released => Some(PeerState::Released),
            EngineState::Failed => Some(PeerState::Failed),
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Unconfigured => "unconfigured",
            EngineState::Configuring => "configuring",
            EngineState::Tunneling => "tunneling",
            EngineState::Closing => "closing",
            EngineState::Released => "released",
            EngineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Datagrams sent to peers
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Packets written to the interface
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Packets for CLADNet addresses no peer owns
    pub dropped_no_route: u64,
    /// Non-IPv4 or malformed packets
    pub dropped_invalid: u64,
    /// Packets that could not be sealed or opened
    pub crypto_errors: u64,
    /// Failed sends, interface writes and policy lookups
    pub io_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    dropped_no_route: AtomicU64,
    dropped_invalid: AtomicU64,
    crypto_errors: AtomicU64,
    io_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, error: &CoreError) {
        match error {
            CoreError::CryptoError(_) => Self::bump(&self.crypto_errors),
            _ => Self::bump(&self.io_errors),
        }
    }
}

/// Consecutive failures of one loop's read or receive
#[derive(Debug, Default)]
struct ErrorStreak {
    count: u32,
}

impl ErrorStreak {
    /// Count a failure; true once the streak reaches the limit
    fn failed(&mut self) -> bool {
        self.count += 1;
        self.count >= MAX_CONSECUTIVE_ERRORS
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

/// Crypto, socket, interface and policy failures surface at `warn`
fn needs_attention(error: &CoreError) -> bool {
    matches!(
        error,
        CoreError::CryptoError(_)
            | CoreError::NetworkError(_)
            | CoreError::Policy(_)
            | CoreError::Io(_)
    )
}

fn report_packet_error(direction: &str, peer: &dyn fmt::Display, error: &CoreError) {
    if needs_attention(error) {
        warn!("Failed to {} packet ({}): {}", direction, peer, error);
    } else {
        debug!("Failed to {} packet ({}): {}", direction, peer, error);
    }
}

/// The per-host tunneling engine
pub struct TunnelingEngine {
    /// This host, the source of every encapsulated packet
    host_id: String,
    config: CoreConfig,
    interface: Arc<dyn VirtualInterface>,
    registry: Arc<PeerRegistry>,
    keys: Arc<KeyManager>,
    encryption: AtomicBool,
    state: RwLock<EngineState>,
    transport: RwLock<Option<Arc<UdpTransport>>>,
    /// Fired once by `configure`, consumed once by `run`
    start_tx: Mutex<Option<oneshot::Sender<()>>>,
    start_rx: Mutex<Option<oneshot::Receiver<()>>>,
    shutdown: watch::Sender<bool>,
    /// True while `run` owns live loops
    running: watch::Sender<bool>,
    counters: Counters,
}

impl TunnelingEngine {
    /// Create an engine for `host_id` over `interface`
    pub fn new(
        host_id: impl Into<String>,
        config: CoreConfig,
        interface: Arc<dyn VirtualInterface>,
        registry: Arc<PeerRegistry>,
        keys: Arc<KeyManager>,
    ) -> Arc<Self> {
        let (start_tx, start_rx) = oneshot::channel();
        let (shutdown, _) = watch::channel(false);
        let (running, _) = watch::channel(false);
        let encryption = AtomicBool::new(config.encryption);

        Arc::new(Self {
            host_id: host_id.into(),
            config,
            interface,
            registry,
            keys,
            encryption,
            state: RwLock::new(EngineState::Unconfigured),
            transport: RwLock::new(None),
            start_tx: Mutex::new(Some(start_tx)),
            start_rx: Mutex::new(Some(start_rx)),
            shutdown,
            running,
            counters: Counters::default(),
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn set_encryption(&self, enabled: bool) {
        let previous = self.encryption.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!("Encryption {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.encryption.load(Ordering::SeqCst)
    }

    /// Address the tunneling socket is bound to, once configured
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.read().await.as_ref().map(|t| t.local_addr())
    }

    async fn transition(&self, allowed: &[EngineState], to: EngineState) -> CoreResult<()> {
        let mut state = self.state.write().await;
        if !allowed.contains(&*state) {
            return Err(CoreError::InvalidStateTransition {
                from: state.to_string(),
                to: to.to_string(),
            });
        }
        debug!("Engine state {} -> {}", *state, to);
        *state = to;
        drop(state);

        self.publish_state(to).await;
        Ok(())
    }

    /// Mirror the lifecycle into this host's row of the networking rule
    async fn publish_state(&self, state: EngineState) {
        if let Some(peer_state) = state.peer_state() {
            if !self.registry.set_state(&self.host_id, peer_state).await {
                trace!("No rule row for {} to record {}", self.host_id, state);
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn fail(&self, reason: &str) {
        error!("Tunneling failed: {}", reason);
        *self.state.write().await = EngineState::Failed;
        self.shutdown.send_replace(true);
        self.publish_state(EngineState::Failed).await;
    }

    /// Bring up the interface with `address`, bind the tunneling socket and
    /// release the loops
    pub async fn configure(&self, address: Ipv4Net) -> CoreResult<()> {
        self.transition(&[EngineState::Unconfigured], EngineState::Configuring)
            .await?;

        info!(
            "Configuring interface {} with {} (MTU {})",
            self.config.interface_name, address, self.config.mtu
        );
        if let Err(e) = self
            .interface
            .configure(&self.config.interface_name, self.config.mtu, address)
            .await
        {
            self.fail(&format!("interface configuration: {}", e)).await;
            return Err(e.into());
        }

        let listen_addr = SocketAddr::new(
            IpAddr::V4(self.config.listen_address),
            self.config.tunneling_port,
        );
        let transport = match UdpTransportBuilder::new(listen_addr)
            .recv_buffer_size(self.config.recv_buffer_size)
            .send_buffer_size(self.config.send_buffer_size)
            .build()
        {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                self.fail(&format!("socket bind on {}: {}", listen_addr, e)).await;
                if let Err(close_err) = self.interface.close().await {
                    warn!("Error closing interface: {}", close_err);
                }
                return Err(e.into());
            }
        };
        info!("Tunneling socket bound to {}", transport.local_addr());
        *self.transport.write().await = Some(transport);

        self.transition(&[EngineState::Configuring], EngineState::Tunneling)
            .await?;

        if let Some(start) = self.start_tx.lock().await.take() {
            let _ = start.send(());
        }
        Ok(())
    }

    /// Wait for `configure`, then pump packets in both directions until closed
    pub async fn run(self: &Arc<Self>) -> CoreResult<()> {
        let start = self.start_rx.lock().await.take().ok_or_else(|| {
            CoreError::InvalidStateTransition {
                from: "running".into(),
                to: "running".into(),
            }
        })?;

        let mut shutdown = self.shutdown.subscribe();
        let stopped = async {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };
        tokio::select! {
            result = start => {
                if result.is_err() {
                    return Ok(());
                }
            }
            _ = stopped => {
                debug!("Engine closed before it was configured");
                return Ok(());
            }
        }

        // Announce the loops before looking at shutdown, so a concurrent
        // close either sees them running or is seen here
        self.running.send_replace(true);
        let transport = self.transport.read().await.clone();
        let transport = match transport {
            Some(transport) if !self.is_shutting_down() => transport,
            _ => {
                self.running.send_replace(false);
                if self.is_shutting_down() {
                    debug!("Engine closed before tunneling started");
                    return Ok(());
                }
                return Err(NetworkError::NotConfigured.into());
            }
        };

        let encapsulation = {
            let engine = Arc::clone(self);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { engine.encapsulation_loop(transport).await })
        };
        let decapsulation = {
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.decapsulation_loop(transport).await })
        };

        let (encapsulation, decapsulation) = tokio::join!(encapsulation, decapsulation);
        if let Err(e) = encapsulation {
            error!("Encapsulation task panicked: {}", e);
        }
        if let Err(e) = decapsulation {
            error!("Decapsulation task panicked: {}", e);
        }

        self.running.send_replace(false);
        Ok(())
    }

    /// Stop both loops, drop the socket and close the interface
    pub async fn close(&self) -> CoreResult<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                EngineState::Closing | EngineState::Released => return Ok(()),
                _ => *state = EngineState::Closing,
            }
        }
        info!("Closing tunneling engine");
        self.publish_state(EngineState::Closing).await;

        self.shutdown.send_replace(true);

        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;

        self.transport.write().await.take();

        if let Err(e) = self.interface.close().await {
            warn!("Error closing interface: {}", e);
        }

        *self.state.write().await = EngineState::Released;
        self.publish_state(EngineState::Released).await;
        info!("Tunneling engine released");
        Ok(())
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            dropped_no_route: c.dropped_no_route.load(Ordering::Relaxed),
            dropped_invalid: c.dropped_invalid.load(Ordering::Relaxed),
            crypto_errors: c.crypto_errors.load(Ordering::Relaxed),
            io_errors: c.io_errors.load(Ordering::Relaxed),
        }
    }

    async fn encapsulation_loop(&self, transport: Arc<UdpTransport>) {
        info!("Encapsulation task started");

        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; INTERFACE_BUFFER_SIZE];
        let mut streak = ErrorStreak::default();

        loop {
            let stopped = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };

            let result = tokio::select! {
                _ = stopped => break,
                result = self.interface.read(&mut buf) => result,
            };

            match result {
                Ok(n) => {
                    streak.reset();
                    if let Err(e) = self.encapsulate(&transport, &buf[..n]).await {
                        self.counters.record_error(&e);
                        report_packet_error("encapsulate", &self.config.interface_name, &e);
                    }
                }
                Err(_) if self.is_shutting_down() => break,
                Err(NetworkError::InterfaceClosed) => {
                    self.fail("virtual interface closed unexpectedly").await;
                    break;
                }
                Err(e) => {
                    warn!("Interface read error: {}", e);
                    if streak.failed() {
                        self.fail(&format!("interface keeps failing: {}", e)).await;
                        break;
                    }
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }

        info!("Encapsulation task stopped");
    }

    async fn encapsulate(&self, transport: &UdpTransport, packet: &[u8]) -> CoreResult<()> {
        let Some(destination) = ipv4_destination(packet) else {
            Counters::bump(&self.counters.dropped_invalid);
            trace!("Dropping non-IPv4 packet of {} bytes", packet.len());
            return Ok(());
        };

        let route = match self
            .registry
            .route(self.config.rule_type, &self.host_id, destination)
            .await?
        {
            Some(route) => route,
            None => {
                Counters::bump(&self.counters.dropped_no_route);
                trace!("No peer owns {}, dropping", destination);
                return Ok(());
            }
        };

        let target = SocketAddr::new(IpAddr::V4(route.address), self.config.tunneling_port);

        let sent = if self.is_encryption_enabled() {
            let sealed = self.keys.seal(&route.host_id, packet)?;
            transport.send_to(&sealed, target).await?;
            sealed.len()
        } else {
            transport.send_to(packet, target).await?;
            packet.len()
        };

        Counters::bump(&self.counters.packets_sent);
        self.counters
            .bytes_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        trace!("Sent {} bytes for {} to {} ({})", sent, destination, target, route.host_id);
        Ok(())
    }

    async fn decapsulation_loop(&self, transport: Arc<UdpTransport>) {
        info!("Decapsulation task started");

        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut streak = ErrorStreak::default();

        loop {
            let stopped = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };

            let result = tokio::select! {
                _ = stopped => break,
                result = transport.recv_from(&mut buf) => result,
            };

            match result {
                Ok((n, from)) => {
                    streak.reset();
                    if let Err(e) = self.decapsulate(&buf[..n], from).await {
                        self.counters.record_error(&e);
                        report_packet_error("decapsulate", &from, &e);
                    }
                }
                Err(_) if self.is_shutting_down() => break,
                Err(e) => {
                    warn!("Socket receive error: {}", e);
                    if streak.failed() {
                        self.fail(&format!("tunneling socket keeps failing: {}", e)).await;
                        break;
                    }
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }

        info!("Decapsulation task stopped");
    }

    async fn decapsulate(&self, datagram: &[u8], from: SocketAddr) -> CoreResult<()> {
        let opened;
        let packet = if self.is_encryption_enabled() {
            opened = self.keys.open(datagram)?;
            opened.as_slice()
        } else {
            datagram
        };

        let header = match Ipv4Header::parse(packet) {
            Ok(header) => header,
            Err(e) => {
                Counters::bump(&self.counters.dropped_invalid);
                debug!("Dropping datagram from {}: {}", from, e);
                return Ok(());
            }
        };
        trace!(
            "Received {} -> {} ({} bytes, proto {}) via {}",
            header.source,
            header.destination,
            packet.len(),
            header.protocol,
            from
        );

        self.interface.write(packet).await?;

        Counters::bump(&self.counters.packets_received);
        self.counters
            .bytes_received
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl fmt::Debug for TunnelingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelingEngine")
            .field("host_id", &self.host_id)
            .field("interface", &self.config.interface_name)
            .field("encryption", &self.is_encryption_enabled())
            .finish()
    }
}

/// CLADNet interface address for a host owning `address` inside `network`
pub fn interface_address(address: Ipv4Addr, network: Ipv4Net) -> CoreResult<Ipv4Net> {
    Ipv4Net::new(address, network.prefix_len())
        .map_err(|e| CoreError::Config(format!("bad CLADNet address {}: {}", address, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RuleType;
    use crate::rule::{NetworkingRule, Peer};
    use cladnet_network::tun::{MemoryInterface, MemoryInterfaceHandle};
    use tokio::net::UdpSocket;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    const A_LISTEN: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);
    const B_LISTEN: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 3);

    fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let total = (20 + payload.len()) as u16;
        let mut packet = vec![0x45, 0x00];
        packet.extend_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0x40, 0, 64, 17, 0, 0]);
        packet.extend_from_slice(&src.octets());
        packet.extend_from_slice(&dst.octets());
        packet.extend_from_slice(payload);
        packet
    }

    fn cladnet(last_octet: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last_octet)
    }

    fn two_host_rule() -> NetworkingRule {
        let network: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let mut rule = NetworkingRule::new("cladnet-test");
        rule.append_rule(
            Peer::new("a", "host-a")
                .with_cladnet_address(network, cladnet(2))
                .with_host_addresses(None, Some(A_LISTEN)),
        );
        rule.append_rule(
            Peer::new("b", "host-b")
                .with_cladnet_address(network, cladnet(3))
                .with_host_addresses(None, Some(B_LISTEN)),
        );
        rule
    }

    /// A port free on both loopback addresses used by the tests
    fn shared_port() -> u16 {
        loop {
            let a = std::net::UdpSocket::bind((A_LISTEN, 0)).unwrap();
            let port = a.local_addr().unwrap().port();
            if std::net::UdpSocket::bind((B_LISTEN, port)).is_ok() {
                return port;
            }
        }
    }

    fn config(listen: Ipv4Addr, port: u16, encryption: bool) -> CoreConfig {
        CoreConfig {
            listen_address: listen,
            tunneling_port: port,
            encryption,
            rule_type: RuleType::Basic,
            recv_buffer_size: None,
            send_buffer_size: None,
            ..CoreConfig::default()
        }
    }

    struct Node {
        engine: Arc<TunnelingEngine>,
        handle: MemoryInterfaceHandle,
        keys: Arc<KeyManager>,
        runner: JoinHandle<CoreResult<()>>,
    }

    async fn start_node(host_id: &str, config: CoreConfig, rule: NetworkingRule) -> Node {
        let (interface, handle) = MemoryInterface::new();
        let keys = Arc::new(KeyManager::generate(host_id));
        let own = rule.peer_by_host_id(host_id).unwrap();
        let address =
            interface_address(own.ipv4_address.unwrap(), own.ipv4_network.unwrap()).unwrap();

        let engine = TunnelingEngine::new(
            host_id,
            config,
            interface,
            Arc::new(PeerRegistry::new(rule)),
            Arc::clone(&keys),
        );

        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run().await })
        };
        engine.configure(address).await.unwrap();

        Node {
            engine,
            handle,
            keys,
            runner,
        }
    }

    async fn stop_node(node: Node) {
        node.engine.close().await.unwrap();
        timeout(WAIT, node.runner).await.unwrap().unwrap().unwrap();
        assert_eq!(node.engine.state().await, EngineState::Released);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (interface, handle) = MemoryInterface::new();
        let engine = TunnelingEngine::new(
            "a",
            config(Ipv4Addr::LOCALHOST, 0, false),
            interface,
            Arc::new(PeerRegistry::default()),
            Arc::new(KeyManager::generate("a")),
        );
        assert_eq!(engine.state().await, EngineState::Unconfigured);

        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run().await })
        };

        engine.configure("10.0.0.2/24".parse().unwrap()).await.unwrap();
        assert_eq!(engine.state().await, EngineState::Tunneling);
        assert!(engine.local_addr().await.is_some());

        let settings = handle.settings().await.unwrap();
        assert_eq!(settings.name, "cladnet0");
        assert_eq!(settings.mtu, 1300);
        assert_eq!(settings.address, "10.0.0.2/24".parse::<Ipv4Net>().unwrap());

        // Configuring twice is rejected
        assert!(matches!(
            engine.configure("10.0.0.2/24".parse().unwrap()).await,
            Err(CoreError::InvalidStateTransition { .. })
        ));

        engine.close().await.unwrap();
        timeout(WAIT, runner).await.unwrap().unwrap().unwrap();

        assert_eq!(engine.state().await, EngineState::Released);
        assert_eq!(engine.state().await.peer_state(), Some(PeerState::Released));
        assert!(engine.local_addr().await.is_none());
        assert!(handle.is_closed());

        // Idempotent
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_configure_releases_run() {
        let (interface, _handle) = MemoryInterface::new();
        let engine = TunnelingEngine::new(
            "a",
            config(Ipv4Addr::LOCALHOST, 0, false),
            interface,
            Arc::new(PeerRegistry::default()),
            Arc::new(KeyManager::generate("a")),
        );

        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run().await })
        };

        engine.close().await.unwrap();
        timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
        assert_eq!(engine.state().await, EngineState::Released);
    }

    #[tokio::test]
    async fn test_run_after_close_is_clean() {
        let (interface, _handle) = MemoryInterface::new();
        let engine = TunnelingEngine::new(
            "a",
            config(Ipv4Addr::LOCALHOST, 0, false),
            interface,
            Arc::new(PeerRegistry::default()),
            Arc::new(KeyManager::generate("a")),
        );

        engine.configure("10.0.0.2/24".parse().unwrap()).await.unwrap();
        engine.close().await.unwrap();

        // The start signal already fired, but the socket is gone
        timeout(WAIT, engine.run()).await.unwrap().unwrap();
        assert_eq!(engine.state().await, EngineState::Released);
    }

    #[tokio::test]
    async fn test_close_racing_run_start() {
        for _ in 0..20 {
            let (interface, _handle) = MemoryInterface::new();
            let engine = TunnelingEngine::new(
                "a",
                config(Ipv4Addr::LOCALHOST, 0, false),
                interface,
                Arc::new(PeerRegistry::default()),
                Arc::new(KeyManager::generate("a")),
            );

            let runner = {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.run().await })
            };
            engine.configure("10.0.0.2/24".parse().unwrap()).await.unwrap();
            engine.close().await.unwrap();

            timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
            assert_eq!(engine.state().await, EngineState::Released);
        }
    }

    #[tokio::test]
    async fn test_lifecycle_recorded_in_own_row() {
        let rule = two_host_rule();
        let registry = Arc::new(PeerRegistry::new(rule));
        let (interface, _handle) = MemoryInterface::new();
        let engine = TunnelingEngine::new(
            "a",
            config(Ipv4Addr::LOCALHOST, 0, false),
            interface,
            Arc::clone(&registry),
            Arc::new(KeyManager::generate("a")),
        );

        engine.configure("10.0.0.2/24".parse().unwrap()).await.unwrap();
        assert_eq!(registry.peer("a").await.unwrap().state, PeerState::Tunneling);
        assert_eq!(registry.peer("b").await.unwrap().state, PeerState::default());

        engine.close().await.unwrap();
        assert_eq!(registry.peer("a").await.unwrap().state, PeerState::Released);
    }

    #[test]
    fn test_error_streak_limit() {
        let mut streak = ErrorStreak::default();
        for _ in 1..MAX_CONSECUTIVE_ERRORS {
            assert!(!streak.failed());
        }
        streak.reset();
        for _ in 1..MAX_CONSECUTIVE_ERRORS {
            assert!(!streak.failed());
        }
        assert!(streak.failed());
    }

    #[test]
    fn test_packet_errors_needing_attention() {
        assert!(needs_attention(&CoreError::CryptoError(
            cladnet_crypto::CryptoError::DecryptionFailed
        )));
        assert!(needs_attention(&CoreError::NetworkError(NetworkError::InterfaceClosed)));
        assert!(needs_attention(&CoreError::Policy(
            crate::policy::PolicyError::UnknownRuleType("x".into())
        )));
        assert!(!needs_attention(&CoreError::HostNotInRule("a".into())));
        assert!(!needs_attention(&CoreError::Config("bad".into())));
    }

    #[tokio::test]
    async fn test_bind_failure_marks_failed() {
        let taken = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let (interface, handle) = MemoryInterface::new();
        let engine = TunnelingEngine::new(
            "a",
            config(Ipv4Addr::LOCALHOST, port, false),
            interface,
            Arc::new(PeerRegistry::default()),
            Arc::new(KeyManager::generate("a")),
        );

        let result = engine.configure("10.0.0.2/24".parse().unwrap()).await;
        assert!(matches!(result, Err(CoreError::NetworkError(NetworkError::AddressInUse(_)))));
        assert_eq!(engine.state().await, EngineState::Failed);
        assert!(handle.is_closed());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_encapsulate_to_selected_address_and_decapsulate_from_peer() {
        let port = shared_port();
        let peer_b = UdpSocket::bind((B_LISTEN, port)).await.unwrap();
        let mut a = start_node("a", config(A_LISTEN, port, false), two_host_rule()).await;

        // Unknown destination is dropped, the next packet still goes out
        let lost = ipv4_packet(cladnet(2), cladnet(99), b"nobody");
        let packet = ipv4_packet(cladnet(2), cladnet(3), b"hello b");
        assert!(a.handle.inject(lost));
        assert!(a.handle.inject(packet.clone()));

        let mut buf = vec![0u8; 2048];
        let (n, from) = timeout(WAIT, peer_b.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], packet.as_slice());
        assert_eq!(from, SocketAddr::new(IpAddr::V4(A_LISTEN), port));
        assert_eq!(a.engine.stats().dropped_no_route, 1);

        // A datagram from B is written byte-identical
        let reply = ipv4_packet(cladnet(3), cladnet(2), b"hello a");
        peer_b.send_to(&reply, (A_LISTEN, port)).await.unwrap();

        let written = timeout(WAIT, a.handle.next_written()).await.unwrap().unwrap();
        assert_eq!(written, reply);

        let stats = a.engine.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, packet.len() as u64);

        stop_node(a).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_non_ipv4_datagram_dropped() {
        let port = shared_port();
        let peer_b = UdpSocket::bind((B_LISTEN, port)).await.unwrap();
        let mut a = start_node("a", config(A_LISTEN, port, false), two_host_rule()).await;

        let mut ipv6 = vec![0u8; 48];
        ipv6[0] = 0x60;
        let valid = ipv4_packet(cladnet(3), cladnet(2), b"after junk");

        peer_b.send_to(&ipv6, (A_LISTEN, port)).await.unwrap();
        peer_b.send_to(&valid, (A_LISTEN, port)).await.unwrap();

        let written = timeout(WAIT, a.handle.next_written()).await.unwrap().unwrap();
        assert_eq!(written, valid);
        assert_eq!(a.engine.stats().dropped_invalid, 1);
        assert!(a.handle.try_next_written().is_none());

        stop_node(a).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_two_engines_plaintext() {
        let port = shared_port();
        let mut a = start_node("a", config(A_LISTEN, port, false), two_host_rule()).await;
        let mut b = start_node("b", config(B_LISTEN, port, false), two_host_rule()).await;

        let to_b = ipv4_packet(cladnet(2), cladnet(3), b"ping");
        a.handle.inject(to_b.clone());
        assert_eq!(timeout(WAIT, b.handle.next_written()).await.unwrap().unwrap(), to_b);

        let to_a = ipv4_packet(cladnet(3), cladnet(2), b"pong");
        b.handle.inject(to_a.clone());
        assert_eq!(timeout(WAIT, a.handle.next_written()).await.unwrap().unwrap(), to_a);

        stop_node(a).await;
        stop_node(b).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_two_engines_encrypted() {
        let port = shared_port();
        let mut a = start_node("a", config(A_LISTEN, port, true), two_host_rule()).await;
        let mut b = start_node("b", config(B_LISTEN, port, true), two_host_rule()).await;

        a.keys.update_keyring("b", &b.keys.public_key_base64()).unwrap();
        b.keys.update_keyring("a", &a.keys.public_key_base64()).unwrap();

        for i in 0..3u8 {
            let to_b = ipv4_packet(cladnet(2), cladnet(3), &[i; 100]);
            a.handle.inject(to_b.clone());
            assert_eq!(timeout(WAIT, b.handle.next_written()).await.unwrap().unwrap(), to_b);

            let to_a = ipv4_packet(cladnet(3), cladnet(2), &[i; 200]);
            b.handle.inject(to_a.clone());
            assert_eq!(timeout(WAIT, a.handle.next_written()).await.unwrap().unwrap(), to_a);
        }

        // Sealing adds overhead on the wire
        assert!(a.engine.stats().bytes_sent > 3 * 120);

        stop_node(a).await;
        stop_node(b).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_encryption_fails_closed_without_peer_key() {
        let port = shared_port();
        let peer_b = UdpSocket::bind((B_LISTEN, port)).await.unwrap();
        let b_keys = KeyManager::generate("b");
        let a = start_node("a", config(A_LISTEN, port, true), two_host_rule()).await;

        let first = ipv4_packet(cladnet(2), cladnet(3), b"no key yet");
        a.handle.inject(first);

        // Second packet goes out once the key is known
        let second = ipv4_packet(cladnet(2), cladnet(3), b"sealed");
        let mut buf = vec![0u8; 2048];
        timeout(WAIT, async {
            while a.engine.stats().crypto_errors == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        a.keys.insert_key("b", b_keys.public_key());
        a.handle.inject(second.clone());

        let (n, _) = timeout(WAIT, peer_b.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_ne!(&buf[..n], second.as_slice());
        assert_eq!(b_keys.open(&buf[..n]).unwrap(), second);
        assert_eq!(a.engine.stats().crypto_errors, 1);
        assert_eq!(a.engine.stats().packets_sent, 1);

        stop_node(a).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_disable_encryption_applies_to_next_packet() {
        let port = shared_port();
        let peer_b = UdpSocket::bind((B_LISTEN, port)).await.unwrap();
        let b_keys = KeyManager::generate("b");
        let a = start_node("a", config(A_LISTEN, port, true), two_host_rule()).await;
        a.keys.insert_key("b", b_keys.public_key());

        let mut buf = vec![0u8; 2048];

        let sealed = ipv4_packet(cladnet(2), cladnet(3), b"one");
        a.handle.inject(sealed.clone());
        let (n, _) = timeout(WAIT, peer_b.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(b_keys.open(&buf[..n]).unwrap(), sealed);

        a.engine.set_encryption(false);
        assert!(!a.engine.is_encryption_enabled());

        let plain = ipv4_packet(cladnet(2), cladnet(3), b"two");
        a.handle.inject(plain.clone());
        let (n, _) = timeout(WAIT, peer_b.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], plain.as_slice());

        stop_node(a).await;
    }

    #[tokio::test]
    async fn test_interface_closed_underneath_fails_engine() {
        let (interface, _handle) = MemoryInterface::new();
        let shared: Arc<dyn VirtualInterface> = interface.clone();
        let engine = TunnelingEngine::new(
            "a",
            config(Ipv4Addr::LOCALHOST, 0, false),
            shared,
            Arc::new(PeerRegistry::default()),
            Arc::new(KeyManager::generate("a")),
        );

        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run().await })
        };
        engine.configure("10.0.0.2/24".parse().unwrap()).await.unwrap();

        interface.close().await.unwrap();
        timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
        assert_eq!(engine.state().await, EngineState::Failed);

        engine.close().await.unwrap();
        assert_eq!(engine.state().await, EngineState::Released);
    }
}
