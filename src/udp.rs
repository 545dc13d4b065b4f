//! UDP ASSOCIATE relay
//!
//! One relay socket serves one client. Datagrams from the client carry the
//! SOCKS5 UDP header and are forwarded unwrapped to their target; anything
//! else arriving on the socket is wrapped with its source address and sent
//! back to the client.

use crate::address::TargetAddress;
use crate::codec;
use crate::protocol::MAX_DGRAM;
use crate::session::lock;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// ClientEndpoint identifies which datagrams come from the client
///
/// The port is learned from the first datagram when the client did not
/// announce one in its UDP ASSOCIATE request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEndpoint {
    ip: IpAddr,
    port: Option<u16>,
}

/// ClientEndpoint implementation block
impl ClientEndpoint {
    pub fn new(ip: IpAddr, port: Option<u16>) -> Self {
        Self { ip, port }
    }

    /// from_request takes the address announced in the request, falling
    /// back to the control connection's peer IP when it is all zeros
    pub fn from_request(requested: &TargetAddress, peer: SocketAddr) -> Self {
        let ip = requested
            .address
            .ip()
            .filter(|ip| !ip.is_unspecified())
            .unwrap_or_else(|| peer.ip());
        let port = (requested.port != 0).then_some(requested.port);
        Self { ip, port }
    }

    /// matches reports whether src is the known client endpoint.
    /// A loopback client matches its port on any loopback source.
    pub fn matches(&self, src: SocketAddr) -> bool {
        self.ip_matches(src) && self.port == Some(src.port())
    }

    /// learn takes the client port from src when it is still unknown and
    /// datagram carries a valid SOCKS5 UDP header
    pub fn learn(&mut self, src: SocketAddr, datagram: &[u8]) -> bool {
        if self.port.is_some() || !self.ip_matches(src) {
            return false;
        }
        if let Err(e) = codec::UdpHeader::decode(datagram) {
            debug!("not learning UDP client port from {src}: {e}");
            return false;
        }

        info!("learned UDP client port {} from {src}", src.port());
        self.port = Some(src.port());
        true
    }

    fn ip_matches(&self, src: SocketAddr) -> bool {
        src.ip() == self.ip || (self.ip.is_loopback() && src.ip().is_loopback())
    }

    /// addr is where replies go; None until the port is known
    pub fn addr(&self) -> Option<SocketAddr> {
        self.port.map(|port| SocketAddr::new(self.ip, port))
    }
}

/// UdpAssociation is the relay socket of one UDP ASSOCIATE session
pub struct UdpAssociation {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    client: ClientEndpoint,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// UdpAssociation implementation block
impl UdpAssociation {
    /// bind opens the relay socket on local (port 0 for an ephemeral port)
    pub async fn bind(local: SocketAddr, client: ClientEndpoint) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            client,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// local_addr is the address to announce in the command reply
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// start spawns the receive loop. Returns false if it already ran.
    pub fn start(&self) -> bool {
        let mut task = lock(&self.task);
        if task.is_some() || self.shutdown.is_cancelled() {
            return false;
        }

        // DEBUG
        info!(
            "UDP relay started: server is listening on: {}",
            self.local_addr
        );

        *task = Some(tokio::spawn(receive_loop(
            Arc::clone(&self.socket),
            self.client,
            self.shutdown.clone(),
        )));
        true
    }

    /// stop ends the receive loop and releases its socket. Idempotent.
    pub fn stop(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.shutdown.cancel();
        debug!("UDP relay on {} stopped", self.local_addr);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// closed resolves once the association stopped or its socket failed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

impl Drop for UdpAssociation {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, mut client: ClientEndpoint, shutdown: CancellationToken) {
    let mut buffer = vec![0u8; MAX_DGRAM];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        let (len, src) = match received {
            Ok(received) => received,
            // ICMP errors from earlier sends, not fatal for the relay
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
            ) =>
            {
                debug!("ignoring UDP error: {e}");
                continue;
            }
            Err(e) => {
                error!("UDP receive error: {e}");
                shutdown.cancel();
                break;
            }
        };

        let datagram = &buffer[..len];
        if client.matches(src) || client.learn(src, datagram) {
            forward_to_target(&socket, datagram, src).await;
        } else {
            forward_to_client(&socket, &client, datagram, src).await;
        }
    }

    // DEBUG
    debug!("UDP receive loop finished");
}

/// forward_to_target strips the UDP header and sends the payload on
async fn forward_to_target(socket: &UdpSocket, datagram: &[u8], client_addr: SocketAddr) {
    let (target, payload) = match codec::decapsulate(datagram) {
        Ok(parts) => parts,
        Err(e) => {
            warn!("dropping datagram from {client_addr}: {e}");
            return;
        }
    };

    // Domain targets are not resolved on the UDP path
    let Some(target_addr) = target.to_socket_addr() else {
        warn!("dropping datagram from {client_addr}: domain target {target} not supported");
        return;
    };

    match socket.send_to(payload, target_addr).await {
        // DEBUG
        Ok(_) => debug!(
            "forwarded {} bytes: {client_addr} -> {target_addr}",
            payload.len()
        ),
        Err(e) => warn!("failed to forward datagram to {target_addr}: {e}"),
    }
}

/// forward_to_client wraps a target's datagram and sends it to the client
async fn forward_to_client(
    socket: &UdpSocket,
    client: &ClientEndpoint,
    datagram: &[u8],
    src: SocketAddr,
) {
    let Some(client_addr) = client.addr() else {
        debug!("dropping datagram from {src}: client port not known yet");
        return;
    };

    let packet = match codec::encapsulate(&TargetAddress::from(src), datagram) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("dropping datagram from {src}: {e}");
            return;
        }
    };

    match socket.send_to(&packet, client_addr).await {
        // DEBUG
        Ok(_) => debug!(
            "forwarded {} bytes: {src} -> {client_addr}",
            datagram.len()
        ),
        Err(e) => error!("Error sending response to client {client_addr}: {e}"),
    }
}
