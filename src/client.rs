//! SOCKS5 client
//!
//! Speaks the client side of the protocol against any RFC 1928 proxy, using
//! the client roles of the registered methods.

use crate::address::{Address, TargetAddress};
use crate::auth::UserPass;
use crate::codec::{
    self, CommandReply, CommandRequest, Decode, MethodSelectionRequest, MethodSelectionResponse,
};
use crate::error::{Result, SocksError};
use crate::method::{MethodRegistry, NoAuth, UserPassword};
use crate::protocol::{Command, MAX_DGRAM, ReplyCode};
use std::net::SocketAddr;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// Socks5Client opens connections through a SOCKS5 proxy
#[derive(Clone)]
pub struct Socks5Client {
    proxy_addr: SocketAddr,
    methods: MethodRegistry,
    resolve_locally: bool,
}

/// Socks5Client implementation block
impl Socks5Client {
    /// new is a constructor for the Socks5Client type; offers NO AUTH only
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self {
            proxy_addr,
            methods: MethodRegistry::new().with(NoAuth),
            resolve_locally: false,
        }
    }

    /// with_credentials also offers username/password, preferred over NO AUTH
    pub fn with_credentials(mut self, credentials: UserPass) -> Self {
        self.methods.register(UserPassword::client(credentials));
        self
    }

    /// with_local_resolution makes the client resolve domain targets itself
    /// instead of sending the name to the proxy
    pub fn with_local_resolution(mut self, resolve_locally: bool) -> Self {
        self.resolve_locally = resolve_locally;
        self
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// handshake negotiates a method and runs its subnegotiation
    pub async fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        // Highest id first: username/password wins when configured
        let mut offered = self.methods.supported();
        offered.reverse();
        codec::write_message(stream, &MethodSelectionRequest::new(offered)).await?;

        let response = MethodSelectionResponse::decode(stream).await?;
        if !response.is_acceptable() {
            return Err(SocksError::NoAcceptableMethods);
        }

        let method = self.methods.get(response.method).ok_or_else(|| {
            SocksError::Protocol(format!(
                "proxy selected method {:#04x} that was not offered",
                response.method
            ))
        })?;

        // DEBUG
        debug!("proxy selected {}", method.name());
        method.client_negotiate(stream).await
    }

    /// connect asks the proxy to open a TCP connection to target
    pub async fn connect(&self, target: impl Into<TargetAddress>) -> Result<TcpStream> {
        let (stream, _) = self.request(Command::Connect, target.into()).await?;
        Ok(stream)
    }

    /// bind asks the proxy to listen for one inbound connection from target
    pub async fn bind(&self, target: impl Into<TargetAddress>) -> Result<PendingBind> {
        let (stream, listen_addr) = self.request(Command::Bind, target.into()).await?;
        Ok(PendingBind {
            stream,
            listen_addr,
        })
    }

    /// udp_associate sets up a UDP relay for a fresh local UDP socket
    pub async fn udp_associate(&self) -> Result<UdpClient> {
        let mut control = self.open().await?;
        let socket = UdpSocket::bind(SocketAddr::new(control.local_addr()?.ip(), 0)).await?;

        let request = CommandRequest::new(Command::UdpAssociate, socket.local_addr()?.into());
        codec::write_message(&mut control, &request).await?;
        let reply = read_reply(&mut control).await?;

        let relay = match reply.bound.to_socket_addr() {
            // An all-zero address means "same host as the proxy"
            Some(addr) if addr.ip().is_unspecified() => {
                SocketAddr::new(self.proxy_addr.ip(), addr.port())
            }
            Some(addr) => addr,
            None => {
                return Err(SocksError::Protocol(format!(
                    "UDP relay announced as domain {}",
                    reply.bound
                )));
            }
        };

        Ok(UdpClient {
            control,
            socket,
            relay,
        })
    }

    async fn open(&self) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.proxy_addr).await?;
        stream.set_nodelay(true)?;
        self.handshake(&mut stream).await?;
        Ok(stream)
    }

    async fn request(
        &self,
        command: Command,
        target: TargetAddress,
    ) -> Result<(TcpStream, TargetAddress)> {
        let mut stream = self.open().await?;
        let target = self.prepare_target(target).await?;

        codec::write_message(&mut stream, &CommandRequest::new(command, target)).await?;
        let reply = read_reply(&mut stream).await?;
        Ok((stream, reply.bound))
    }

    async fn prepare_target(&self, target: TargetAddress) -> Result<TargetAddress> {
        if self.resolve_locally && matches!(target.address, Address::DomainName(_)) {
            let resolved = target.resolve().await?;
            debug!("resolved {target} to {resolved}");
            return Ok(resolved.into());
        }
        Ok(target)
    }
}

/// PendingBind is a BIND request waiting for its inbound connection
#[derive(Debug)]
pub struct PendingBind {
    stream: TcpStream,
    listen_addr: TargetAddress,
}

impl PendingBind {
    /// listen_addr is where the proxy waits for the inbound connection
    pub fn listen_addr(&self) -> &TargetAddress {
        &self.listen_addr
    }

    /// accept waits for the second reply; returns the relayed stream and the
    /// address of the peer that connected
    pub async fn accept(mut self) -> Result<(TcpStream, TargetAddress)> {
        let reply = read_reply(&mut self.stream).await?;
        Ok((self.stream, reply.bound))
    }
}

/// UdpClient sends and receives datagrams through a UDP ASSOCIATE relay.
/// Dropping it closes the control connection, which ends the association.
#[derive(Debug)]
pub struct UdpClient {
    control: TcpStream,
    socket: UdpSocket,
    relay: SocketAddr,
}

impl UdpClient {
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// send_to wraps payload for target and sends it to the relay
    pub async fn send_to(&self, payload: &[u8], target: &TargetAddress) -> Result<()> {
        let packet = codec::encapsulate(target, payload)?;
        self.socket.send_to(&packet, self.relay).await?;
        Ok(())
    }

    /// recv_from receives one datagram from the relay and unwraps it
    pub async fn recv_from(&self) -> Result<(TargetAddress, Vec<u8>)> {
        let mut buf = vec![0u8; MAX_DGRAM];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.relay {
                debug!("ignoring datagram from {from}, not the relay");
                continue;
            }
            let (source, payload) = codec::decapsulate(&buf[..len])?;
            return Ok((source, payload.to_vec()));
        }
    }

    /// into_control hands back the control connection
    pub fn into_control(self) -> TcpStream {
        self.control
    }
}

async fn read_reply(stream: &mut TcpStream) -> Result<CommandReply> {
    let reply = CommandReply::decode(stream).await?;
    if reply.reply != ReplyCode::Succeeded {
        return Err(SocksError::Rejected(reply.reply));
    }
    Ok(reply)
}
