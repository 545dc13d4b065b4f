//! Byte-exact encoding and decoding of SOCKS5 messages (RFC 1928 / RFC 1929)
//!
//! Every message can be decoded from an async stream and encoded into a
//! buffer, so the same types serve the server and the client side. Short
//! reads surface as [`SocksError::IncompleteMessage`], never as zero-filled
//! messages.

use crate::address::TargetAddress;
use crate::error::{Result, SocksError};
use crate::protocol::{
    AddressType, AuthMethod, AuthStatus, Command, RSV, ReplyCode, USERPASS_VERSION, Version,
};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Decode reads one message from a stream
#[async_trait]
pub trait Decode: Sized {
    async fn decode<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + ?Sized;
}

/// Encode appends the wire form of a message to a buffer
pub trait Encode {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

/// write_message encodes msg, writes it and flushes the writer
pub async fn write_message<W, M>(writer: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
    M: Encode + ?Sized,
{
    let bytes = msg.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn incomplete(field: &'static str) -> impl FnOnce(io::Error) -> SocksError {
    move |e| match e.kind() {
        io::ErrorKind::UnexpectedEof => SocksError::IncompleteMessage(field),
        _ => SocksError::Io(e),
    }
}

pub(crate) async fn read_u8<R>(reader: &mut R, field: &'static str) -> Result<u8>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    reader.read_u8().await.map_err(incomplete(field))
}

pub(crate) async fn read_array<R, const N: usize>(
    reader: &mut R,
    field: &'static str,
) -> Result<[u8; N]>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).await.map_err(incomplete(field))?;
    Ok(buf)
}

pub(crate) async fn read_bytes<R>(reader: &mut R, len: usize, field: &'static str) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(incomplete(field))?;
    Ok(buf)
}

pub(crate) async fn read_port<R>(reader: &mut R) -> Result<u16>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    reader.read_u16().await.map_err(incomplete("port"))
}

async fn read_version<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    // Ensure version is 0x05 -> SOCKS5
    let version = read_u8(reader, "version").await?;
    if version != Version::SOCKS5 as u8 {
        return Err(SocksError::UnsupportedVersion(version));
    }
    Ok(())
}

// =================
// METHOD SELECTION
// =================

/// MethodSelectionRequest is the client hello
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSelectionRequest {
    pub methods: Vec<u8>,
}

impl MethodSelectionRequest {
    pub fn new(methods: Vec<u8>) -> Self {
        Self { methods }
    }
}

#[async_trait]
impl Decode for MethodSelectionRequest {
    async fn decode<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        read_version(reader).await?;
        let n_methods = read_u8(reader, "method count").await?;
        let methods = read_bytes(reader, n_methods as usize, "methods").await?;
        Ok(Self { methods })
    }
}

impl Encode for MethodSelectionRequest {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let n_methods = u8::try_from(self.methods.len())
            .map_err(|_| SocksError::Protocol("at most 255 methods can be offered".into()))?;
        buf.extend_from_slice(&[Version::SOCKS5 as u8, n_methods]);
        buf.extend_from_slice(&self.methods);
        Ok(())
    }
}

/// MethodSelectionResponse is the server's method choice
///
/// ```text
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSelectionResponse {
    pub method: u8,
}

impl MethodSelectionResponse {
    pub fn new(method: u8) -> Self {
        Self { method }
    }

    pub fn is_acceptable(&self) -> bool {
        self.method != AuthMethod::NoAcceptable as u8
    }
}

#[async_trait]
impl Decode for MethodSelectionResponse {
    async fn decode<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        read_version(reader).await?;
        let method = read_u8(reader, "selected method").await?;
        Ok(Self { method })
    }
}

impl Encode for MethodSelectionResponse {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&[Version::SOCKS5 as u8, self.method]);
        Ok(())
    }
}

// ==========================
// USERNAME/PASSWORD (1929)
// ==========================

/// UserPassRequest is the username/password subnegotiation request
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for UserPassRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserPassRequest")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Decode for UserPassRequest {
    async fn decode<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        // Get subnegotiation version -> 0x01 expected
        let version = read_u8(reader, "subnegotiation version").await?;
        if version != USERPASS_VERSION {
            return Err(SocksError::Protocol(format!(
                "invalid username/password subnegotiation version: {version:#04x}"
            )));
        }

        let username_len = read_u8(reader, "username length").await?;
        let username = read_bytes(reader, username_len as usize, "username").await?;
        let password_len = read_u8(reader, "password length").await?;
        let password = read_bytes(reader, password_len as usize, "password").await?;

        let utf8 = |bytes: Vec<u8>, field: &str| {
            String::from_utf8(bytes)
                .map_err(|_| SocksError::Protocol(format!("{field} is not valid UTF-8")))
        };

        Ok(Self {
            username: utf8(username, "username")?,
            password: utf8(password, "password")?,
        })
    }
}

impl Encode for UserPassRequest {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let field_len = |value: &str, field: &str| {
            u8::try_from(value.len())
                .ok()
                .filter(|len| *len > 0)
                .ok_or_else(|| SocksError::Protocol(format!("{field} must be 1-255 bytes")))
        };
        let username_len = field_len(&self.username, "username")?;
        let password_len = field_len(&self.password, "password")?;

        buf.push(USERPASS_VERSION);
        buf.push(username_len);
        buf.extend_from_slice(self.username.as_bytes());
        buf.push(password_len);
        buf.extend_from_slice(self.password.as_bytes());
        Ok(())
    }
}

/// UserPassResponse is the username/password subnegotiation reply
///
/// ```text
/// +----+--------+
/// |VER | STATUS |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPassResponse {
    pub status: u8,
}

impl UserPassResponse {
    pub fn new(status: AuthStatus) -> Self {
        Self {
            status: status as u8,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AuthStatus::Success as u8
    }
}

#[async_trait]
impl Decode for UserPassResponse {
    async fn decode<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let version = read_u8(reader, "subnegotiation version").await?;
        if version != USERPASS_VERSION {
            return Err(SocksError::Protocol(format!(
                "invalid username/password subnegotiation version: {version:#04x}"
            )));
        }
        let status = read_u8(reader, "status").await?;
        Ok(Self { status })
    }
}

impl Encode for UserPassResponse {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&[USERPASS_VERSION, self.status]);
        Ok(())
    }
}

// =========
// REQUESTS
// =========

/// CommandRequest is a client command
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// An unknown CMD or ATYP still decodes; the request then carries the
/// reply code the server has to answer with in `rejection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Raw CMD byte as sent by the client
    pub command: u8,
    pub target: TargetAddress,
    pub rejection: Option<ReplyCode>,
}

impl CommandRequest {
    pub fn new(command: Command, target: TargetAddress) -> Self {
        Self {
            command: command as u8,
            target,
            rejection: None,
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_byte(self.command)
    }

    pub fn is_valid(&self) -> bool {
        self.rejection.is_none()
    }
}

#[async_trait]
impl Decode for CommandRequest {
    async fn decode<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        read_version(reader).await?;
        let command = read_u8(reader, "command").await?;
        // Not validating RSV (RESERVED) -> 0x00
        read_u8(reader, "reserved").await?;
        let atyp = read_u8(reader, "address type").await?;

        // Unknown ATYP: the address length is unknown, stop reading here
        if AddressType::from_byte(atyp).is_none() {
            return Ok(Self {
                command,
                target: TargetAddress::unspecified(),
                rejection: Some(ReplyCode::AddrTypeUnsupported),
            });
        }

        let target = TargetAddress::read_body(reader, atyp).await?;
        let rejection = match Command::from_byte(command) {
            Some(_) => None,
            None => Some(ReplyCode::CommandNotSupported),
        };

        Ok(Self {
            command,
            target,
            rejection,
        })
    }
}

impl Encode for CommandRequest {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&[Version::SOCKS5 as u8, self.command, RSV]);
        self.target.write_to(buf)
    }
}

/// CommandReply is the server's answer to a command
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub reply: ReplyCode,
    pub bound: TargetAddress,
}

impl CommandReply {
    pub fn new(reply: ReplyCode, bound: TargetAddress) -> Self {
        Self { reply, bound }
    }

    pub fn success(bound: impl Into<TargetAddress>) -> Self {
        Self::new(ReplyCode::Succeeded, bound.into())
    }

    /// failure builds an error reply with an all-zero bound address
    pub fn failure(reply: ReplyCode) -> Self {
        Self::new(reply, TargetAddress::unspecified())
    }
}

#[async_trait]
impl Decode for CommandReply {
    async fn decode<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        read_version(reader).await?;
        let rep = read_u8(reader, "reply").await?;
        let reply = ReplyCode::from_byte(rep)
            .ok_or_else(|| SocksError::Protocol(format!("unassigned reply code {rep:#04x}")))?;
        read_u8(reader, "reserved").await?;
        let bound = TargetAddress::read_from(reader).await?;
        Ok(Self { reply, bound })
    }
}

impl Encode for CommandReply {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&[Version::SOCKS5 as u8, self.reply as u8, RSV]);
        self.bound.write_to(buf)
    }
}

// ===========
// UDP HEADER
// ===========

/// UdpHeader prefixes every datagram exchanged with a UDP ASSOCIATE client
///
/// ```text
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub frag: u8,
    pub target: TargetAddress,
}

impl UdpHeader {
    pub fn new(target: TargetAddress) -> Self {
        Self { frag: 0, target }
    }

    /// decode splits a datagram into its header and payload
    pub fn decode(datagram: &[u8]) -> Result<(Self, &[u8])> {
        if datagram.len() < 4 {
            return Err(SocksError::IncompleteMessage("UDP header"));
        }
        if datagram[0] != RSV || datagram[1] != RSV {
            return Err(SocksError::Protocol("UDP header reserved bytes must be zero".into()));
        }
        // Fragment reassembly is not supported
        let frag = datagram[2];
        if frag != 0 {
            return Err(SocksError::Fragmented(frag));
        }

        let (target, consumed) = TargetAddress::parse_from_packet(datagram, 3)?;
        Ok((Self { frag, target }, &datagram[3 + consumed..]))
    }
}

impl Encode for UdpHeader {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&[RSV, RSV, self.frag]);
        self.target.write_to(buf)
    }
}

/// encapsulate prepends a UDP header for target to payload
pub fn encapsulate(target: &TargetAddress, payload: &[u8]) -> Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(3 + target.serialized_len() + payload.len());
    UdpHeader::new(target.clone()).encode(&mut packet)?;
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// decapsulate strips the UDP header and returns the target with the payload
pub fn decapsulate(datagram: &[u8]) -> Result<(TargetAddress, &[u8])> {
    let (header, payload) = UdpHeader::decode(datagram)?;
    Ok((header.target, payload))
}
