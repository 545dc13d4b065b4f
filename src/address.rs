use crate::codec::{read_array, read_bytes, read_port, read_u8};
use crate::error::{Result, SocksError};
use crate::protocol::AddressType;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::AsyncRead;

/// Address represents a network address or domain to be used as the
/// SOCKS5 target address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    IPv4(Ipv4Addr),
    DomainName(String),
    IPv6(Ipv6Addr),
}

/// Address implementation block
impl Address {
    /// address_type returns the ATYP byte used on the wire for this address
    pub fn address_type(&self) -> AddressType {
        match self {
            Address::IPv4(_) => AddressType::IPv4,
            Address::DomainName(_) => AddressType::DomainName,
            Address::IPv6(_) => AddressType::IPv6,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::IPv4(ip) => Some(IpAddr::V4(*ip)),
            Address::IPv6(ip) => Some(IpAddr::V6(*ip)),
            Address::DomainName(_) => None,
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Address::IPv4(ip),
            IpAddr::V6(ip) => Address::IPv6(ip),
        }
    }
}

/// TargetAddress represents a forward proxy address and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    pub address: Address,
    pub port: u16,
}

/// TargetAddress implementation block
impl TargetAddress {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    /// domain builds a domain-name target
    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self::new(Address::DomainName(name.into()), port)
    }

    /// unspecified is the all-zero IPv4 address used in failure replies
    pub fn unspecified() -> Self {
        Self::new(Address::IPv4(Ipv4Addr::UNSPECIFIED), 0)
    }

    /// to_socket_addr returns the target as a SocketAddr, or None for domain names
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// resolve turns the target into a SocketAddr, looking up domain names
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        match &self.address {
            Address::DomainName(name) => tokio::net::lookup_host((name.as_str(), self.port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no address found for {name}"),
                    )
                }),
            Address::IPv4(ip) => Ok(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            Address::IPv6(ip) => Ok(SocketAddr::new(IpAddr::V6(*ip), self.port)),
        }
    }

    /// resolve_all returns every address the target resolves to, in
    /// resolver order
    pub async fn resolve_all(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = match &self.address {
            Address::DomainName(name) => tokio::net::lookup_host((name.as_str(), self.port))
                .await?
                .collect(),
            _ => self.to_socket_addr().into_iter().collect(),
        };
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {self}"),
            ));
        }
        Ok(addrs)
    }

    /// serialized_len is the number of bytes ATYP + ADDR + PORT take on the wire
    pub fn serialized_len(&self) -> usize {
        let addr_len = match &self.address {
            Address::IPv4(_) => 4,
            Address::DomainName(name) => 1 + name.len(),
            Address::IPv6(_) => 16,
        };
        1 + addr_len + 2
    }

    /// read_from reads ATYP, DST.ADDR and DST.PORT from a stream
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let atyp = read_u8(reader, "address type").await?;
        Self::read_body(reader, atyp).await
    }

    /// read_body reads DST.ADDR and DST.PORT once ATYP has been consumed
    pub async fn read_body<R>(reader: &mut R, atyp: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let address = match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                Address::IPv4(Ipv4Addr::from(read_array::<_, 4>(reader, "IPv4 address").await?))
            }
            Some(AddressType::DomainName) => {
                // First octet in DomainName contains the number of
                // octets to follow
                let len = read_u8(reader, "domain length").await?;
                if len == 0 {
                    return Err(SocksError::Protocol("domain length cannot be 0".into()));
                }
                let domain = read_bytes(reader, len as usize, "domain name").await?;
                Address::DomainName(String::from_utf8(domain).map_err(|e| {
                    SocksError::Protocol(format!("domain name is not UTF-8: {e}"))
                })?)
            }
            Some(AddressType::IPv6) => Address::IPv6(Ipv6Addr::from(
                read_array::<_, 16>(reader, "IPv6 address").await?,
            )),
            None => return Err(SocksError::UnsupportedAddressType(atyp)),
        };

        let port = read_port(reader).await?;
        Ok(Self::new(address, port))
    }

    /// parse_from_packet parses ATYP, address and port out of a datagram
    /// and returns the address with the number of bytes consumed
    pub fn parse_from_packet(packet: &[u8], start_offset: usize) -> Result<(Self, usize)> {
        // Set offset to maintain start
        let mut offset = start_offset;

        let atyp = *packet
            .get(offset)
            .ok_or(SocksError::IncompleteMessage("address type"))?;
        offset += 1;

        let address = match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                let ip: [u8; 4] = take(packet, &mut offset, 4, "IPv4 address")?
                    .try_into()
                    .map_err(|_| SocksError::IncompleteMessage("IPv4 address"))?;
                Address::IPv4(Ipv4Addr::from(ip))
            }
            Some(AddressType::DomainName) => {
                let len = take(packet, &mut offset, 1, "domain length")?[0] as usize;
                if len == 0 {
                    return Err(SocksError::Protocol("domain length cannot be 0".into()));
                }
                let domain = take(packet, &mut offset, len, "domain name")?;
                Address::DomainName(
                    String::from_utf8(domain.to_vec())
                        .map_err(|e| SocksError::Protocol(format!("invalid domain: {e}")))?,
                )
            }
            Some(AddressType::IPv6) => {
                let ip: [u8; 16] = take(packet, &mut offset, 16, "IPv6 address")?
                    .try_into()
                    .map_err(|_| SocksError::IncompleteMessage("IPv6 address"))?;
                Address::IPv6(Ipv6Addr::from(ip))
            }
            None => return Err(SocksError::UnsupportedAddressType(atyp)),
        };

        // Grab port -> BigEndian (network order)
        let port = take(packet, &mut offset, 2, "port")?;
        let port = u16::from_be_bytes([port[0], port[1]]);

        Ok((Self::new(address, port), offset - start_offset))
    }

    /// write_to appends ATYP, address and port to buf
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(self.address.address_type() as u8);
        match &self.address {
            Address::IPv4(ip) => buf.extend_from_slice(&ip.octets()),
            Address::IPv6(ip) => buf.extend_from_slice(&ip.octets()),
            Address::DomainName(name) => {
                let len = u8::try_from(name.len())
                    .ok()
                    .filter(|len| *len > 0)
                    .ok_or_else(|| {
                        SocksError::Protocol(format!(
                            "domain name must be 1-255 bytes, got {}",
                            name.len()
                        ))
                    })?;
                buf.push(len);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(())
    }
}

/// take returns the next len bytes of data and advances offset past them
fn take<'a>(
    data: &'a [u8],
    offset: &mut usize,
    len: usize,
    field: &'static str,
) -> Result<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or(SocksError::IncompleteMessage(field))?;
    let slice = &data[*offset..end];
    *offset = end;
    Ok(slice)
}

impl From<SocketAddr> for TargetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().into(), addr.port())
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::IPv4(ip) => write!(f, "{ip}:{}", self.port),
            Address::IPv6(ip) => write!(f, "[{ip}]:{}", self.port),
            Address::DomainName(name) => write!(f, "{name}:{}", self.port),
        }
    }
}
