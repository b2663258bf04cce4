//! SOCKS5 handshake and UDP relay header codec (RFC 1928).
//!
//! Both sides of the exchange are here: the client handshake used when
//! connecting to a stream host, and the server-side method negotiation and
//! request parsing used by the relay server. Bytestreams always address the
//! destination by domain name, the domain being the negotiation key.
//!
//! ```text
//! UDP relay packet:
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes.
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;

/// Longest domain a request can carry.
const MAX_DOMAIN_LEN: usize = 255;

/// SOCKS5 protocol errors.
#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("invalid SOCKS version: {0:#04x}")]
    InvalidVersion(u8),

    #[error("no acceptable authentication methods")]
    NoAcceptableMethods,

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("fragmented UDP not supported")]
    FragmentedUdp,

    #[error("request rejected with reply code {0:#04x}")]
    Rejected(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed SOCKS5 request.
#[derive(Debug)]
pub struct Socks5Request {
    pub command: u8,
    pub atyp: u8,
    /// Raw address bytes (without atyp byte): for IPv4 = 4 bytes, IPv6 = 16 bytes,
    /// domain = the domain bytes.
    pub addr_data: Vec<u8>,
    pub port: u16,
}

impl Socks5Request {
    /// Returns the destination domain, if the request addressed one.
    pub fn domain(&self) -> Option<String> {
        (self.atyp == ATYP_DOMAIN)
            .then(|| String::from_utf8(self.addr_data.clone()).ok())
            .flatten()
    }
}

/// Perform the client side of a SOCKS5 handshake.
///
/// Offers only "no authentication", then issues `command` against
/// `domain:port`. Returns the bound address from the reply when it is an IP
/// address.
pub async fn client_handshake<S>(
    stream: &mut S,
    domain: &str,
    port: u16,
    command: u8,
) -> Result<Option<SocketAddr>, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5_VERSION, 1, METHOD_NO_AUTH])
        .await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion(choice[0]));
    }
    if choice[1] != METHOD_NO_AUTH {
        return Err(Socks5Error::NoAcceptableMethods);
    }

    let domain = truncate_domain(domain);
    let mut request = Vec::with_capacity(7 + domain.len());
    request.extend_from_slice(&[SOCKS5_VERSION, command, 0x00, ATYP_DOMAIN]);
    request.push(domain.len() as u8);
    request.extend_from_slice(domain);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    // VER REP RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion(header[0]));
    }
    let (addr_data, bound_port) = read_address(stream, header[3]).await?;
    if header[1] != REPLY_SUCCEEDED {
        return Err(Socks5Error::Rejected(header[1]));
    }

    Ok(match header[3] {
        ATYP_IPV4 => {
            let ip: [u8; 4] = addr_data[..4].try_into().unwrap_or_default();
            Some(SocketAddr::from((Ipv4Addr::from(ip), bound_port)))
        }
        ATYP_IPV6 => {
            let ip: [u8; 16] = addr_data[..16].try_into().unwrap_or_default();
            Some(SocketAddr::from((Ipv6Addr::from(ip), bound_port)))
        }
        _ => None,
    })
}

fn truncate_domain(domain: &str) -> &[u8] {
    let bytes = domain.as_bytes();
    &bytes[..bytes.len().min(MAX_DOMAIN_LEN)]
}

/// Perform SOCKS5 method negotiation (server side).
///
/// Reads the client's greeting and responds with NO AUTH (0x00).
pub async fn negotiate_method<S>(stream: &mut S) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion(header[0]));
    }

    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    } else {
        let _ = stream
            .write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE])
            .await;
        Err(Socks5Error::NoAcceptableMethods)
    }
}

/// Read the SOCKS5 request after method negotiation.
pub async fn read_request<S>(stream: &mut S) -> Result<Socks5Request, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    // VER CMD RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion(header[0]));
    }

    let command = header[1];
    let atyp = header[3];
    let (addr_data, port) = read_address(stream, atyp).await?;

    Ok(Socks5Request {
        command,
        atyp,
        addr_data,
        port,
    })
}

/// Read address based on address type.
async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<(Vec<u8>, u16), Socks5Error>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6]; // 4 addr + 2 port
            stream.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok((buf[..4].to_vec(), port))
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let domain_len = len_buf[0] as usize;
            let mut domain = vec![0u8; domain_len + 2]; // domain + port
            stream.read_exact(&mut domain).await?;
            let port = u16::from_be_bytes([domain[domain_len], domain[domain_len + 1]]);
            domain.truncate(domain_len);
            Ok((domain, port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18]; // 16 addr + 2 port
            stream.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok((buf[..16].to_vec(), port))
        }
        _ => Err(Socks5Error::UnsupportedAddressType(atyp)),
    }
}

/// Send a SOCKS5 reply.
pub async fn send_reply<S>(stream: &mut S, reply: u8, bind_addr: &SocketAddr) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(22);
    buf.push(SOCKS5_VERSION);
    buf.push(reply);
    buf.push(0x00); // RSV

    match bind_addr {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }

    stream.write_all(&buf).await
}

/// Send a SOCKS5 reply with a zeroed bind address (0.0.0.0:0).
pub async fn send_reply_unspecified<S>(stream: &mut S, reply: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], 0u16));
    send_reply(stream, reply, &addr).await
}

/// Parsed SOCKS5 UDP datagram addressed to a domain.
#[derive(Debug, PartialEq, Eq)]
pub struct Socks5UdpPacket<'a> {
    pub domain: &'a str,
    pub port: u16,
    pub payload: &'a [u8],
}

/// Parse a SOCKS5 UDP datagram from a buffer.
///
/// Only domain destinations are meaningful for bytestreams; other address
/// types are rejected.
pub fn parse_udp(buf: &[u8]) -> Result<Socks5UdpPacket<'_>, Socks5Error> {
    if buf.len() < 4 {
        return Err(Socks5Error::FragmentedUdp);
    }

    // RSV = 2 bytes, FRAG = 1 byte (must be 0x00)
    if buf[2] != 0x00 {
        return Err(Socks5Error::FragmentedUdp);
    }

    let atyp = buf[3];
    if atyp != ATYP_DOMAIN || buf.len() < 5 {
        return Err(Socks5Error::UnsupportedAddressType(atyp));
    }

    let domain_len = buf[4] as usize;
    let start = 5;
    let end = start + domain_len;
    if buf.len() < end + 2 {
        return Err(Socks5Error::UnsupportedAddressType(atyp));
    }
    let domain = std::str::from_utf8(&buf[start..end])
        .map_err(|_| Socks5Error::UnsupportedAddressType(atyp))?;
    let port = u16::from_be_bytes([buf[end], buf[end + 1]]);

    Ok(Socks5UdpPacket {
        domain,
        port,
        payload: &buf[end + 2..],
    })
}

/// Write a SOCKS5 UDP datagram header + payload addressed to `domain:port`.
pub fn write_udp(domain: &str, port: u16, payload: &[u8]) -> Vec<u8> {
    let domain = truncate_domain(domain);
    let mut buf = Vec::with_capacity(7 + domain.len() + payload.len());

    // RSV (2 bytes) + FRAG (1 byte)
    buf.extend_from_slice(&[0x00, 0x00, 0x00]);
    buf.push(ATYP_DOMAIN);
    buf.push(domain.len() as u8);
    buf.extend_from_slice(domain);
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(payload);

    buf
}
