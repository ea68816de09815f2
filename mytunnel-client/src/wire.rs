//! Wire codec: SOCKS5-style address encoding and the length-prefixed
//! framed-datagram format used to carry UDP packets over a single HTTP/2
//! stream.
//!
//! Address tag (ATYP) values match RFC 1928.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// A SOCKS5-style destination address: an IPv4/IPv6 literal or a domain
/// name to be resolved by whoever dials it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

impl SocksAddr {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => SocksAddr::V4(*v4.ip()),
            SocketAddr::V6(v6) => SocksAddr::V6(*v6.ip()),
        }
    }

    /// Encode `self:port` into `buf`, appending.
    pub fn encode(&self, port: u16, buf: &mut Vec<u8>) {
        match self {
            SocksAddr::V4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            SocksAddr::Domain(name) => {
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
            SocksAddr::V6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
        }
        buf.extend_from_slice(&port.to_be_bytes());
    }

    /// Decode an address+port from the front of `data`, returning the
    /// value and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> io::Result<(SocksAddr, u16, usize)> {
        if data.is_empty() {
            return Err(invalid("empty address"));
        }
        let atyp = data[0];
        let (addr, consumed) = match atyp {
            ATYP_IPV4 => {
                if data.len() < 1 + 4 + 2 {
                    return Err(invalid("truncated ipv4 address"));
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                (SocksAddr::V4(ip), 1 + 4)
            }
            ATYP_DOMAIN => {
                if data.len() < 2 {
                    return Err(invalid("truncated domain length"));
                }
                let len = data[1] as usize;
                if data.len() < 2 + len + 2 {
                    return Err(invalid("truncated domain address"));
                }
                let name = String::from_utf8(data[2..2 + len].to_vec())
                    .map_err(|_| invalid("domain is not utf-8"))?;
                (SocksAddr::Domain(name), 2 + len)
            }
            ATYP_IPV6 => {
                if data.len() < 1 + 16 + 2 {
                    return Err(invalid("truncated ipv6 address"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                (SocksAddr::V6(Ipv6Addr::from(octets)), 1 + 16)
            }
            other => return Err(invalid(&format!("unknown ATYP {other:#x}"))),
        };
        let port = u16::from_be_bytes([data[consumed], data[consumed + 1]]);
        Ok((addr, port, consumed + 2))
    }

    /// Read an address+port directly off an async stream.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<(SocksAddr, u16)> {
        let mut head = [0u8; 1];
        r.read_exact(&mut head).await?;
        match head[0] {
            ATYP_IPV4 => {
                let mut rest = [0u8; 4 + 2];
                r.read_exact(&mut rest).await?;
                let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
                let port = u16::from_be_bytes([rest[4], rest[5]]);
                Ok((SocksAddr::V4(ip), port))
            }
            ATYP_DOMAIN => {
                let mut len_buf = [0u8; 1];
                r.read_exact(&mut len_buf).await?;
                let mut name_buf = vec![0u8; len_buf[0] as usize + 2];
                r.read_exact(&mut name_buf).await?;
                let port_off = name_buf.len() - 2;
                let name = String::from_utf8(name_buf[..port_off].to_vec())
                    .map_err(|_| invalid("domain is not utf-8"))?;
                let port = u16::from_be_bytes([name_buf[port_off], name_buf[port_off + 1]]);
                Ok((SocksAddr::Domain(name), port))
            }
            ATYP_IPV6 => {
                let mut rest = [0u8; 16 + 2];
                r.read_exact(&mut rest).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rest[..16]);
                let port = u16::from_be_bytes([rest[16], rest[17]]);
                Ok((SocksAddr::V6(Ipv6Addr::from(octets)), port))
            }
            other => Err(invalid(&format!("unknown ATYP {other:#x}"))),
        }
    }

    pub fn to_host_string(&self) -> String {
        match self {
            SocksAddr::V4(ip) => ip.to_string(),
            SocksAddr::Domain(name) => name.clone(),
            SocksAddr::V6(ip) => ip.to_string(),
        }
    }
}

/// Build a SOCKS5 UDP request/reply header: `RSV(2) FRAG(1) ATYP ADDR PORT`,
/// followed by the caller's payload.
pub fn build_udp_header(addr: SocksAddr, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + 19 + payload.len());
    buf.extend_from_slice(&[0x00, 0x00, 0x00]); // RSV RSV FRAG
    addr.encode(port, &mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Parse a SOCKS5 UDP header, returning address, port, and the payload
/// slice. Fragmented datagrams (FRAG != 0) are rejected by the caller per
/// spec; this only parses the header shape.
pub fn parse_udp_header(data: &[u8]) -> io::Result<(SocksAddr, u16, u8, &[u8])> {
    if data.len() < 4 {
        return Err(invalid("UDP datagram shorter than header"));
    }
    let frag = data[2];
    let (addr, port, consumed) = SocksAddr::decode(&data[3..])?;
    Ok((addr, port, frag, &data[3 + consumed..]))
}

/// Write one length-prefixed frame (`u16` big-endian length + payload) in a
/// single `write_all` call. Splitting this into two writes would let two
/// concurrent writers interleave a length header with another writer's
/// payload, corrupting the stream - the write must be atomic.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(invalid("frame exceeds 65535 bytes"));
    }
    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_v4() {
        let mut buf = Vec::new();
        SocksAddr::V4(Ipv4Addr::new(10, 0, 0, 1)).encode(8080, &mut buf);
        let (addr, port, consumed) = SocksAddr::decode(&buf).unwrap();
        assert_eq!(addr, SocksAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(port, 8080);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn roundtrip_domain() {
        let mut buf = Vec::new();
        SocksAddr::Domain("example.com".into()).encode(443, &mut buf);
        let (addr, port, consumed) = SocksAddr::decode(&buf).unwrap();
        assert_eq!(addr, SocksAddr::Domain("example.com".into()));
        assert_eq!(port, 443);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn roundtrip_v6() {
        let ip = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let mut buf = Vec::new();
        SocksAddr::V6(ip).encode(53, &mut buf);
        let (addr, port, _) = SocksAddr::decode(&buf).unwrap();
        assert_eq!(addr, SocksAddr::V6(ip));
        assert_eq!(port, 53);
    }

    #[test]
    fn rejects_unknown_atyp() {
        let buf = [0x7f, 0, 0, 0, 0];
        assert!(SocksAddr::decode(&buf).is_err());
    }

    #[test]
    fn udp_header_roundtrip() {
        let header = build_udp_header(SocksAddr::V4(Ipv4Addr::LOCALHOST), 53, b"hello");
        let (addr, port, frag, payload) = parse_udp_header(&header).unwrap();
        assert_eq!(addr, SocksAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(port, 53);
        assert_eq!(frag, 0);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello world").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_frame(&mut cursor).await.unwrap();
        assert_eq!(payload, b"hello world");
    }
}
