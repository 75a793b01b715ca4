//! decoder/encoder for the SOCKS5 address header embedded in REQ frames.
//!
//! the frame codec treats this as an opaque collaborator: it only needs
//! `(addr, port, consumed)` back, and passes whatever bytes follow through
//! as `remain`. kept minimal on purpose — SOCKS5 negotiation with local
//! applications is out of scope for this crate.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::errors::FrameError;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// a resolved or to-be-resolved SOCKS5 target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl std::fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocksAddr::V4(ip) => write!(f, "{ip}"),
            SocksAddr::V6(ip) => write!(f, "{ip}"),
            SocksAddr::Domain(d) => write!(f, "{d}"),
        }
    }
}

/// parse a SOCKS5 address header `ATYP || addr || port` from the front of
/// `buf`, returning the address, port, and number of bytes consumed. any
/// trailing bytes are the caller's concern (`remain` in the REQ frame).
pub fn parse_socks_addr(buf: &[u8]) -> Result<(SocksAddr, u16, usize), FrameError> {
    let atyp = *buf.first().ok_or(FrameError::MalformedAddr)?;
    match atyp {
        ATYP_IPV4 => {
            if buf.len() < 1 + 4 + 2 {
                return Err(FrameError::MalformedAddr);
            }
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok((SocksAddr::V4(ip), port, 7))
        }
        ATYP_IPV6 => {
            if buf.len() < 1 + 16 + 2 {
                return Err(FrameError::MalformedAddr);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            Ok((SocksAddr::V6(ip), port, 19))
        }
        ATYP_DOMAIN => {
            let len = *buf.get(1).ok_or(FrameError::MalformedAddr)? as usize;
            let end = 2 + len;
            if buf.len() < end + 2 {
                return Err(FrameError::MalformedAddr);
            }
            let domain = std::str::from_utf8(&buf[2..end])
                .map_err(|_| FrameError::MalformedAddr)?
                .to_string();
            let port = u16::from_be_bytes([buf[end], buf[end + 1]]);
            Ok((SocksAddr::Domain(domain), port, end + 2))
        }
        _ => Err(FrameError::MalformedAddr),
    }
}

/// encode `(addr, port)` back into a SOCKS5 address header.
pub fn encode_socks_addr(addr: &SocksAddr, port: u16) -> Vec<u8> {
    let mut out = Vec::new();
    match addr {
        SocksAddr::V4(ip) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        SocksAddr::V6(ip) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
        SocksAddr::Domain(d) => {
            out.push(ATYP_DOMAIN);
            out.push(d.len() as u8);
            out.extend_from_slice(d.as_bytes());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_round_trip() {
        let hdr = encode_socks_addr(&SocksAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
        assert_eq!(hdr, vec![0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90]);
        let (addr, port, consumed) = parse_socks_addr(&hdr).unwrap();
        assert_eq!(addr, SocksAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(port, 8080);
        assert_eq!(consumed, hdr.len());
    }

    #[test]
    fn domain_round_trip_with_remain() {
        let mut hdr = encode_socks_addr(&SocksAddr::Domain("example.com".into()), 443);
        hdr.extend_from_slice(b"leftover");
        let (addr, port, consumed) = parse_socks_addr(&hdr).unwrap();
        assert_eq!(addr, SocksAddr::Domain("example.com".into()));
        assert_eq!(port, 443);
        assert_eq!(&hdr[consumed..], b"leftover");
    }

    #[test]
    fn truncated_header_is_malformed() {
        assert!(parse_socks_addr(&[0x01, 0x7F, 0x00]).is_err());
        assert!(parse_socks_addr(&[]).is_err());
    }
}
