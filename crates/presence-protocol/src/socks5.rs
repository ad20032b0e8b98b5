//! SOCKS5 bytestream handshake codec.
//!
//! Only the client side of the no-authentication CONNECT exchange used by
//! XMPP bytestreams is covered:
//!
//! ```text
//! -> 05 00                          (greeting / method selection)
//! <- 05 00                          (no authentication)
//! -> 05 01 00 03 14 <digest> 00 00  (CONNECT to domain "digest", port 0)
//! <- 05 00 00 <atyp> <addr> <port>  (reply, then file payload)
//! ```
//!
//! The functions here are pure; the socket work lives in the daemon.

use sha1::{Digest, Sha1};
use thiserror::Error;

/// SOCKS protocol version.
pub const VERSION: u8 = 0x05;

/// Greeting sent to a stream host.
pub const METHOD_SELECTION: [u8; 2] = [VERSION, 0x00];

/// Expected answer: version 5, "no authentication" selected.
pub const METHOD_ACCEPTED: [u8; 2] = [VERSION, 0x00];

const CMD_CONNECT: u8 = 0x01;
const RESERVED: u8 = 0x00;
const REPLY_SUCCEEDED: u8 = 0x00;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// VER, REP, RSV, ATYP
const REPLY_PREFIX_LEN: usize = 4;
const PORT_LEN: usize = 2;

/// Handshake failures for one stream host candidate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("Unexpected method selection reply: {0:02x?}")]
    MethodRejected(Vec<u8>),

    #[error("CONNECT failed: version {version:#04x}, reply {reply:#04x}, reserved {reserved:#04x}")]
    ConnectFailed { version: u8, reply: u8, reserved: u8 },

    #[error("Unsupported bind address type {0:#04x}")]
    AddressType(u8),
}

/// Checks the stream host's answer to [`METHOD_SELECTION`].
///
/// # Errors
///
/// Returns `Socks5Error::MethodRejected` unless the reply is exactly `05 00`.
pub fn check_method_reply(reply: &[u8]) -> Result<(), Socks5Error> {
    if reply == METHOD_ACCEPTED {
        Ok(())
    } else {
        Err(Socks5Error::MethodRejected(reply.to_vec()))
    }
}

/// SHA-1 of `sid`, request id and target jid, used as the CONNECT domain.
pub fn destination_digest(sid: &str, iq_id: &str, jid: &str) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(iq_id.as_bytes());
    hasher.update(jid.as_bytes());
    hasher.finalize().into()
}

/// CONNECT request addressing `digest` as a domain name on port 0.
pub fn connect_request(digest: &[u8; 20]) -> Vec<u8> {
    let mut request = Vec::with_capacity(REPLY_PREFIX_LEN + 1 + digest.len() + PORT_LEN);
    request.extend_from_slice(&[VERSION, CMD_CONNECT, RESERVED, ATYP_DOMAIN]);
    request.push(digest.len() as u8);
    request.extend_from_slice(digest);
    request.extend_from_slice(&[0x00, 0x00]);
    request
}

/// Parses the CONNECT reply at the start of `buf`.
///
/// Returns `Ok(Some(n))` with the reply length, so that `buf[n..]` is the
/// beginning of the payload, or `Ok(None)` if more bytes are needed to reach
/// the end of the reply.
///
/// # Errors
///
/// Returns an error as soon as the bytes seen rule out a successful reply.
pub fn parse_connect_reply(buf: &[u8]) -> Result<Option<usize>, Socks5Error> {
    let expected = [VERSION, REPLY_SUCCEEDED, RESERVED];
    for (i, want) in expected.iter().enumerate() {
        match buf.get(i) {
            Some(got) if got == want => {}
            Some(_) => {
                return Err(Socks5Error::ConnectFailed {
                    version: buf.first().copied().unwrap_or_default(),
                    reply: buf.get(1).copied().unwrap_or_default(),
                    reserved: buf.get(2).copied().unwrap_or_default(),
                })
            }
            None => return Ok(None),
        }
    }

    let Some(&atyp) = buf.get(3) else {
        return Ok(None);
    };
    let address_len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => match buf.get(REPLY_PREFIX_LEN) {
            Some(&len) => 1 + usize::from(len),
            None => return Ok(None),
        },
        other => return Err(Socks5Error::AddressType(other)),
    };

    let reply_len = REPLY_PREFIX_LEN + address_len + PORT_LEN;
    if buf.len() < reply_len {
        Ok(None)
    } else {
        Ok(Some(reply_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_reply() {
        assert!(check_method_reply(&[0x05, 0x00]).is_ok());
        assert_eq!(
            check_method_reply(&[0x05, 0xff]),
            Err(Socks5Error::MethodRejected(vec![0x05, 0xff]))
        );
        assert!(check_method_reply(&[0x05]).is_err());
    }

    #[test]
    fn test_destination_digest_is_sha1_of_concatenation() {
        // sha1("abc")
        let expected = [
            0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
            0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
        ];
        assert_eq!(destination_digest("a", "b", "c"), expected);
        assert_eq!(destination_digest("ab", "", "c"), expected);
    }

    #[test]
    fn test_connect_request_layout() {
        let digest = [0xab; 20];
        let request = connect_request(&digest);
        assert_eq!(request.len(), 27);
        assert_eq!(&request[..5], &[0x05, 0x01, 0x00, 0x03, 20]);
        assert_eq!(&request[5..25], &digest);
        assert_eq!(&request[25..], &[0x00, 0x00]);
    }

    #[test]
    fn test_ipv4_reply_offset() {
        let fixture = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        assert_eq!(parse_connect_reply(&fixture), Ok(Some(10)));
    }

    #[test]
    fn test_ipv4_reply_with_payload() {
        let fixture = [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1e, 0x61, b'h', b'i'];
        let offset = parse_connect_reply(&fixture).ok().flatten().unwrap_or_default();
        assert_eq!(offset, 10);
        assert_eq!(&fixture[offset..], b"hi");
    }

    #[test]
    fn test_ipv6_reply_offset() {
        let mut fixture = vec![0x05, 0x00, 0x00, 0x04];
        fixture.extend_from_slice(&[0u8; 16]);
        fixture.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(fixture.len(), 22);
        assert_eq!(parse_connect_reply(&fixture), Ok(Some(22)));
    }

    #[test]
    fn test_domain_reply_offset() {
        let mut fixture = vec![0x05, 0x00, 0x00, 0x03, 20];
        fixture.extend_from_slice(&[0x11; 20]);
        fixture.extend_from_slice(&[0x00, 0x00]);
        fixture.extend_from_slice(b"payload");
        assert_eq!(parse_connect_reply(&fixture), Ok(Some(27)));
        assert_eq!(&fixture[27..], b"payload");
    }

    #[test]
    fn test_truncated_reply_needs_more() {
        let full = [0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0, 80];
        for len in 0..full.len() {
            assert_eq!(parse_connect_reply(&full[..len]), Ok(None), "prefix {len}");
        }
        assert_eq!(parse_connect_reply(&[0x05, 0x00, 0x00, 0x03]), Ok(None));
    }

    #[test]
    fn test_failed_reply() {
        assert_eq!(
            parse_connect_reply(&[0x05, 0x05, 0x00, 0x01]),
            Err(Socks5Error::ConnectFailed {
                version: 0x05,
                reply: 0x05,
                reserved: 0x00
            })
        );
        assert!(parse_connect_reply(&[0x04]).is_err());
        assert!(parse_connect_reply(&[0x05, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_unknown_address_type() {
        assert_eq!(
            parse_connect_reply(&[0x05, 0x00, 0x00, 0x02, 0, 0]),
            Err(Socks5Error::AddressType(0x02))
        );
    }
}
