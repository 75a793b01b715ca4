//! wire framing for REQ, DAT and RST command messages.
//!
//! exactly one frame travels per WebSocket binary message. CMD_REQ and
//! CMD_RST are cleartext tags followed by an encrypted body and an
//! HMAC-SHA1 trailer over `cmd || ciphertext`; CMD_DAT has no trailer at
//! all and its command byte is itself part of the ciphertext — the
//! asymmetry is deliberate, trading DAT integrity for throughput (see
//! module docs on [`crate::crypto`]).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::crypto::{Cryptor, DIGEST_LEN};
use crate::errors::FrameError;
use crate::socks_addr::{encode_socks_addr, parse_socks_addr, SocksAddr};

pub const CMD_REQ: u8 = 0x00;
pub const CMD_DAT: u8 = 0x01;
pub const CMD_RST: u8 = 0x02;

const TIMESTAMP_LEN: usize = 8;
pub const REQ_TTL: Duration = Duration::from_secs(15);
/// bound on how much decrypted plaintext a decode-failure log line carries,
/// so a malicious or desynced peer can't inflate log volume.
pub const DAT_LOG_MAX_LEN: usize = 270;

/// current time as a big-endian IEEE-754 double, matching the wire format.
/// present even when `tun_ssl` makes it meaningless, so both peers share one
/// format.
pub fn now_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// build a REQ frame: `CMD_REQ || encrypt(timestamp || addr_header || remain) || hmac`.
///
/// the trailer is omitted entirely when `cryptor` is unkeyed — that mode is
/// only reachable with `tun_ssl = true` (see [`crate::config::Config`]), so
/// the carrier itself is relied on for integrity.
pub fn make_relay_header(
    cryptor: &mut Cryptor,
    timestamp: f64,
    addr_header: &[u8],
    remain: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(TIMESTAMP_LEN + addr_header.len() + remain.len());
    body.extend_from_slice(&timestamp.to_be_bytes());
    body.extend_from_slice(addr_header);
    body.extend_from_slice(remain);
    cryptor.encrypt(&mut body);

    let mut frame = Vec::with_capacity(1 + body.len() + DIGEST_LEN);
    frame.push(CMD_REQ);
    frame.extend_from_slice(&body);
    if cryptor.keyed() {
        let digest = cryptor.digest(&frame);
        frame.extend_from_slice(&digest);
    }
    frame
}

/// convenience wrapper around [`make_relay_header`] stamping the current time.
pub fn make_relay_header_now(
    cryptor: &mut Cryptor,
    addr: &SocksAddr,
    port: u16,
    remain: &[u8],
) -> Vec<u8> {
    let hdr = encode_socks_addr(addr, port);
    make_relay_header(cryptor, now_f64(), &hdr, remain)
}

/// decode a REQ frame, returning `(addr, port, remain)`.
///
/// the HMAC is checked before the decryptor ever touches the ciphertext: a
/// failed check must not advance cipher state, since that state is shared
/// by every later frame on this tunnel.
pub fn parse_relay_header(
    cryptor: &mut Cryptor,
    dat: &[u8],
    tun_ssl: bool,
    now: f64,
) -> Result<(SocksAddr, u16, Vec<u8>), FrameError> {
    let signed = if cryptor.keyed() {
        if dat.len() < 1 + DIGEST_LEN {
            return Err(FrameError::DigestLength(dat.len()));
        }
        let (signed, tag) = dat.split_at(dat.len() - DIGEST_LEN);
        if !cryptor.verify(signed, tag) {
            return Err(FrameError::AuthFailed);
        }
        signed
    } else {
        if dat.is_empty() {
            return Err(FrameError::DigestLength(0));
        }
        dat
    };

    let mut body = signed[1..].to_vec();
    cryptor.decrypt(&mut body);

    if body.len() < TIMESTAMP_LEN {
        return Err(FrameError::InvalidTimestamp);
    }
    let mut ts_bytes = [0u8; TIMESTAMP_LEN];
    ts_bytes.copy_from_slice(&body[..TIMESTAMP_LEN]);
    let timestamp = f64::from_be_bytes(ts_bytes);

    if !tun_ssl && now > timestamp + REQ_TTL.as_secs_f64() {
        return Err(FrameError::Expired);
    }

    let (addr, port, consumed) = parse_socks_addr(&body[TIMESTAMP_LEN..])?;
    let remain = body[TIMESTAMP_LEN + consumed..].to_vec();
    Ok((addr, port, remain))
}

/// build a DAT frame: `encrypt(CMD_DAT || payload)`, no trailer.
pub fn make_dat_frame(cryptor: &mut Cryptor, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(CMD_DAT);
    frame.extend_from_slice(payload);
    cryptor.encrypt(&mut frame);
    frame
}

/// decrypt a DAT frame whole and strip the leading command byte.
pub fn parse_dat_frame(cryptor: &mut Cryptor, dat: &[u8]) -> Vec<u8> {
    let mut body = dat.to_vec();
    cryptor.decrypt(&mut body);
    if body.is_empty() {
        body
    } else {
        body.split_off(1)
    }
}

/// build an RST frame. an empty `reason` is padded to a random length in
/// `[2, 8)` spaces so RST length alone can't identify the command when the
/// carrier isn't TLS.
pub fn make_reset_message(cryptor: &mut Cryptor, reason: &str, rng: &mut impl Rng) -> Vec<u8> {
    let padded;
    let body_str: &str = if reason.is_empty() {
        let len = rng.gen_range(2..8);
        padded = " ".repeat(len);
        &padded
    } else {
        reason
    };

    let mut body = body_str.as_bytes().to_vec();
    cryptor.encrypt(&mut body);

    let mut frame = Vec::with_capacity(1 + body.len() + DIGEST_LEN);
    frame.push(CMD_RST);
    frame.extend_from_slice(&body);
    if cryptor.keyed() {
        let digest = cryptor.digest(&frame);
        frame.extend_from_slice(&digest);
    }
    frame
}

/// decode an RST frame's reason text (callers typically only care that the
/// frame validated, not its contents).
pub fn parse_reset_message(cryptor: &mut Cryptor, dat: &[u8]) -> Result<String, FrameError> {
    let signed = if cryptor.keyed() {
        if dat.len() < 1 + DIGEST_LEN {
            return Err(FrameError::DigestLength(dat.len()));
        }
        let (signed, tag) = dat.split_at(dat.len() - DIGEST_LEN);
        if !cryptor.verify(signed, tag) {
            return Err(FrameError::AuthFailed);
        }
        signed
    } else {
        if dat.is_empty() {
            return Err(FrameError::DigestLength(0));
        }
        dat
    };
    let mut body = signed[1..].to_vec();
    cryptor.decrypt(&mut body);
    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn keyed_pair() -> (Cryptor, Cryptor) {
        let key = [0u8; 16];
        let nonce = [0u8; 16];
        (Cryptor::init(key, nonce), Cryptor::init(key, nonce))
    }

    #[test]
    fn req_round_trip() {
        let (mut enc, mut dec) = keyed_pair();
        let addr_hdr = [0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90];
        let t = 1_700_000_000.0;
        let frame = make_relay_header(&mut enc, t, &addr_hdr, &[]);
        let (addr, port, remain) = parse_relay_header(&mut dec, &frame, false, t).unwrap();
        assert_eq!(addr, SocksAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(port, 8080);
        assert!(remain.is_empty());
    }

    #[test]
    fn req_expires_without_tls() {
        let (mut enc, mut dec) = keyed_pair();
        let addr_hdr = [0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90];
        let t = 1_700_000_000.0;
        let frame = make_relay_header(&mut enc, t, &addr_hdr, &[]);
        let err = parse_relay_header(&mut dec, &frame, false, t + 20.0).unwrap_err();
        assert!(matches!(err, FrameError::Expired));
    }

    #[test]
    fn req_does_not_expire_over_tls() {
        let (mut enc, mut dec) = keyed_pair();
        let addr_hdr = [0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90];
        let t = 1_700_000_000.0;
        let frame = make_relay_header(&mut enc, t, &addr_hdr, &[]);
        assert!(parse_relay_header(&mut dec, &frame, true, t + 1_000_000.0).is_ok());
    }

    #[test]
    fn tampered_req_fails_auth() {
        let (mut enc, mut dec) = keyed_pair();
        let addr_hdr = [0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90];
        let t = 1_700_000_000.0;
        let mut frame = make_relay_header(&mut enc, t, &addr_hdr, &[]);
        *frame.last_mut().unwrap() ^= 0xFF;
        let err = parse_relay_header(&mut dec, &frame, false, t).unwrap_err();
        assert!(matches!(err, FrameError::AuthFailed));
    }

    #[test]
    fn short_frame_is_digest_length_error() {
        let mut dec = Cryptor::init([0u8; 16], [0u8; 16]);
        let err = parse_relay_header(&mut dec, &[0x00, 0x01], false, 0.0).unwrap_err();
        assert!(matches!(err, FrameError::DigestLength(_)));
    }

    #[test]
    fn dat_round_trip() {
        let (mut enc, mut dec) = keyed_pair();
        let frame = make_dat_frame(&mut enc, b"payload bytes");
        let payload = parse_dat_frame(&mut dec, &frame);
        assert_eq!(payload, b"payload bytes");
    }

    #[test]
    fn rst_round_trip_with_reason() {
        let (mut enc, mut dec) = keyed_pair();
        let mut rng = rand::thread_rng();
        let frame = make_reset_message(&mut enc, "connection to target broken", &mut rng);
        let reason = parse_reset_message(&mut dec, &frame).unwrap();
        assert_eq!(reason, "connection to target broken");
    }

    #[test]
    fn rst_empty_reason_is_padded_and_variable_length() {
        let (mut enc, _dec) = keyed_pair();
        let mut rng = rand::thread_rng();
        let a = make_reset_message(&mut enc, "", &mut rng);
        assert!(a.len() >= 1 + 2 + DIGEST_LEN);
        assert!(a.len() <= 1 + 7 + DIGEST_LEN);
    }

    #[test]
    fn tampered_rst_fails_auth() {
        let (mut enc, mut dec) = keyed_pair();
        let mut rng = rand::thread_rng();
        let mut frame = make_reset_message(&mut enc, "bye", &mut rng);
        *frame.last_mut().unwrap() ^= 0xFF;
        assert!(matches!(
            parse_reset_message(&mut dec, &frame).unwrap_err(),
            FrameError::AuthFailed
        ));
    }

    #[test]
    fn cipher_state_is_monotonic_across_frame_kinds() {
        let (mut enc, mut dec) = keyed_pair();
        let addr_hdr = [0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90];
        let t = 1_700_000_000.0;
        let req = make_relay_header(&mut enc, t, &addr_hdr, &[]);
        let dat = make_dat_frame(&mut enc, b"chunk one");
        let mut rng = rand::thread_rng();
        let rst = make_reset_message(&mut enc, "done", &mut rng);

        parse_relay_header(&mut dec, &req, false, t).unwrap();
        assert_eq!(parse_dat_frame(&mut dec, &dat), b"chunk one");
        assert_eq!(parse_reset_message(&mut dec, &rst).unwrap(), "done");
    }
}
