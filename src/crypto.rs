use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::config::Config;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// 20-byte HMAC-SHA1 trailer binding the CMD byte and ciphertext body of a
/// REQ or RST frame.
pub const DIGEST_LEN: usize = 20;

/// optional AES-128-CTR stream cipher plus HMAC-SHA1 digest over framed
/// payloads.
///
/// the stream cipher state is monotonic: every byte ever encrypted advances
/// the encryptor, every byte ever decrypted advances the decryptor. REQ,
/// DAT and RST bodies share one stream in each direction, so the two
/// directions must never be read back out of the order they were written.
/// when `key` is absent the cipher is inert (`encrypt`/`decrypt` are
/// identity) but the digest, keyed by the same pre-shared key, still
/// requires one — callers must not construct a `Cryptor` without a key.
pub struct Cryptor {
    key: [u8; 16],
    encryptor: Option<Aes128Ctr>,
    decryptor: Option<Aes128Ctr>,
}

impl Cryptor {
    /// construct an inert cryptor for unkeyed deployments (TLS carrier).
    /// `digest`/`verify` are unavailable; frames carry no HMAC trailer in
    /// this mode (see [`Config`]).
    pub fn unkeyed() -> Self {
        Self {
            key: [0u8; 16],
            encryptor: None,
            decryptor: None,
        }
    }

    /// construct a keyed cryptor and start both streams at `nonce`.
    ///
    /// encryptor and decryptor are independent streams, each monotonically
    /// advanced by every call to [`Cryptor::encrypt`] / [`Cryptor::decrypt`]
    /// respectively; neither is ever rewound.
    pub fn init(key: [u8; 16], nonce: [u8; 16]) -> Self {
        let encryptor = Aes128Ctr::new((&key).into(), (&nonce).into());
        let decryptor = Aes128Ctr::new((&key).into(), (&nonce).into());
        Self {
            key,
            encryptor: Some(encryptor),
            decryptor: Some(decryptor),
        }
    }

    pub fn from_config(cfg: &Config, nonce: [u8; 16]) -> Self {
        match cfg.key() {
            Some(key) => Self::init(*key, nonce),
            None => Self::unkeyed(),
        }
    }

    pub fn keyed(&self) -> bool {
        self.encryptor.is_some()
    }

    /// encrypt `buf` in place, advancing the encryptor stream by `buf.len()`
    /// bytes. identity when unkeyed.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        if let Some(enc) = self.encryptor.as_mut() {
            enc.apply_keystream(buf);
        }
    }

    /// decrypt `buf` in place, advancing the decryptor stream by `buf.len()`
    /// bytes. identity when unkeyed.
    ///
    /// callers MUST verify the frame's digest before calling this: advancing
    /// the decryptor on an unauthenticated frame desyncs every subsequent
    /// frame on this tunnel.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        if let Some(dec) = self.decryptor.as_mut() {
            dec.apply_keystream(buf);
        }
    }

    /// HMAC-SHA1 over `data` under the pre-shared key.
    pub fn digest(&self, data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut mac = HmacSha1::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// constant-time digest comparison.
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        let mut mac = HmacSha1::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}
