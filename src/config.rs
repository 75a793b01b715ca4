use crate::errors::RelayError;

/// process-wide relay configuration, passed into each [`TunnelEndpoint`](crate::endpoint::TunnelEndpoint)
/// at construction rather than read from a global, so the core stays testable
/// in isolation from however a caller loads its CLI/config file.
#[derive(Debug, Clone)]
pub struct Config {
    /// 16-byte pre-shared key. `None` disables both the stream cipher and the
    /// HMAC digest; the carrier is then assumed to provide confidentiality
    /// and integrity on its own (i.e. `tun_ssl` must be set).
    key: Option<[u8; 16]>,
    /// whether the WebSocket carrier is TLS-protected. When true, REQ
    /// timestamp expiry is not enforced, since replay protection is the
    /// carrier's job.
    pub tun_ssl: bool,
    /// when true, every constructed endpoint registers a weak handle in the
    /// process-wide diagnostics registry for leak detection.
    pub debug: bool,
}

impl Config {
    /// build a validated config.
    ///
    /// rejects `key: None` combined with `tun_ssl: false`: such a deployment
    /// can neither authenticate frames nor rely on the carrier for
    /// confidentiality, which this relay never allows.
    pub fn new(key: Option<[u8; 16]>, tun_ssl: bool, debug: bool) -> Result<Self, RelayError> {
        if key.is_none() && !tun_ssl {
            return Err(RelayError::InsecureConfig);
        }
        Ok(Self {
            key,
            tun_ssl,
            debug,
        })
    }

    pub fn key(&self) -> Option<&[u8; 16]> {
        self.key.as_ref()
    }

    pub fn keyed(&self) -> bool {
        self.key.is_some()
    }
}
