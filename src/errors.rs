use thiserror::Error;

/// errors surfaced while decoding a REQ or RST frame off the wire
///
/// every variant here is fatal to the current logical connection: a failed
/// digest check means either tampering or cipher-state desync, and there is
/// no safe way to keep using the tunnel after either.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame shorter than digest length, got {0} bytes")]
    DigestLength(usize),
    #[error("hmac verification failed")]
    AuthFailed,
    #[error("invalid timestamp in request header")]
    InvalidTimestamp,
    #[error("request expired")]
    Expired,
    #[error("malformed socks address header")]
    MalformedAddr,
}

/// errors surfaced by the tunnel endpoint and its collaborators
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("local stream io error")]
    Io(#[from] std::io::Error),
    #[error("operation invalid in current tunnel state {0:?}")]
    InvalidState(&'static str),
    #[error("tunnel configured without a pre-shared key over a non-tls carrier")]
    InsecureConfig,
}
