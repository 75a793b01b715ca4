//! debug-only leak diagnostics: a process-wide (or caller-owned) registry of
//! weak handles to live [`crate::endpoint::TunnelEndpoint`]s.
//!
//! a cleared `Weak` is simply skipped rather than treated as an error, so a
//! duplicate `on_close` call — which would otherwise mean "remove this
//! endpoint from the set twice" — is a no-op rather than a panic. pruning is
//! lazy: dead entries are dropped the next time the registry is touched,
//! never eagerly.

use std::sync::{Arc, Mutex, Weak};

/// an opaque liveness token. a [`TunnelEndpoint`](crate::endpoint::TunnelEndpoint)
/// holds the `Arc`, the registry only ever sees a `Weak` clone of it, so
/// registration can never keep an endpoint alive.
pub type LiveToken = Arc<()>;

#[derive(Default)]
pub struct DiagnosticsRegistry {
    entries: Mutex<Vec<Weak<()>>>,
}

impl DiagnosticsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// register a new live endpoint, returning the token it must hold for
    /// as long as it's alive.
    pub fn register(&self) -> LiveToken {
        let token = Arc::new(());
        let mut entries = self.entries.lock().expect("diagnostics mutex poisoned");
        entries.push(Arc::downgrade(&token));
        token
    }

    /// number of tokens still alive, pruning dead ones first.
    pub fn live_count(&self) -> usize {
        let mut entries = self.entries.lock().expect("diagnostics mutex poisoned");
        entries.retain(|w| w.strong_count() > 0);
        entries.len()
    }
}
