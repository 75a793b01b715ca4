//! the per-tunnel state machine.
//!
//! ```text
//!  Idle  --[set_proxy]-------------->  Using
//!  Using --[local peer resets]----->  Resetting   (send RST, cancel pump, close local)
//!  Using --[remote RST received]-->   Idle        (send RST, cancel pump, close local)
//!  Resetting --[remote RST recv]-->   Idle        (succeed_reset)
//!  Idle  --[unexpected RST recv]-->   (closed with code 3001)
//!  Resetting --[set_proxy]--------->  (forbidden; must wait for Idle)
//! ```
//!
//! `Using` and `Resetting` are kept distinct rather than merged because the
//! two paths back to `Idle` carry different obligations: when the remote
//! initiates reset while we're `Using`, we can acknowledge and drop straight
//! to `Idle` in one step, since the peer already knows the tunnel is being
//! torn down. When we initiate, we must wait for the peer's confirming RST
//! before the tunnel is safe to hand to a new logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Using,
    Resetting,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Idle => "idle",
            TunnelState::Using => "using",
            TunnelState::Resetting => "resetting",
        }
    }
}
