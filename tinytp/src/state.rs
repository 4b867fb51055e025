//! Connection finite-state machine (FSM) types.
//!
//! Transitions live in [`crate::connection`]; this module only names the
//! states so they can be logged, matched on, and reported in errors.
//!
//! ```text
//!            discover_request        discovery ok          lookup ok
//!  Idle ───────────────────▶ Discovering ─────▶ LookingUp ─────────▶ Connecting
//!   │ │                          │                 │                    │
//!   │ │ connect_request          └──── failure ────┴──▶ Idle            │ connect ok
//!   │ └──────────────────────────────────────────────────────────────▶ │
//!   │                                                                   ▼
//!   │ listen_request    indication      connect_response + accept ok
//!   └──────────▶ Listening ─────▶ Accepting ─────────────────────▶ Connected
//!                                                                       │
//!                               disconnect (local or peer) / link error │
//!                Idle ◀──────────────── Disconnecting ◀────────────────┘
//! ```

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// No link; initial state.
    #[default]
    Idle,
    /// A discovery is outstanding at the link layer.
    Discovering,
    /// Querying the discovered device for the service's LSAP selector.
    LookingUp,
    /// Link-level connect sent; waiting for the peer's Connect PDU.
    Connecting,
    /// Listen posted; waiting for a peer to connect.
    Listening,
    /// A peer connected; waiting for `connect_response` and the accept to
    /// complete.
    Accepting,
    /// Data transfer in progress.
    Connected,
    /// Link-level disconnect sent; waiting for it to complete.
    Disconnecting,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
