//! Security boundary for the daemon: bearer tokens, the pairing exchange,
//! filesystem path scoping, and network destination policy.

pub mod error;
pub mod gate;
pub mod network;
pub mod pairing;
pub mod path;
pub mod token;

pub use {
    error::{AuthError, PairingError, Result, SecurityError},
    gate::SecurityGate,
    network::{NetworkDecision, NetworkPolicy, is_loopback},
    pairing::PairingGuard,
    path::{PathPolicy, ScopedPath, glob_match, scope_path},
    token::{PairingToken, TokenStore},
};
