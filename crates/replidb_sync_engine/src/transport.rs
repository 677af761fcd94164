//! Communicator abstraction.
//!
//! The coordinator never moves bytes itself. It asks a
//! [`CommunicatorAggregator`] for a [`Communicator`] per label (the main
//! label plus one per equal identifier) and hands encoded frames to it.
//! Inbound frames come back through
//! [`SyncCoordinator::on_message_received`](crate::SyncCoordinator::on_message_received).

use crate::error::SyncResult;
use std::sync::Arc;

/// Sends frames to peers under one identity.
pub trait Communicator: Send + Sync {
    /// Sends an encoded frame to `peer`.
    fn send(&self, peer: &str, bytes: Vec<u8>) -> SyncResult<()>;

    /// Returns true if `peer` is currently reachable.
    fn is_peer_online(&self, peer: &str) -> bool;

    /// Identity of the local node on this communicator.
    fn local_identity(&self) -> SyncResult<String>;
}

/// Allocates communicators by label.
pub trait CommunicatorAggregator: Send + Sync {
    /// Returns the communicator for `label`, allocating it if needed.
    fn communicator(&self, label: &str) -> SyncResult<Arc<dyn Communicator>>;
}

/// Masks a peer id for log output, keeping only its first and last characters.
pub fn mask_peer(peer: &str) -> String {
    let chars: Vec<char> = peer.chars().collect();
    match chars.len() {
        0 => String::new(),
        1..=4 => "***".to_string(),
        n => format!("{}***{}", chars[0], chars[n - 1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_peer_ids() {
        assert_eq!(mask_peer(""), "");
        assert_eq!(mask_peer("abc"), "***");
        assert_eq!(mask_peer("device-42"), "d***2");
    }
}
