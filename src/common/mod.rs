//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common types used throughout the library.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

pub mod actor;

/// Common Result type, using `anyhow::Error` for Error.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Server-assigned identifier of a published offer.
pub type OfferId = String;

/// Server-assigned identifier of a registered peer.
pub type PeerId = String;

/// Locally-assigned identifier for one peer-connection handshake,
/// used for logging and routing observer callbacks.
pub type ConnectionId = u64;

/// Server-side record timestamp in unix milliseconds. Used as the
/// monotonic `since` watermark for incremental polling.
pub type ServerTimestamp = u64;

/// Which side of the offer/answer exchange a peer is on.
///
/// ICE candidate records carry the role of the peer that produced them,
/// so each side applies only candidates from the opposite role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Self::Offerer => Self::Answerer,
            Self::Answerer => Self::Offerer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Offerer => write!(f, "offerer"),
            Self::Answerer => write!(f, "answerer"),
        }
    }
}

/// Hands out process-unique connection ids, so sessions surfaced by a
/// republished offer pool can never collide with older ones.
pub fn next_connection_id() -> ConnectionId {
    static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
    NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// Wall-clock now as unix milliseconds, for signature messages and
/// watermark comparisons against server records.
pub fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_opposite() {
        assert_eq!(Role::Offerer.opposite(), Role::Answerer);
        assert_eq!(Role::Answerer.opposite(), Role::Offerer);
    }

    #[test]
    fn role_wire_form() {
        assert_eq!(serde_json::to_string(&Role::Offerer).unwrap(), "\"offerer\"");
        let parsed: Role = serde_json::from_str("\"answerer\"").unwrap();
        assert_eq!(parsed, Role::Answerer);
    }
}
