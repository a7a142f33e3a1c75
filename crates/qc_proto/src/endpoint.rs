//! Endpoint addressing.
//!
//! An endpoint is the pair `(accountDigest, deviceId)`. Both are opaque
//! strings; the pair is normalised (uppercased digest, trimmed device id)
//! before use anywhere as a map key, so two spellings of the same endpoint
//! can never shadow each other.

use serde::{Deserialize, Serialize};

pub const PEER_KEY_SEPARATOR: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub account_digest: String,
    pub device_id: String,
}

impl Endpoint {
    /// Build a normalised endpoint.
    pub fn new(account_digest: &str, device_id: &str) -> Self {
        Self {
            account_digest: account_digest.trim().to_uppercase(),
            device_id: device_id.trim().to_string(),
        }
    }

    /// `accountDigest || "::" || deviceId` — the canonical map key.
    pub fn peer_key(&self) -> String {
        format!("{}{}{}", self.account_digest, PEER_KEY_SEPARATOR, self.device_id)
    }

    pub fn parse_peer_key(key: &str) -> Option<Self> {
        let (digest, device) = key.split_once(PEER_KEY_SEPARATOR)?;
        if digest.is_empty() || device.is_empty() {
            return None;
        }
        Some(Self::new(digest, device))
    }
}

/// One conversation with one peer endpoint. Deletion cursors are monotone:
/// once set they never decrease, and nothing at or below a side's cursor is
/// ever surfaced again for that side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationThread {
    pub conversation_id: String,
    pub conversation_token: String,
    pub peer_account_digest: String,
    pub peer_device_id: String,
    /// Last counter deleted at self.
    pub deletion_cursor: Option<u64>,
    /// Last counter the peer reported deleting.
    pub peer_deletion_cursor: Option<u64>,
    #[serde(default)]
    pub tombstoned: bool,
}

impl ConversationThread {
    pub fn peer(&self) -> Endpoint {
        Endpoint::new(&self.peer_account_digest, &self.peer_device_id)
    }

    /// Raise the local deletion cursor. Regressions are ignored, matching the
    /// relay's own rejection of cursor regressions.
    pub fn raise_deletion_cursor(&mut self, cursor: u64) -> bool {
        match self.deletion_cursor {
            Some(current) if cursor <= current => false,
            _ => {
                self.deletion_cursor = Some(cursor);
                true
            }
        }
    }

    pub fn raise_peer_deletion_cursor(&mut self, cursor: u64) -> bool {
        match self.peer_deletion_cursor {
            Some(current) if cursor <= current => false,
            _ => {
                self.peer_deletion_cursor = Some(cursor);
                true
            }
        }
    }

    /// Whether a counter is hidden by the local deletion cursor.
    pub fn is_tombstoned_counter(&self, counter: u64) -> bool {
        self.tombstoned || matches!(self.deletion_cursor, Some(c) if counter <= c)
    }
}
