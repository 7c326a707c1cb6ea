use std::fmt;

use serde::{Deserialize, Serialize};

pub type MemberId = u64;

/// Ledger ids are assigned by the ledger service. Their numeric value carries
/// no ordering meaning; replay order comes from the log index only.
pub type LedgerId = i64;

/// Version token of a coordination node, used for compare-and-swap writes.
pub type Version = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
}

/// Connectivity to the coordination service as reported by its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    /// Temporarily disconnected; the session may still be alive.
    Suspended,
    /// Session expired.
    Lost,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// A coordination node's data together with its version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub data: Vec<u8>,
    pub version: Version,
}

/// Four byte fingerprint of a keyspace name, shared by every member.
///
/// CRC-32C of the UTF-8 name, least significant byte first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyspaceId(pub [u8; 4]);

impl KeyspaceId {
    pub fn from_name(name: &str) -> Self {
        Self(crc32c::crc32c(name.as_bytes()).to_le_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Upper-case hex form used in coordination paths.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Debug for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyspaceId({})", self.to_hex())
    }
}

impl fmt::Display for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One published ledger in a member's log list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub ledger_id: LedgerId,
    /// Commit time in unix millis. Diagnostic only, never used for ordering.
    pub timestamp: i64,
}

impl LogRecord {
    pub const ENCODED_LEN: usize = 16;

    pub fn new(ledger_id: LedgerId, timestamp: i64) -> Self {
        Self {
            ledger_id,
            timestamp,
        }
    }
}

/// Metadata returned when opening a ledger for reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerMetadata {
    pub id: LedgerId,
    pub ensemble_size: usize,
    pub write_quorum: usize,
    pub ack_quorum: usize,
    /// Number of entries confirmed by the ack quorum.
    pub confirmed: u64,
    pub closed: bool,
}
