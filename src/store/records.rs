//! Record and wire-DTO types for the membership tables.
//!
//! `NodeRecord` is the live row in `node_info`; `NodeLegacyRecord` is its
//! tombstone in `node_info_legacy`; `NodeEvent` is the append-or-touch
//! cluster event log.  `FreshNodeInfo` / `RegisteredNodeInfo` are the
//! flat, URL-encodable DTOs exchanged between peers.

use serde::{Deserialize, Serialize};

use crate::netutil;

/// Cluster event kinds recorded in `node_log`.
///
/// Wire values are fixed; they are shared with every other fleet member
/// reading the same tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeEventType {
    /// The node reports itself as active.
    ReportActive = 0,
    /// A fresh master joined.
    FreshMasterJoined = 1,
    /// An existing master withdrew.
    ExistedMasterWithdrawn = 2,
    /// A fresh slave joined.
    FreshSlaveJoined = 3,
    /// An existing slave withdrew.
    ExistedSlaveWithdrawn = 4,
    /// A slave reported its master inactive.
    SlaveReportedMasterInactive = 5,
    /// The master reported a slave inactive.
    MasterReportedSlaveInactive = 6,
}

/// A live membership row, keyed by a monotonically assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u64,
    pub name: String,
    pub node_version: String,
    pub host: String,
    pub port: u16,
    /// 0 is the top of the hierarchy; a slave sits at `master.level + 1`.
    pub level: u8,
    /// Parent node id, or 0 for top-level.
    pub superior_id: u64,
    /// Ordinal among siblings; smaller takes over earlier.  0 is the
    /// master's own slot.
    pub turn: u64,
    /// Optimistic-lock counter; every mutation increments it.
    pub version: u64,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub updated_at: i64,
}

impl NodeRecord {
    /// A pre-registration record for this process (no id yet).
    pub fn new(name: &str, node_version: &str, port: u16, level: u8) -> Self {
        NodeRecord {
            id: 0,
            name: name.to_string(),
            node_version: node_version.to_string(),
            host: String::new(),
            port,
            level,
            superior_id: 0,
            turn: 0,
            version: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// `host:port`, bracketing IPv6 hosts.
    pub fn socket(&self) -> String {
        netutil::format_socket(&self.host, self.port)
    }

    /// Socket equality with loopback equivalence.
    pub fn is_socket_equal(&self, other: &NodeRecord) -> bool {
        netutil::sockets_equal(&self.host, self.port, &other.host, other.port)
    }

    /// Whether the identifying fields agree with another snapshot.
    ///
    /// Used by the master's periodic self-check: a mismatch means the
    /// stored row was rewritten behind this process's back.
    pub fn matches(&self, other: &NodeRecord) -> bool {
        self.id == other.id
            && self.host == other.host
            && self.port == other.port
            && self.level == other.level
            && self.superior_id == other.superior_id
            && self.turn == other.turn
    }

    /// The identity fields a fresh peer presents.
    pub fn fresh_info(&self) -> FreshNodeInfo {
        FreshNodeInfo {
            name: self.name.clone(),
            node_version: self.node_version.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// The registered view of this record, as sent in control-plane
    /// notifications.
    pub fn to_registered(&self, retry: u8) -> RegisteredNodeInfo {
        RegisteredNodeInfo {
            name: self.name.clone(),
            node_version: self.node_version.clone(),
            host: self.host.clone(),
            port: self.port,
            id: self.id,
            level: self.level,
            superior_id: self.superior_id,
            turn: self.turn,
            retry,
        }
    }
}

impl std::fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:10} | {:>39}:{:<5} | Superior: {:10} | Level: {:3} | Turn: {:3}",
            self.id, self.host, self.port, self.superior_id, self.level, self.turn
        )
    }
}

/// A tombstone row: the last-observed field snapshot of a deleted node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLegacyRecord {
    pub id: u64,
    pub name: String,
    pub node_version: String,
    pub host: String,
    pub port: u16,
    pub level: u8,
    pub superior_id: u64,
    pub turn: u64,
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A cluster event row, keyed `(node_id, type, target_node_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
    pub id: u64,
    pub node_id: u64,
    pub event_type: u8,
    pub target_node_id: u64,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: u64,
}

/// Identity an unregistered peer presents when asking the master to add
/// it.  Also the form body of the admission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshNodeInfo {
    pub name: String,
    pub node_version: String,
    pub host: String,
    pub port: u16,
}

impl FreshNodeInfo {
    /// URL-encode as a form body / query string.
    pub fn encode(&self) -> String {
        serde_urlencoded::to_string(self).unwrap_or_default()
    }
}

impl std::fmt::Display for FreshNodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Fresh Node: {:>39}:{:<5} | {} @ {}",
            self.host, self.port, self.name, self.node_version
        )
    }
}

/// A registered peer: fresh identity plus the fields the store assigned.
/// Kept flat so it round-trips through URL encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredNodeInfo {
    pub name: String,
    pub node_version: String,
    pub host: String,
    pub port: u16,
    pub id: u64,
    pub level: u8,
    pub superior_id: u64,
    pub turn: u64,
    #[serde(default)]
    pub retry: u8,
}

impl RegisteredNodeInfo {
    /// URL-encode as a form body.
    pub fn encode(&self) -> String {
        serde_urlencoded::to_string(self).unwrap_or_default()
    }

    /// The fresh-identity subset of this record.
    pub fn fresh_info(&self) -> FreshNodeInfo {
        FreshNodeInfo {
            name: self.name.clone(),
            node_version: self.node_version.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}
