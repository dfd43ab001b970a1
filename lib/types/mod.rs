use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a space server in the cluster.
pub type ServerId = u32;

/// Sentinel meaning "no server known"; never a valid owner.
pub const NULL_SERVER_ID: ServerId = 0;

/// Opaque 128-bit handle for an object in the world.
///
/// Only equality, hashing, and the hex form used in store keys matter here;
/// the directory never interprets the bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u128);

impl ObjectId {
    pub const fn from_u128(raw: u128) -> Self {
        Self(raw)
    }

    /// 32 lowercase hex characters, the persisted form.
    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn from_hex(raw: &str) -> Option<Self> {
        if raw.len() != 32 {
            return None;
        }
        u128::from_str_radix(raw, 16).ok().map(Self)
    }

    /// Folds the id down to 64 bits for use as a deterministic retry seed.
    pub fn fold64(&self) -> u64 {
        (self.0 as u64) ^ ((self.0 >> 64) as u64)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:032x})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Which server hosts an object, plus its interest radius.
///
/// Immutable value type; "unresolved" is `Option::<Entry>::None` at API
/// boundaries rather than a null sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub server: ServerId,
    pub radius: f64,
}

impl Entry {
    pub fn new(server: ServerId, radius: f64) -> Self {
        Self { server, radius }
    }
}

/// Terminal outcome of a directory write, delivered through [`WriteListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Success,
    AlreadyRegistered,
    UnknownError,
}

/// Acknowledgment sent by the new owner of a migrated object back to the old
/// owner once ownership is durably recorded in the store.
///
/// The old owner must keep the object's connection alive until this arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateAck {
    pub from_server: ServerId,
    pub to_server: ServerId,
    pub object_id: ObjectId,
    pub radius: f64,
}

/// Cache-invalidation push from elsewhere in the cluster: "object X is now
/// hosted on server S". Applied straight to the local lookup cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipUpdate {
    pub object_id: ObjectId,
    pub hosting_server: ServerId,
    pub radius: f64,
}

/// Receives lookup completions. `None` means the lookup resolved to
/// "unresolved" (not found yet, or the store errored out); the caller may
/// retry independently.
pub trait LookupListener: Send + Sync {
    fn oseg_lookup_completed(&self, id: ObjectId, entry: Option<Entry>);
}

/// Receives write-side terminal outcomes.
pub trait WriteListener: Send + Sync {
    fn oseg_add_new_finished(&self, id: ObjectId, status: WriteStatus);

    /// The old owner's signal that the new owner has durably recorded
    /// ownership; the object's connection may now be torn down.
    fn oseg_migration_acknowledged(&self, id: ObjectId);
}

/// Outbound path for acknowledgment messages. The transport itself is
/// external; `try_route` returns whether the transport accepted the message
/// for delivery. The ack dispatcher retries until it does.
pub trait ServerMessageRouter: Send + Sync {
    fn try_route(&self, ack: &MigrateAck) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_hex_round_trips() {
        let id = ObjectId::from_u128(0xdead_beef_0000_0000_0000_0000_0000_1234);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(ObjectId::from_hex(&hex), Some(id));
    }

    #[test]
    fn object_id_rejects_bad_hex() {
        assert_eq!(ObjectId::from_hex("zz"), None);
        assert_eq!(ObjectId::from_hex(&"f".repeat(31)), None);
    }

    #[test]
    fn migrate_ack_survives_a_serde_round_trip() {
        let ack = MigrateAck {
            from_server: 2,
            to_server: 1,
            object_id: ObjectId::from_u128(0xfeed),
            radius: 5.0,
        };
        let raw = serde_json::to_string(&ack).expect("serializes");
        let back: MigrateAck = serde_json::from_str(&raw).expect("deserializes");
        assert_eq!(back, ack);
    }
}
